//! RPC boundary for progressive datasets.
//!
//! Architecture role:
//! - [`target`]: type-erased dataset handles and the named op registry
//! - [`manager`]: object registry, call table, and session bookkeeping
//! - [`dispatch`]: transport-independent command execution
//! - [`grpc`]: tonic service and the gRPC client link
//! - [`link`]: in-process loopback link
//! - [`bootstrap`]: the well-known initial handle
//!
//! A server hosts a registry of live dataset handles; commands address a
//! handle by 128-bit id, name a registered operation, and stream back
//! serialized partial results. Pending calls are addressable for
//! `unsubscribe`; handle lifetimes are reference-counted and released by
//! `prune`.

pub mod bootstrap;
pub mod dispatch;
pub mod grpc;
pub mod link;
pub mod manager;
pub mod target;

pub use bootstrap::{install_bootstrap, BootstrapElement};
pub use dispatch::run_command;
pub use grpc::{
    status_to_error, to_status, DataSetRpcClient, DataSetRpcServer, DataSetRpcService,
    GrpcRemoteLink,
};
pub use link::InProcessLink;
pub use manager::RpcObjectManager;
pub use target::{DataTarget, OpLibrary, TargetDataStream, TargetValueStream, TypedTarget};
