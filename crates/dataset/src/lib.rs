//! Progressive dataset abstraction.
//!
//! Architecture role:
//! - [`partial`]: progress-delta results that refine toward a final value
//! - [`stream`]: cold, cancellable streams with merge/concat/observe-on
//! - [`scheduler`]: the shared compute pool and per-operation context
//! - [`ops`]: map/sketch/manage contracts supplied by collaborators
//! - [`dataset`]: the `Local | Parallel | Remote` dataset tree
//! - [`remote`]: remote proxies and the transport link seam
//! - [`wire`]: byte-level envelopes crossing the RPC boundary
//!
//! A computation against a dataset fans out across the tree, executes
//! concurrently, and recombines into an ordered stream of partial results
//! whose progress deltas sum to 1.0 on success; the final item is the
//! authoritative result and earlier items are advisory approximations.

pub mod dataset;
pub mod ops;
pub mod partial;
pub mod remote;
pub mod scheduler;
pub mod stream;
pub mod wire;

pub use dataset::{DataSet, LocalDataSet, ParallelDataSet};
pub use ops::{ManageCommand, ManageStatus, MapOp, NamedOp, SketchOp, Wire};
pub use partial::PartialResult;
pub use remote::{RemoteDataSet, RemoteLink, RemoteMethod};
pub use scheduler::{ComputePool, OpContext};
pub use stream::{Event, PartialStream, StreamSubscription, SubscriptionHandle};
pub use wire::{OpEnvelope, WireCommand, WirePartial, ZipBody, PRUNE_OP, UNSUBSCRIBE_OP};
