//! Client-facing web RPC endpoint.
//!
//! Architecture role:
//! - [`frames`]: the request/reply text frame schema
//! - [`server`]: the `/rpc` WebSocket endpoint and session lifecycle
//!
//! Browsers talk to the root server over a WebSocket; each request fans
//! out through the registry exactly like a gRPC command and streams back
//! partial results until a closing frame.

pub mod frames;
pub mod server;

pub use frames::{RequestArguments, RpcReplyFrame, RpcRequestFrame};
pub use server::{router, WebState};
