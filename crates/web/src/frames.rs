//! Text frames exchanged on the `/rpc` WebSocket.
//!
//! One request per operation; the server answers with zero or more reply
//! frames, the last of which carries `done: true`. Errors travel as a
//! structured report with a stable code.

use pdq_common::ErrorReport;
use serde::{Deserialize, Serialize};

/// A client request: target handle, method, and method arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequestFrame {
    /// Client-chosen id echoed on every reply.
    pub request_id: i32,
    /// Target handle in `high.low` hex form; empty selects the session's
    /// associated handle.
    #[serde(default)]
    pub object_id: String,
    /// One of `map`, `flatMap`, `sketch`, `zip`, `manage`, `prune`.
    pub method: String,
    /// Method arguments; see [`RequestArguments`].
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Arguments embedded in a request frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestArguments {
    /// Registered op name for map/flatMap/sketch calls.
    #[serde(default)]
    pub op: String,
    /// Serialized op or command body.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Peer handle for zip calls, in `high.low` hex form.
    #[serde(default)]
    pub peer: Option<String>,
}

/// One server reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcReplyFrame {
    /// Echo of the request id.
    pub request_id: i32,
    /// A partial result (`deltaDone` plus optional payload).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error report when `is_error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    /// Whether this reply reports an error.
    pub is_error: bool,
    /// Whether this is the final reply for the request.
    pub done: bool,
}

impl RpcReplyFrame {
    /// A partial-result reply.
    pub fn partial(request_id: i32, result: serde_json::Value) -> Self {
        Self {
            request_id,
            result: Some(result),
            error: None,
            is_error: false,
            done: false,
        }
    }

    /// The closing reply of a successful request.
    pub fn done(request_id: i32) -> Self {
        Self {
            request_id,
            result: None,
            error: None,
            is_error: false,
            done: true,
        }
    }

    /// A terminal error reply.
    pub fn error(request_id: i32, report: ErrorReport) -> Self {
        Self {
            request_id,
            result: None,
            error: Some(report),
            is_error: true,
            done: true,
        }
    }
}
