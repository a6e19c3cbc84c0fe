//! Contracts for the computations a dataset can run: element-wise maps,
//! mergeable sketches, and management commands.
//!
//! Operations cross the RPC boundary by name plus serialized body, so every
//! op is serde-serializable and carries a stable registry name. Element
//! types likewise must be wire-serializable because any dataset may be
//! fragmented across processes.

use pdq_common::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Marker for element and result types that can cross the RPC boundary.
pub trait Wire: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Wire for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// An operation payload addressable by name in a server-side op registry.
pub trait NamedOp: Serialize + Send + Sync + 'static {
    /// Stable registry name; the wire envelope carries it verbatim.
    const NAME: &'static str;
}

/// A deterministic, total, element-wise function `T -> Out`.
///
/// `apply` must be side-effect-free on its input. Failures are reported as
/// [`pdq_common::PdqError::UserCode`] and terminate the operation stream;
/// the source dataset stays valid for retries.
pub trait MapOp<T>: NamedOp {
    /// Output element type.
    type Out: Send + Sync + 'static;

    /// Applies the function to one element.
    fn apply(&self, value: &T) -> Result<Self::Out>;
}

/// A commutative-monoid computation: `zero`, per-element `create`,
/// pairwise `add`.
///
/// `add` must be associative and commutative with `zero` as its identity,
/// and the whole sketch deterministic modulo its seeds; the merge order
/// across a parallel dataset is nondeterministic.
pub trait SketchOp<T>: NamedOp {
    /// Result type of the sketch.
    type Out: Clone + Send + Sync + 'static;

    /// The identity element under [`SketchOp::add`].
    fn zero(&self) -> Self::Out;

    /// Sketches a single element.
    fn create(&self, value: &T) -> Result<Self::Out>;

    /// Combines two partial sketch results.
    fn add(&self, left: Self::Out, right: Self::Out) -> Result<Self::Out>;
}

/// Management commands run against every node of a dataset tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ManageCommand {
    /// Liveness probe; every node answers `ok`.
    Ping,
    /// Reports how many leaf values a node holds.
    LeafCount,
}

impl ManageCommand {
    /// Wire envelope name for management calls.
    pub const NAME: &'static str = "manage";
}

/// One node's answer to a management command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManageStatus {
    /// Which node answered (`local`, `parallel(n)`, `remote <id>`).
    pub node: String,
    /// The node's textual result.
    pub result: String,
}

impl ManageStatus {
    /// Builds a status line.
    pub fn new(node: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            result: result.into(),
        }
    }
}
