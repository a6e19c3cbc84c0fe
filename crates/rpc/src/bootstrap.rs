//! Bootstrap handle installed by every server at startup.
//!
//! Deployments reach their first dataset through the well-known
//! [`ObjectId::INITIAL`] handle and grow real datasets from it with
//! registered flat-map loaders. The element type at this seam is an
//! opaque JSON value; concrete table representations plug in by
//! registering their own op libraries against it.

use std::sync::Arc;

use pdq_common::ObjectId;
use pdq_dataset::DataSet;
use tracing::info;

use crate::manager::RpcObjectManager;
use crate::target::{OpLibrary, TypedTarget};

/// Element type served by the bootstrap handle.
pub type BootstrapElement = serde_json::Value;

/// Installs the initial bootstrap handle with the given library and
/// returns its well-known id. `separate_thread` controls whether datasets
/// grown from the handle deliver results via the compute pool.
pub fn install_bootstrap(
    manager: &RpcObjectManager,
    library: Arc<OpLibrary<BootstrapElement>>,
    separate_thread: bool,
) -> ObjectId {
    let dataset = DataSet::local_with(BootstrapElement::Null, separate_thread);
    let id = manager.install_initial(TypedTarget::wrap(dataset, library));
    info!(object = %id, "bootstrap handle installed");
    id
}
