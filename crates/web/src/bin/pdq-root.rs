use std::sync::Arc;

use pdq_common::{env_or_default, init_logging, ObjectId, RuntimeConfig};
use pdq_dataset::{DataSet, OpContext};
use pdq_rpc::{
    install_bootstrap, BootstrapElement, GrpcRemoteLink, OpLibrary, RpcObjectManager, TypedTarget,
};
use pdq_web::{router, WebState};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let bind = env_or_default("PDQ_WEB_BIND", "0.0.0.0:8080");
    let workers = env_or_default("PDQ_WORKERS", "");
    let config = RuntimeConfig::from_env();
    let ctx = OpContext::new(&config)?;

    let manager = Arc::new(RpcObjectManager::new());
    // Deployments register their table loaders and sketches here.
    let library: Arc<OpLibrary<BootstrapElement>> = Arc::new(OpLibrary::new());

    let endpoints: Vec<&str> = workers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if endpoints.is_empty() {
        install_bootstrap(&manager, library.clone(), config.separate_thread);
        info!("no workers configured; serving a local bootstrap dataset");
    } else {
        let mut children = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let link = GrpcRemoteLink::connect(endpoint, config.rpc_deadline()).await?;
            children.push(DataSet::remote(link, ObjectId::INITIAL));
            info!(endpoint = %endpoint, "connected worker");
        }
        let root: Arc<DataSet<BootstrapElement>> = DataSet::parallel(children);
        let id = manager.install_initial(TypedTarget::wrap(root, library.clone()));
        info!(object = %id, workers = endpoints.len(), "root dataset installed");
    }

    let state = WebState::new(manager, ctx);
    let listener = TcpListener::bind(&bind).await?;
    info!(%bind, compute_pool_size = config.compute_pool_size, "pdq-root serving /rpc");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
