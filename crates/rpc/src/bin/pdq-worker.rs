use std::net::SocketAddr;
use std::sync::Arc;

use pdq_common::{env_or_default, init_logging, RuntimeConfig};
use pdq_dataset::OpContext;
use pdq_rpc::{install_bootstrap, DataSetRpcServer, DataSetRpcService, OpLibrary, RpcObjectManager};
use tonic::transport::Server;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let bind = env_or_default("PDQ_WORKER_BIND", "0.0.0.0:50071");
    let addr: SocketAddr = bind.parse()?;
    let config = RuntimeConfig::from_env();
    let ctx = OpContext::new(&config)?;

    let manager = Arc::new(RpcObjectManager::new());
    // Deployments register their table loaders and sketches here before
    // installing the bootstrap handle.
    let library = Arc::new(OpLibrary::new());
    let initial = install_bootstrap(&manager, library, config.separate_thread);

    let service = DataSetRpcService::new(manager, ctx);
    info!(%addr, %initial, compute_pool_size = config.compute_pool_size, "pdq-worker started");
    Server::builder()
        .add_service(DataSetRpcServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}
