//! Full-stack test: tonic server on a loopback socket, gRPC link, remote
//! dataset operations over the real wire.

use std::sync::Arc;

use pdq_common::{ObjectId, PdqError, Result, RuntimeConfig};
use pdq_dataset::{DataSet, MapOp, NamedOp, OpContext, PartialResult, SketchOp};
use pdq_rpc::{
    DataSetRpcServer, DataSetRpcService, GrpcRemoteLink, OpLibrary, RpcObjectManager, TypedTarget,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::TcpListenerStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SumSketch;

impl NamedOp for SumSketch {
    const NAME: &'static str = "sum";
}

impl SketchOp<i64> for SumSketch {
    type Out = i64;

    fn zero(&self) -> i64 {
        0
    }

    fn create(&self, value: &i64) -> Result<i64> {
        Ok(*value)
    }

    fn add(&self, left: i64, right: i64) -> Result<i64> {
        Ok(left + right)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimesTen;

impl NamedOp for TimesTen {
    const NAME: &'static str = "times_ten";
}

impl MapOp<i64> for TimesTen {
    type Out = i64;

    fn apply(&self, value: &i64) -> Result<i64> {
        Ok(value * 10)
    }
}

fn int_library() -> Arc<OpLibrary<i64>> {
    Arc::new_cyclic(|weak: &std::sync::Weak<OpLibrary<i64>>| {
        let mut lib = OpLibrary::new();
        lib.register_sketch::<SumSketch>();
        lib.register_map_deferred::<TimesTen>(weak.clone());
        lib
    })
}

struct Server {
    manager: Arc<RpcObjectManager>,
    endpoint: String,
}

async fn start_server() -> Server {
    let config = RuntimeConfig {
        compute_pool_size: 2,
        ..RuntimeConfig::default()
    };
    let ctx = OpContext::new(&config).expect("context");
    let manager = Arc::new(RpcObjectManager::new());
    let service = DataSetRpcService::new(manager.clone(), ctx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(DataSetRpcServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    Server {
        manager,
        endpoint: format!("http://{addr}"),
    }
}

fn final_payload<R>(partials: Vec<PartialResult<R>>) -> Option<R> {
    partials.into_iter().filter_map(|p| p.payload).last()
}

#[tokio::test]
async fn sketch_and_map_round_trip_over_the_wire() {
    let server = start_server().await;
    let id = server.manager.insert(TypedTarget::wrap(
        DataSet::parallel(vec![
            DataSet::local(1i64),
            DataSet::local(2),
            DataSet::local(3),
        ]),
        int_library(),
    ));

    let config = RuntimeConfig {
        compute_pool_size: 2,
        ..RuntimeConfig::default()
    };
    let ctx = OpContext::new(&config).expect("client context");
    let link = GrpcRemoteLink::connect(&server.endpoint, None)
        .await
        .expect("connect");
    let remote: Arc<DataSet<i64>> = DataSet::remote(link, id);

    let (items, outcome) = remote
        .sketch(&Arc::new(SumSketch), &ctx)
        .subscribe()
        .drain()
        .await;
    outcome.expect("wire sketch completes");
    let total: f64 = items.iter().map(|p| p.delta_done).sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert_eq!(final_payload(items), Some(6));

    let mapped = final_payload(
        remote
            .map(&Arc::new(TimesTen), &ctx)
            .subscribe()
            .drain()
            .await
            .0,
    )
    .expect("mapped handle");
    let (items, outcome) = mapped
        .sketch(&Arc::new(SumSketch), &ctx)
        .subscribe()
        .drain()
        .await;
    outcome.expect("sketch over mapped handle");
    assert_eq!(final_payload(items), Some(60));
}

#[tokio::test]
async fn unknown_handle_maps_back_to_typed_error() {
    let server = start_server().await;
    let config = RuntimeConfig {
        compute_pool_size: 1,
        ..RuntimeConfig::default()
    };
    let ctx = OpContext::new(&config).expect("client context");
    let link = GrpcRemoteLink::connect(&server.endpoint, None)
        .await
        .expect("connect");
    let bogus: Arc<DataSet<i64>> = DataSet::remote(link, ObjectId::new(123, 456));

    let (items, outcome) = bogus
        .sketch(&Arc::new(SumSketch), &ctx)
        .subscribe()
        .drain()
        .await;
    assert!(items.is_empty());
    assert!(matches!(outcome, Err(PdqError::ObjectNotFound(_))));
}
