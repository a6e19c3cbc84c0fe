//! gRPC service/client glue for the dataset RPC boundary.
//!
//! RPC schema source: `proto/pdq_rpc.proto`.
//!
//! Streaming RPCs (generated under [`v1`]): `Map`, `FlatMap`, `Sketch`,
//! `Zip`, `Manage`, `Prune` each answer a `Command` with a stream of
//! `PartialResponse`; `Unsubscribe` answers with a single `Ack`.
//!
//! [`DataSetRpcService`] serves a registry; [`GrpcRemoteLink`] is the
//! client-side transport behind remote dataset proxies.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use pdq_common::{global_metrics, CallId, ObjectId, PdqError, Result};
use pdq_dataset::{
    Event, OpContext, OpEnvelope, PartialStream, RemoteLink, RemoteMethod, WireCommand,
    WirePartial, PRUNE_OP,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::dispatch::run_command;
use crate::manager::RpcObjectManager;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("pdq.rpc.v1");
}

pub use v1::data_set_rpc_client::DataSetRpcClient;
pub use v1::data_set_rpc_server::{DataSetRpc, DataSetRpcServer};

/// Maps the error taxonomy onto gRPC statuses; the stable error code is
/// prefixed onto the message so clients can map it back.
pub fn to_status(err: &PdqError) -> Status {
    let message = format!("{}: {}", err.code(), err);
    match err {
        PdqError::ObjectNotFound(_) => Status::not_found(message),
        PdqError::TypeMismatch(_) | PdqError::ShapeMismatch(_) => {
            Status::failed_precondition(message)
        }
        PdqError::SessionBusy(_) => Status::resource_exhausted(message),
        PdqError::Cancelled => Status::cancelled(message),
        PdqError::InvalidConfig(_) | PdqError::Serde(_) => Status::invalid_argument(message),
        PdqError::Transport(_) => Status::unavailable(message),
        PdqError::UserCode(_) | PdqError::Execution(_) | PdqError::Io(_) => {
            Status::internal(message)
        }
    }
}

/// Recovers the error taxonomy from a status produced by [`to_status`];
/// statuses without a recognizable code prefix become transport errors.
pub fn status_to_error(status: &Status) -> PdqError {
    let message = status.message();
    if let Some((code, rest)) = message.split_once(": ") {
        let rest = rest.to_string();
        match code {
            "USER_CODE_FAILURE" => return PdqError::UserCode(rest),
            "TYPE_MISMATCH" => return PdqError::TypeMismatch(rest),
            "SHAPE_MISMATCH" => return PdqError::ShapeMismatch(rest),
            "OBJECT_NOT_FOUND" => return PdqError::ObjectNotFound(rest),
            "SESSION_BUSY" => return PdqError::SessionBusy(rest),
            "TRANSPORT_ERROR" => return PdqError::Transport(rest),
            "CANCELLED" => return PdqError::Cancelled,
            "EXECUTION_ERROR" => return PdqError::Execution(rest),
            "INVALID_CONFIG" => return PdqError::InvalidConfig(rest),
            "SERDE_ERROR" => return PdqError::Serde(rest),
            _ => {}
        }
    }
    PdqError::Transport(format!("rpc failed: {status}"))
}

fn from_proto(command: v1::Command) -> WireCommand {
    WireCommand {
        ids_index: command.ids_index,
        high_id: command.high_id,
        low_id: command.low_id,
        serialized_op: command.serialized_op,
    }
}

fn to_proto(command: WireCommand) -> v1::Command {
    v1::Command {
        ids_index: command.ids_index,
        high_id: command.high_id,
        low_id: command.low_id,
        serialized_op: command.serialized_op,
    }
}

type PartialResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<v1::PartialResponse, Status>> + Send>>;

/// gRPC service backed by a shared object registry.
#[derive(Clone)]
pub struct DataSetRpcService {
    manager: Arc<RpcObjectManager>,
    ctx: OpContext,
}

impl DataSetRpcService {
    /// Builds the service around a registry and compute context.
    pub fn new(manager: Arc<RpcObjectManager>, ctx: OpContext) -> Self {
        Self { manager, ctx }
    }

    /// Shared registry, for callers that also serve other surfaces.
    pub fn manager(&self) -> Arc<RpcObjectManager> {
        self.manager.clone()
    }

    fn streaming(
        &self,
        method: RemoteMethod,
        command: v1::Command,
    ) -> std::result::Result<Response<PartialResponseStream>, Status> {
        let command = from_proto(command);
        let stream = run_command(&self.manager, &self.ctx, method, &command)
            .map_err(|e| to_status(&e))?;
        let mut sub = stream.subscribe();
        let (tx, rx) = mpsc::channel::<std::result::Result<v1::PartialResponse, Status>>(16);
        tokio::spawn(async move {
            loop {
                match sub.next_event().await {
                    Some(Event::Next(wire)) => match wire.encode() {
                        Ok(serialized_op) => {
                            if tx
                                .send(Ok(v1::PartialResponse { serialized_op }))
                                .await
                                .is_err()
                            {
                                // Client went away; release upstream work.
                                sub.dispose();
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(to_status(&e))).await;
                            break;
                        }
                    },
                    Some(Event::Complete) => break,
                    Some(Event::Error(e)) => {
                        let _ = tx.send(Err(to_status(&e))).await;
                        break;
                    }
                    None => break,
                }
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tonic::async_trait]
impl DataSetRpc for DataSetRpcService {
    type MapStream = PartialResponseStream;

    async fn map(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::MapStream>, Status> {
        self.streaming(RemoteMethod::Map, request.into_inner())
    }

    type FlatMapStream = PartialResponseStream;

    async fn flat_map(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::FlatMapStream>, Status> {
        self.streaming(RemoteMethod::FlatMap, request.into_inner())
    }

    type SketchStream = PartialResponseStream;

    async fn sketch(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::SketchStream>, Status> {
        self.streaming(RemoteMethod::Sketch, request.into_inner())
    }

    type ZipStream = PartialResponseStream;

    async fn zip(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::ZipStream>, Status> {
        self.streaming(RemoteMethod::Zip, request.into_inner())
    }

    type ManageStream = PartialResponseStream;

    async fn manage(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::ManageStream>, Status> {
        self.streaming(RemoteMethod::Manage, request.into_inner())
    }

    type PruneStream = PartialResponseStream;

    async fn prune(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<Self::PruneStream>, Status> {
        self.streaming(RemoteMethod::Prune, request.into_inner())
    }

    async fn unsubscribe(
        &self,
        request: Request<v1::Command>,
    ) -> std::result::Result<Response<v1::Ack>, Status> {
        global_metrics().record_rpc_call("unsubscribe");
        let command = from_proto(request.into_inner());
        let envelope = OpEnvelope::decode(&command.serialized_op).map_err(|e| to_status(&e))?;
        let call = CallId(envelope.call);
        let found = self.manager.unsubscribe(call);
        debug!(%call, found, "unsubscribe handled");
        Ok(Response::new(v1::Ack {}))
    }
}

/// Client-side transport for remote dataset proxies, one per peer server.
pub struct GrpcRemoteLink {
    client: DataSetRpcClient<tonic::transport::Channel>,
    deadline: Option<std::time::Duration>,
    call_seed: i64,
    call_counter: AtomicI64,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for GrpcRemoteLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GrpcRemoteLink")
    }
}

impl GrpcRemoteLink {
    /// Connects to a peer server; `deadline` bounds every streaming call.
    pub async fn connect(
        endpoint: &str,
        deadline: Option<std::time::Duration>,
    ) -> Result<Arc<Self>> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| PdqError::InvalidConfig(format!("endpoint {endpoint}: {e}")))?
            .connect()
            .await
            .map_err(|e| PdqError::Transport(format!("connect {endpoint}: {e}")))?;
        let (seed, _) = uuid::Uuid::new_v4().as_u64_pair();
        Ok(Arc::new(Self {
            client: DataSetRpcClient::new(channel),
            deadline,
            call_seed: seed as i64,
            call_counter: AtomicI64::new(1),
            runtime: tokio::runtime::Handle::current(),
        }))
    }
}

impl RemoteLink for GrpcRemoteLink {
    fn mint_call(&self) -> CallId {
        let next = self.call_counter.fetch_add(1, Ordering::Relaxed);
        CallId(self.call_seed.wrapping_add(next))
    }

    fn invoke(&self, method: RemoteMethod, command: WireCommand) -> PartialStream<WirePartial> {
        let mut client = self.client.clone();
        let deadline = self.deadline;
        PartialStream::new(move |em| async move {
            let mut request = Request::new(to_proto(command));
            if let Some(deadline) = deadline {
                request.set_timeout(deadline);
            }
            let response = match method {
                RemoteMethod::Map => client.map(request).await,
                RemoteMethod::FlatMap => client.flat_map(request).await,
                RemoteMethod::Sketch => client.sketch(request).await,
                RemoteMethod::Zip => client.zip(request).await,
                RemoteMethod::Manage => client.manage(request).await,
                RemoteMethod::Prune => client.prune(request).await,
            };
            let mut stream = match response {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    em.error(status_to_error(&status));
                    return;
                }
            };
            loop {
                match stream.message().await {
                    Ok(Some(partial)) => match WirePartial::decode(&partial.serialized_op) {
                        Ok(wire) => {
                            if !em.next(wire) {
                                return;
                            }
                        }
                        Err(e) => {
                            em.error(e);
                            return;
                        }
                    },
                    Ok(None) => {
                        em.complete();
                        return;
                    }
                    Err(status) => {
                        em.error(status_to_error(&status));
                        return;
                    }
                }
            }
        })
    }

    fn unsubscribe(&self, command: WireCommand) -> BoxFuture<'static, Result<()>> {
        let mut client = self.client.clone();
        async move {
            client
                .unsubscribe(Request::new(to_proto(command)))
                .await
                .map(|_| ())
                .map_err(|status| status_to_error(&status))
        }
        .boxed()
    }

    fn prune(&self, object: ObjectId) {
        let mut client = self.client.clone();
        self.runtime.spawn(async move {
            let envelope = OpEnvelope::with_body(PRUNE_OP, CallId(0), serde_json::Value::Null);
            let command = match WireCommand::new(object, &envelope) {
                Ok(command) => command,
                Err(e) => {
                    warn!(%object, error = %e, "prune envelope failed");
                    return;
                }
            };
            if let Err(status) = client.prune(Request::new(to_proto(command))).await {
                debug!(%object, %status, "remote prune failed");
            }
        });
    }
}
