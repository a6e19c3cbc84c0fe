//! Remote dataset proxies and the link seam to the RPC layer.
//!
//! A [`RemoteDataSet`] holds an object id on a peer server plus a
//! [`RemoteLink`] that carries commands over the wire. Each operation
//! becomes a server-streaming call whose responses decode back into
//! partial results; dataset-producing operations return fresh remote
//! proxies around the object id encoded in the final payload.
//!
//! Disposal of a pending call invokes `unsubscribe` on the peer so the
//! server can abort the work and free its subscription entry. Dropping
//! the proxy prunes the server-side reference count.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use pdq_common::{CallId, ObjectId, PdqError, Result};
use tracing::debug;

use crate::dataset::DataSet;
use crate::ops::{ManageCommand, ManageStatus, MapOp, SketchOp, Wire};
use crate::partial::PartialResult;
use crate::stream::{Event, PartialStream};
use crate::wire::{OpEnvelope, WireCommand, WirePartial, ZipBody, UNSUBSCRIBE_OP};

/// The streaming methods a remote peer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    /// Element-wise map producing a new handle.
    Map,
    /// Flattening map producing a new handle.
    FlatMap,
    /// Mergeable sketch producing values.
    Sketch,
    /// Positional pairing with a peer handle on the same server.
    Zip,
    /// Per-node management commands.
    Manage,
    /// Reference-count release of a handle.
    Prune,
}

impl RemoteMethod {
    /// Wire-level method name.
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteMethod::Map => "map",
            RemoteMethod::FlatMap => "flat_map",
            RemoteMethod::Sketch => "sketch",
            RemoteMethod::Zip => "zip",
            RemoteMethod::Manage => "manage",
            RemoteMethod::Prune => "prune",
        }
    }
}

/// Transport seam between remote proxies and a concrete RPC client.
///
/// Implementations exist per transport: a gRPC client in the RPC crate
/// and an in-process loopback for single-process deployments and tests.
pub trait RemoteLink: Send + Sync + std::fmt::Debug + 'static {
    /// Mints a call id unique within this link's lifetime.
    fn mint_call(&self) -> CallId;

    /// Starts a server-streaming call. The returned stream is cold; the
    /// request is sent at subscription time.
    fn invoke(&self, method: RemoteMethod, command: WireCommand) -> PartialStream<WirePartial>;

    /// Aborts the pending call addressed by the command's envelope.
    fn unsubscribe(&self, command: WireCommand) -> BoxFuture<'static, Result<()>>;

    /// Releases one reference to a remote handle.
    fn prune(&self, object: ObjectId);
}

/// A proxy for a dataset of `T` living on another process.
pub struct RemoteDataSet<T> {
    link: Arc<dyn RemoteLink>,
    object: ObjectId,
    _elem: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for RemoteDataSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteDataSet({})", self.object)
    }
}

impl<T> Drop for RemoteDataSet<T> {
    fn drop(&mut self) {
        // The server holds a reference per registered handle; release it
        // when the proxy becomes unreachable.
        self.link.prune(self.object);
    }
}

impl<T: Wire> RemoteDataSet<T> {
    /// Builds a proxy for `object` reachable through `link`.
    pub fn new(link: Arc<dyn RemoteLink>, object: ObjectId) -> Self {
        Self {
            link,
            object,
            _elem: PhantomData,
        }
    }

    /// The server-side handle id.
    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    /// The link this proxy uses.
    pub fn link(&self) -> &Arc<dyn RemoteLink> {
        &self.link
    }

    pub(crate) fn map_stream<M>(
        &self,
        mapper: &Arc<M>,
    ) -> PartialStream<PartialResult<Arc<DataSet<M::Out>>>>
    where
        M: MapOp<T>,
        M::Out: Wire,
    {
        self.dataset_call(RemoteMethod::Map, self.envelope_for(mapper.as_ref()))
    }

    pub(crate) fn flat_map_stream<M, S>(
        &self,
        mapper: &Arc<M>,
    ) -> PartialStream<PartialResult<Arc<DataSet<S>>>>
    where
        M: MapOp<T, Out = Vec<S>>,
        S: Wire,
    {
        self.dataset_call(RemoteMethod::FlatMap, self.envelope_for(mapper.as_ref()))
    }

    pub(crate) fn zip_stream<S: Wire>(
        &self,
        other: &Arc<DataSet<S>>,
    ) -> PartialStream<PartialResult<Arc<DataSet<(T, S)>>>> {
        let peer = match other.as_ref() {
            DataSet::Remote(peer) if Arc::ptr_eq(&self.link, &peer.link) => peer.object,
            _ => {
                return PartialStream::error(PdqError::TypeMismatch(format!(
                    "zip requires a remote peer on the same server, got {}",
                    other.describe()
                )))
            }
        };
        let body = match serde_json::to_value(ZipBody { peer }) {
            Ok(body) => body,
            Err(e) => return PartialStream::error(PdqError::Serde(e.to_string())),
        };
        let envelope = Ok(OpEnvelope::with_body("zip", self.link.mint_call(), body));
        self.dataset_call(RemoteMethod::Zip, envelope)
    }

    pub(crate) fn sketch_stream<K>(&self, sketch: &Arc<K>) -> PartialStream<PartialResult<K::Out>>
    where
        K: SketchOp<T>,
        K::Out: Wire,
    {
        match self.envelope_for(sketch.as_ref()) {
            Ok(envelope) => self
                .raw_call(RemoteMethod::Sketch, envelope)
                .map(|wire| wire.into_partial::<K::Out>()),
            Err(e) => PartialStream::error(e),
        }
    }

    pub(crate) fn manage_stream(
        &self,
        command: ManageCommand,
    ) -> PartialStream<PartialResult<ManageStatus>> {
        let body = match serde_json::to_value(&command) {
            Ok(body) => body,
            Err(e) => return PartialStream::error(PdqError::Serde(e.to_string())),
        };
        let envelope = OpEnvelope::with_body(ManageCommand::NAME, self.link.mint_call(), body);
        self.raw_call(RemoteMethod::Manage, envelope)
            .map(|wire| wire.into_partial::<ManageStatus>())
    }

    fn envelope_for<O: crate::ops::NamedOp>(&self, op: &O) -> Result<OpEnvelope> {
        OpEnvelope::for_op(self.link.mint_call(), op)
    }

    /// Runs a dataset-producing call: progress partials pass through and
    /// payloads decode into fresh remote proxies.
    fn dataset_call<S: Wire>(
        &self,
        method: RemoteMethod,
        envelope: Result<OpEnvelope>,
    ) -> PartialStream<PartialResult<Arc<DataSet<S>>>> {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => return PartialStream::error(e),
        };
        let link = self.link.clone();
        self.raw_call(method, envelope).map(move |wire| {
            let delta = wire.delta_done;
            match wire.payload {
                Some(value) => {
                    let id: ObjectId = serde_json::from_value(value)
                        .map_err(|e| PdqError::Serde(format!("result handle id: {e}")))?;
                    Ok(PartialResult::new(
                        delta,
                        Some(DataSet::remote(link.clone(), id)),
                    ))
                }
                None => Ok(PartialResult::progress(delta)),
            }
        })
    }

    /// Issues the call and pumps wire partials through, watching for
    /// disposal; a disposed subscription sends `unsubscribe` for the
    /// pending call id before returning.
    fn raw_call(&self, method: RemoteMethod, envelope: OpEnvelope) -> PartialStream<WirePartial> {
        let link = self.link.clone();
        let target = self.object;
        PartialStream::new(move |em| async move {
            let call = CallId(envelope.call);
            let command = match WireCommand::new(target, &envelope) {
                Ok(command) => command,
                Err(e) => {
                    em.error(e);
                    return;
                }
            };
            let token = em.token().clone();
            let mut sub = link
                .invoke(method, command)
                .subscribe_with(token.child_token());
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(%call, method = method.as_str(), "unsubscribing cancelled remote call");
                        let env = OpEnvelope::with_body(UNSUBSCRIBE_OP, call, serde_json::Value::Null);
                        if let Ok(command) = WireCommand::new(target, &env) {
                            let _ = link.unsubscribe(command).await;
                        }
                        return;
                    }
                    event = sub.next_event() => event,
                };
                match event {
                    Some(Event::Next(wire)) => {
                        if !em.next(wire) {
                            continue;
                        }
                    }
                    Some(Event::Complete) => {
                        em.complete();
                        return;
                    }
                    Some(Event::Error(e)) => {
                        em.error(e);
                        return;
                    }
                    None => return,
                }
            }
        })
    }
}
