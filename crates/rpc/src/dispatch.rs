//! Transport-independent command execution.
//!
//! Both the gRPC service and the in-process link funnel through
//! [`run_command`]: decode the envelope, resolve the target handle,
//! invoke the erased operation, and pump typed partials into wire
//! partials. Dataset-producing calls register exactly one result handle,
//! once the operation completes; intermediate emissions travel as
//! progress-only partials.
//!
//! Call lifecycle: received, resolved, streaming, then completed, errored
//! or cancelled; every terminal state frees the per-call subscription
//! entry.

use std::sync::Arc;

use pdq_common::{global_metrics, CallId, PdqError, Result};
use pdq_dataset::{
    Event, OpContext, OpEnvelope, PartialStream, RemoteMethod, WireCommand, WirePartial, ZipBody,
};
use tracing::debug;

use crate::manager::RpcObjectManager;
use crate::target::{DataTarget, TargetDataStream, TargetValueStream};

/// Executes one command against the registry, yielding the wire-level
/// response stream. Resolution errors (unknown handle, unknown op,
/// malformed envelope) surface as `Err` before any streaming starts.
pub fn run_command(
    manager: &Arc<RpcObjectManager>,
    ctx: &OpContext,
    method: RemoteMethod,
    command: &WireCommand,
) -> Result<PartialStream<WirePartial>> {
    global_metrics().record_rpc_call(method.as_str());
    let envelope = OpEnvelope::decode(&command.serialized_op)?;
    let target_id = command.target();
    let call = CallId(envelope.call);
    debug!(%call, target = %target_id, method = method.as_str(), op = %envelope.op, "command received");

    let target = manager.lookup(target_id)?;
    debug!(%call, target = %target.describe(), "command resolved");

    if method == RemoteMethod::Prune {
        let removed = manager.prune(target_id);
        let payload = serde_json::json!({ "removed": removed });
        return Ok(PartialStream::just(WirePartial {
            delta_done: 1.0,
            payload: Some(payload),
        }));
    }

    match method {
        RemoteMethod::Map => Ok(data_pump(
            manager.clone(),
            call,
            target.run_map(&envelope, ctx)?,
        )),
        RemoteMethod::FlatMap => Ok(data_pump(
            manager.clone(),
            call,
            target.run_flat_map(&envelope, ctx)?,
        )),
        RemoteMethod::Zip => {
            let body: ZipBody = envelope.body_as()?;
            let peer = manager.lookup(body.peer)?;
            Ok(data_pump(
                manager.clone(),
                call,
                target.run_zip(&envelope, &peer, ctx)?,
            ))
        }
        RemoteMethod::Sketch => Ok(value_pump(
            manager.clone(),
            call,
            target.run_sketch(&envelope, ctx)?,
            "sketch",
        )),
        RemoteMethod::Manage => Ok(value_pump(
            manager.clone(),
            call,
            target.run_manage(&envelope, ctx)?,
            "manage",
        )),
        RemoteMethod::Prune => Err(PdqError::Execution("prune handled above".to_string())),
    }
}

/// Pumps a handle-producing stream: progress passes through payload-free,
/// and the last produced handle is registered once on completion, its id
/// travelling in a final zero-delta partial.
fn data_pump(
    manager: Arc<RpcObjectManager>,
    call: CallId,
    inner: TargetDataStream,
) -> PartialStream<WirePartial> {
    PartialStream::new(move |em| async move {
        let mut sub = inner.subscribe_with(em.token().child_token());
        manager.register_call(call, sub.handle());
        let mut latest: Option<Arc<dyn DataTarget>> = None;
        loop {
            match sub.next_event().await {
                Some(Event::Next(partial)) => {
                    let delta = partial.delta_done;
                    if partial.payload.is_some() {
                        latest = partial.payload;
                    }
                    global_metrics().record_partial("dataset");
                    if !em.next(WirePartial {
                        delta_done: delta,
                        payload: None,
                    }) {
                        break;
                    }
                }
                Some(Event::Complete) => {
                    match latest.take() {
                        Some(produced) => {
                            let id = manager.insert(produced);
                            debug!(%call, object = %id, "call completed");
                            match serde_json::to_value(id) {
                                Ok(payload) => {
                                    em.next(WirePartial {
                                        delta_done: 0.0,
                                        payload: Some(payload),
                                    });
                                    em.complete();
                                }
                                Err(e) => em.error(PdqError::Serde(e.to_string())),
                            }
                        }
                        None => em.error(PdqError::Execution(
                            "operation completed without producing a handle".to_string(),
                        )),
                    }
                    break;
                }
                Some(Event::Error(e)) => {
                    debug!(%call, error = %e, "call errored");
                    em.error(e);
                    break;
                }
                None => {
                    debug!(%call, "call cancelled");
                    break;
                }
            }
        }
        manager.finish_call(call);
    })
}

/// Pumps a value-producing stream straight through; every partial keeps
/// its serialized payload so consumers can render approximations as they
/// arrive.
fn value_pump(
    manager: Arc<RpcObjectManager>,
    call: CallId,
    inner: TargetValueStream,
    kind: &'static str,
) -> PartialStream<WirePartial> {
    PartialStream::new(move |em| async move {
        let mut sub = inner.subscribe_with(em.token().child_token());
        manager.register_call(call, sub.handle());
        loop {
            match sub.next_event().await {
                Some(Event::Next(partial)) => {
                    global_metrics().record_partial(kind);
                    if !em.next(WirePartial {
                        delta_done: partial.delta_done,
                        payload: partial.payload,
                    }) {
                        break;
                    }
                }
                Some(Event::Complete) => {
                    debug!(%call, "call completed");
                    em.complete();
                    break;
                }
                Some(Event::Error(e)) => {
                    debug!(%call, error = %e, "call errored");
                    em.error(e);
                    break;
                }
                None => {
                    debug!(%call, "call cancelled");
                    break;
                }
            }
        }
        manager.finish_call(call);
    })
}
