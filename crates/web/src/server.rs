//! The `/rpc` WebSocket endpoint.
//!
//! Each connection is one session: the client sends one request per
//! operation and receives a stream of reply frames. A session holds at
//! most one in-flight operation; a concurrent second request is answered
//! `SessionBusy` and the first is left untouched. Closing the socket
//! disposes the live subscription, which propagates cancellation through
//! the dataset tree.

use std::sync::Arc;

use axum::extract::ws::{close_code, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use pdq_common::{global_metrics, CallId, ObjectId, PdqError, SessionId};
use pdq_dataset::{
    Event, OpContext, OpEnvelope, RemoteMethod, SubscriptionHandle, WireCommand, ZipBody,
};
use pdq_rpc::{run_command, RpcObjectManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frames::{RequestArguments, RpcReplyFrame, RpcRequestFrame};

/// Shared state behind the web endpoint.
pub struct WebState {
    manager: Arc<RpcObjectManager>,
    ctx: OpContext,
}

impl WebState {
    /// Builds the endpoint state around a registry and compute context.
    pub fn new(manager: Arc<RpcObjectManager>, ctx: OpContext) -> Arc<Self> {
        Arc::new(Self { manager, ctx })
    }

    /// The shared registry.
    pub fn manager(&self) -> &Arc<RpcObjectManager> {
        &self.manager
    }
}

/// Routes: the `/rpc` WebSocket plus a Prometheus metrics page.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/rpc", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler() -> String {
    global_metrics().render_prometheus()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WebState>) {
    let session = SessionId::mint();
    state.manager.add_session(session.clone());
    info!(%session, "new web client connection");

    let (sink, stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel::<Message>(16);
    let writer = tokio::spawn(write_loop(sink, reply_rx));

    read_loop(&state, &session, stream, &reply_tx).await;

    // Closing the session disposes any in-flight subscription.
    state.manager.remove_session(&session);
    drop(reply_tx);
    let _ = writer.await;
    info!(%session, "web client connection closed");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    state: &Arc<WebState>,
    session: &SessionId,
    mut stream: SplitStream<WebSocket>,
    reply_tx: &mpsc::Sender<Message>,
) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(%session, error = %e, "web socket receive failed");
                return;
            }
        };
        match message {
            Message::Text(text) => {
                handle_request(state, session, &text, reply_tx).await;
            }
            Message::Close(frame) => {
                match &frame {
                    Some(frame) if frame.code == close_code::NORMAL => {
                        info!(%session, "normal connection closing");
                    }
                    other => {
                        warn!(%session, frame = ?other, "abnormal connection closing");
                    }
                }
                return;
            }
            _ => {}
        }
    }
}

async fn send_reply(reply_tx: &mpsc::Sender<Message>, reply: &RpcReplyFrame) -> bool {
    match serde_json::to_string(reply) {
        Ok(text) => reply_tx.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "could not encode reply");
            false
        }
    }
}

fn parse_method(method: &str) -> Option<RemoteMethod> {
    match method {
        "map" => Some(RemoteMethod::Map),
        "flatMap" => Some(RemoteMethod::FlatMap),
        "sketch" => Some(RemoteMethod::Sketch),
        "zip" => Some(RemoteMethod::Zip),
        "manage" => Some(RemoteMethod::Manage),
        "prune" => Some(RemoteMethod::Prune),
        _ => None,
    }
}

fn mint_call() -> CallId {
    let (_, low) = uuid::Uuid::new_v4().as_u64_pair();
    CallId(low as i64)
}

/// Builds the wire command for a request, or the error to reply with.
fn build_command(
    state: &WebState,
    session: &SessionId,
    request: &RpcRequestFrame,
) -> Result<(RemoteMethod, WireCommand), PdqError> {
    let method = parse_method(&request.method)
        .ok_or_else(|| PdqError::InvalidConfig(format!("unknown method: {}", request.method)))?;
    let target: ObjectId = if request.object_id.is_empty() {
        state.manager.session_target(session).ok_or_else(|| {
            PdqError::ObjectNotFound("session has no associated dataset".to_string())
        })?
    } else {
        request
            .object_id
            .parse()
            .map_err(PdqError::InvalidConfig)?
    };
    let arguments: RequestArguments = if request.arguments.is_null() {
        RequestArguments::default()
    } else {
        serde_json::from_value(request.arguments.clone())
            .map_err(|e| PdqError::Serde(format!("request arguments: {e}")))?
    };

    let call = mint_call();
    let envelope = match method {
        RemoteMethod::Zip => {
            let peer: ObjectId = arguments
                .peer
                .as_deref()
                .ok_or_else(|| PdqError::InvalidConfig("zip requires a peer".to_string()))?
                .parse()
                .map_err(PdqError::InvalidConfig)?;
            let body = serde_json::to_value(ZipBody { peer })
                .map_err(|e| PdqError::Serde(e.to_string()))?;
            OpEnvelope::with_body("zip", call, body)
        }
        RemoteMethod::Manage => OpEnvelope::with_body("manage", call, arguments.body),
        RemoteMethod::Prune => OpEnvelope::with_body("prune", call, serde_json::Value::Null),
        _ => OpEnvelope::with_body(&arguments.op, call, arguments.body),
    };
    let command = WireCommand::new(target, &envelope)?;
    Ok((method, command))
}

async fn handle_request(
    state: &Arc<WebState>,
    session: &SessionId,
    text: &str,
    reply_tx: &mpsc::Sender<Message>,
) {
    let request: RpcRequestFrame = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(%session, error = %e, "malformed request frame");
            let report = PdqError::Serde(format!("request frame: {e}")).report();
            send_reply(reply_tx, &RpcReplyFrame::error(-1, report)).await;
            return;
        }
    };
    debug!(%session, request_id = request.request_id, method = %request.method, "web request");

    let (method, command) = match build_command(state, session, &request) {
        Ok(built) => built,
        Err(e) => {
            send_reply(reply_tx, &RpcReplyFrame::error(request.request_id, e.report())).await;
            return;
        }
    };

    // Claim the session's single in-flight slot before any work starts.
    let token = CancellationToken::new();
    if let Err(e) = state
        .manager
        .begin_session_call(session, SubscriptionHandle::from_token(token.clone()))
    {
        send_reply(reply_tx, &RpcReplyFrame::error(request.request_id, e.report())).await;
        return;
    }

    let stream = match run_command(&state.manager, &state.ctx, method, &command) {
        Ok(stream) => stream,
        Err(e) => {
            state.manager.end_session_call(session);
            send_reply(reply_tx, &RpcReplyFrame::error(request.request_id, e.report())).await;
            return;
        }
    };

    let mut sub = stream.subscribe_with(token);
    let state = state.clone();
    let session = session.clone();
    let reply_tx = reply_tx.clone();
    let request_id = request.request_id;
    let dataset_producing = matches!(
        method,
        RemoteMethod::Map | RemoteMethod::FlatMap | RemoteMethod::Zip
    );
    tokio::spawn(async move {
        loop {
            match sub.next_event().await {
                Some(Event::Next(wire)) => {
                    if dataset_producing {
                        if let Some(payload) = &wire.payload {
                            if let Ok(id) = serde_json::from_value::<ObjectId>(payload.clone()) {
                                state.manager.set_session_target(&session, id);
                            }
                        }
                    }
                    let result = serde_json::json!({
                        "deltaDone": wire.delta_done,
                        "payload": wire.payload,
                    });
                    if !send_reply(&reply_tx, &RpcReplyFrame::partial(request_id, result)).await {
                        sub.dispose();
                        break;
                    }
                }
                Some(Event::Complete) => {
                    send_reply(&reply_tx, &RpcReplyFrame::done(request_id)).await;
                    break;
                }
                Some(Event::Error(e)) => {
                    send_reply(&reply_tx, &RpcReplyFrame::error(request_id, e.report())).await;
                    break;
                }
                None => break,
            }
        }
        state.manager.end_session_call(&session);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<WebState> {
        let config = pdq_common::RuntimeConfig {
            compute_pool_size: 1,
            ..pdq_common::RuntimeConfig::default()
        };
        let ctx = OpContext::new(&config).expect("context");
        WebState::new(Arc::new(RpcObjectManager::new()), ctx)
    }

    fn request(method: &str, object_id: &str, arguments: serde_json::Value) -> RpcRequestFrame {
        RpcRequestFrame {
            request_id: 1,
            object_id: object_id.to_string(),
            method: method.to_string(),
            arguments,
        }
    }

    #[test]
    fn method_names_map_onto_rpc_methods() {
        assert_eq!(parse_method("flatMap"), Some(RemoteMethod::FlatMap));
        assert_eq!(parse_method("sketch"), Some(RemoteMethod::Sketch));
        assert_eq!(parse_method("unsubscribe"), None);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let state = state();
        let session = SessionId::mint();
        state.manager().add_session(session.clone());
        let err = build_command(&state, &session, &request("scan", "0.0", serde_json::json!({})))
            .expect_err("unknown method");
        assert!(matches!(err, PdqError::InvalidConfig(_)));
    }

    #[test]
    fn empty_object_id_needs_a_session_target() {
        let state = state();
        let session = SessionId::mint();
        state.manager().add_session(session.clone());
        let err = build_command(
            &state,
            &session,
            &request("sketch", "", serde_json::json!({"op": "sum"})),
        )
        .expect_err("no session target");
        assert!(matches!(err, PdqError::ObjectNotFound(_)));

        state
            .manager()
            .set_session_target(&session, ObjectId::new(0, 0));
        let (method, command) = build_command(
            &state,
            &session,
            &request("sketch", "", serde_json::json!({"op": "sum"})),
        )
        .expect("resolves via session target");
        assert_eq!(method, RemoteMethod::Sketch);
        assert_eq!(command.target(), ObjectId::new(0, 0));
    }

    #[test]
    fn zip_requires_a_peer_argument() {
        let state = state();
        let session = SessionId::mint();
        state.manager().add_session(session.clone());
        let err = build_command(&state, &session, &request("zip", "0.0", serde_json::json!({})))
            .expect_err("missing peer");
        assert!(matches!(err, PdqError::InvalidConfig(_)));

        let (_, command) = build_command(
            &state,
            &session,
            &request("zip", "0.0", serde_json::json!({"peer": "0.1"})),
        )
        .expect("zip with peer");
        let envelope = OpEnvelope::decode(&command.serialized_op).expect("envelope");
        let body: ZipBody = envelope.body_as().expect("zip body");
        assert_eq!(body.peer, ObjectId::new(0, 1));
    }
}
