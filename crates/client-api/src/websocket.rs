//! WebSocket method dispatch.
//!
//! Each text frame carries an envelope `{method, parameters}` dispatched
//! through the same registry as HTTP requests. Results are written back as
//! `{result}` (or `{error}`) frames, optionally echoing a caller-chosen
//! `message_id`; errors never close the socket. Closing the socket marks
//! the connection context finished, deregistering its event handlers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response as HttpResponse;
use serde::Deserialize;
use serde_json::{Map, Value};

use toto_core::methods::{invoke_guarded, prepare_invocation, MethodContext, MethodResult};
use toto_core::ServiceContext;
use toto_lib::envelope::Response;
use toto_lib::error::TotoError;

#[derive(Deserialize)]
struct SocketEnvelope {
    method: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    message_id: Option<Value>,
}

pub async fn handle_upgrade(
    State(ctx): State<Arc<ServiceContext>>,
    session_id: Option<Path<String>>,
    upgrade: WebSocketUpgrade,
) -> HttpResponse {
    let session_id = session_id.map(|Path(session_id)| session_id);
    upgrade.on_upgrade(move |socket| serve_socket(ctx, session_id, socket))
}

async fn serve_socket(ctx: Arc<ServiceContext>, session_id: Option<String>, mut socket: WebSocket) {
    let connection_ctx = MethodContext::new(Arc::clone(&ctx));
    if let Some(session_id) = session_id {
        if let Err(e) = connection_ctx.retrieve_session(&session_id) {
            log::error!("websocket session load failed: {e}");
        }
    }

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                log::debug!("websocket read failed: {e}");
                break;
            }
        };
        let Message::Text(text) = message else {
            continue;
        };
        let (response, message_id) = dispatch(&ctx, &connection_ctx, &text).await;
        let mut body = match serde_json::to_value(&response) {
            Ok(Value::Object(body)) => body,
            _ => continue,
        };
        if let Some(message_id) = message_id {
            body.insert("message_id".into(), message_id);
        }
        let frame = Value::Object(body).to_string();
        if socket.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
    // Socket gone: release everything tied to this connection.
    connection_ctx.finish();
}

async fn dispatch(
    ctx: &Arc<ServiceContext>,
    connection_ctx: &MethodContext,
    text: &str,
) -> (Response, Option<Value>) {
    let envelope: SocketEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return (Response::error(TotoError::missing_method()), None),
    };
    let message_id = envelope.message_id.clone();
    let Some(method) = ctx.registry().resolve(&envelope.method) else {
        return (
            Response::error(TotoError::invalid_method(&envelope.method)),
            message_id,
        );
    };
    // The connection context is shared across frames so a session adopted
    // by one call (e.g. login) carries to the next.
    let mut parameters = envelope.parameters;
    if let Err(e) = prepare_invocation(&method, connection_ctx, &mut parameters) {
        return (Response::error(e), message_id);
    }
    match invoke_guarded(&method, connection_ctx.clone(), parameters).await {
        Ok(MethodResult::Value(value)) => (Response::result(value), message_id),
        Ok(MethodResult::Raw { .. }) | Ok(MethodResult::Deferred) => {
            (Response::default(), message_id)
        }
        Err(e) => {
            log::error!("websocket method error {}: {}", e.code, e.value);
            (Response::error(e), message_id)
        }
    }
}
