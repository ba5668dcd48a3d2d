//! The HTTP and WebSocket request pipeline.
//!
//! One axum router serves the whole method surface: `POST`/`GET` requests
//! carry envelopes (in the body, the URL path, or the query string), and
//! `/websocket` upgrades to a socket that dispatches envelopes per frame.
//! The pipeline authenticates sessions, enforces request HMACs, fans out
//! batches, and signs responses.

pub mod parse;
pub mod pipeline;
pub mod websocket;

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;

use toto_core::ServiceContext;

/// The path reserved for WebSocket method dispatch.
pub const WEBSOCKET_PATH: &str = "/websocket";

pub fn router(ctx: Arc<ServiceContext>) -> Router {
    let api = Router::new()
        .route("/", any(pipeline::handle))
        .route("/websocket", get(websocket::handle_upgrade))
        .route("/websocket/:session_id", get(websocket::handle_upgrade))
        .route("/*path", any(pipeline::handle))
        .with_state(ctx.clone());
    let root = ctx.config().root.trim_end_matches('/');
    if root.is_empty() {
        api
    } else {
        Router::new().nest(root, api)
    }
}
