//! The account methods every deployment gets for free.

use serde_json::{json, Map, Value};

use toto_lib::error::TotoError;

use super::{Method, MethodContext, MethodRegistry, MethodTags};
use crate::session::SessionRecord;

fn session_result(session: &SessionRecord) -> Value {
    json!({
        "session_id": session.session_id,
        "expires": session.expires,
        "user_id": session.user_id,
    })
}

fn create(ctx: MethodContext, params: Map<String, Value>) -> Result<Value, TotoError> {
    let user_id = params["user_id"].as_str().unwrap_or_default().to_owned();
    let password = params["password"].as_str().unwrap_or_default().to_owned();
    // Extra parameters become account properties; the stored password is
    // always the hash, never the parameter.
    let mut properties = params;
    properties.remove("user_id");
    properties.remove("password");
    ctx.service()
        .store()
        .create_account(&user_id, &password, properties)?;
    let session = ctx.create_session(Some(&user_id), Some(&password))?;
    Ok(session_result(&session))
}

fn login(ctx: MethodContext, params: Map<String, Value>) -> Result<Value, TotoError> {
    let user_id = params["user_id"].as_str().unwrap_or_default();
    let password = params["password"].as_str().unwrap_or_default();
    let session = ctx.create_session(Some(user_id), Some(password))?;
    Ok(session_result(&session))
}

fn logout(ctx: MethodContext) -> Result<Value, TotoError> {
    if let Some(session) = ctx.session() {
        ctx.service().store().remove_session(&session.session_id);
    }
    Ok(json!({"authenticated": false}))
}

fn client_error(params: &Map<String, Value>) -> Value {
    if params["client_type"] == "browser_js" {
        log::error!("client error: {}", params["client_error"]);
        json!({"logged": true})
    } else {
        json!({"logged": false})
    }
}

pub fn register_builtin_methods(registry: &MethodRegistry) {
    registry.register(
        "account.create",
        Method::new(|ctx, params| async move { create(ctx, params) })
            .requires(&["user_id", "password"]),
    );
    registry.register(
        "account.login",
        Method::new(|ctx, params| async move { login(ctx, params) })
            .requires(&["user_id", "password"]),
    );
    registry.register(
        "account.logout",
        Method::new(|ctx, _params| async move { logout(ctx) }).tags(MethodTags::AUTHENTICATED),
    );
    registry.register(
        "client_error",
        Method::new(|_ctx, params| async move { Ok(client_error(&params)) })
            .requires(&["client_error", "client_type"]),
    );
}
