//! The request pipeline: envelope in, signed envelope out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{Method as HttpMethod, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum_extra::extract::CookieJar;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use toto_core::config::{HmacSecret, MethodSelect, TotoConfig};
use toto_core::methods::{
    invoke_guarded, prepare_invocation, Method, MethodContext, MethodResult, MethodTags,
};
use toto_core::secret;
use toto_core::session::SessionRecord;
use toto_core::ServiceContext;
use toto_lib::envelope::{Envelope, Response};
use toto_lib::error::TotoError;

use crate::parse::{self, ResponseType};

pub const SESSION_ID_HEADER: &str = "x-toto-session-id";
pub const HMAC_HEADER: &str = "x-toto-hmac";
pub const SESSION_COOKIE: &str = "toto-session-id";

const SUPPORTED_METHODS: &str = "POST,OPTIONS,GET";

pub async fn handle(
    State(ctx): State<Arc<ServiceContext>>,
    http_method: HttpMethod,
    path: Option<Path<String>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let path = path.map(|Path(path)| path);
    if http_method == HttpMethod::OPTIONS {
        handle_options(&ctx, &headers)
    } else if http_method == HttpMethod::GET || http_method == HttpMethod::POST {
        process_request(ctx, http_method, path, query, headers, body).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// CORS preflight: reflect the requested headers on top of the framework
/// set, refuse unsupported methods, and never invoke anything.
fn handle_options(ctx: &ServiceContext, headers: &HeaderMap) -> HttpResponse {
    let mut allowed: Vec<String> = vec![
        HMAC_HEADER.into(),
        SESSION_ID_HEADER.into(),
        "origin".into(),
        "content-type".into(),
    ];
    if let Some(requested) = headers
        .get("access-control-request-headers")
        .and_then(|v| v.to_str().ok())
    {
        for header in requested.to_lowercase().replace(' ', "").split(',') {
            if !header.is_empty() && !allowed.iter().any(|h| h == header) {
                allowed.push(header.to_owned());
            }
        }
    }
    if let Some(method) = headers
        .get("access-control-request-method")
        .and_then(|v| v.to_str().ok())
    {
        if !SUPPORTED_METHODS.split(',').any(|m| m == method) {
            return (StatusCode::METHOD_NOT_ALLOWED, "Method not supported").into_response();
        }
    }
    let mut response = StatusCode::OK.into_response();
    let response_headers = response.headers_mut();
    insert_header(
        response_headers,
        "access-control-allow-headers",
        &allowed.join(","),
    );
    insert_header(
        response_headers,
        "access-control-allow-origin",
        &ctx.config().allow_origin,
    );
    insert_header(
        response_headers,
        "access-control-allow-methods",
        SUPPORTED_METHODS,
    );
    insert_header(
        response_headers,
        "access-control-expose-headers",
        HMAC_HEADER,
    );
    response
}

async fn process_request(
    ctx: Arc<ServiceContext>,
    http_method: HttpMethod,
    path: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let (envelope, response_type) = match build_envelope(&ctx, &http_method, &query, &headers, body.clone()).await
    {
        Ok(parsed) => parsed,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    // Session and request-HMAC handling happen before any dispatch; a
    // failure here is a structured error, never a silent anonymous
    // downgrade.
    let session = match load_session(&ctx, &headers, &body) {
        Ok(session) => session,
        Err(e) => {
            return respond(
                ctx.config(),
                None,
                Response::error(e),
                response_type,
            )
        }
    };

    if let Some(batch) = envelope.batch {
        return process_batch(&ctx, batch, session, response_type).await;
    }

    let outcome = dispatch_envelope(
        &ctx,
        path.as_deref(),
        envelope.method.as_deref(),
        envelope.parameters,
        session.clone(),
    )
    .await;

    render_outcome(&ctx, outcome, session, response_type)
}

async fn build_envelope(
    ctx: &ServiceContext,
    http_method: &HttpMethod,
    query: &Option<String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(Envelope, ResponseType), parse::ParseError> {
    if *http_method == HttpMethod::GET {
        let parameters = parse::query_parameters(query.as_deref())?;
        return Ok((
            Envelope {
                parameters,
                ..Envelope::default()
            },
            ResponseType::Wire(toto_lib::WireFormat::Json),
        ));
    }
    parse::parse_post_body(headers, body, ctx.config().msgpack_enabled).await
}

/// Everything a single envelope produced, plus what the response writer
/// needs to know about it.
enum Outcome {
    Respond {
        response: Response,
        context: Option<MethodContext>,
    },
    Raw {
        body: Vec<u8>,
        content_type: String,
        context: MethodContext,
    },
    Jsonp {
        callback: String,
        result: Value,
        context: MethodContext,
    },
    Redirect {
        location: String,
        context: MethodContext,
    },
}

async fn dispatch_envelope(
    ctx: &Arc<ServiceContext>,
    path: Option<&str>,
    body_method: Option<&str>,
    mut parameters: Map<String, Value>,
    session: Option<SessionRecord>,
) -> Outcome {
    let method_path = match select_method_path(ctx.config().method_select, path, body_method) {
        Ok(path) => path,
        Err(e) => {
            return Outcome::Respond {
                response: Response::error(e),
                context: None,
            }
        }
    };
    let Some(method) = ctx.registry().resolve(&method_path) else {
        return Outcome::Respond {
            response: Response::error(TotoError::invalid_method(&method_path)),
            context: None,
        };
    };

    let method_ctx = MethodContext::new(Arc::clone(ctx));
    if let Some(session) = session {
        method_ctx.set_session(session);
    }

    let jsonp_callback = method.jsonp_param.as_ref().and_then(|param| {
        parameters
            .remove(param)
            .and_then(|v| v.as_str().map(str::to_owned))
    });

    if let Err(e) = prepare_invocation(&method, &method_ctx, &mut parameters) {
        return error_outcome(&method, method_ctx, e);
    }

    // Async methods respond through their context; install the channel
    // before invoking so an early respond() cannot be lost.
    let (responder_tx, responder_rx) = oneshot::channel();
    method_ctx.set_responder(responder_tx);

    let result = invoke_guarded(&method, method_ctx.clone(), parameters).await;

    match result {
        Ok(MethodResult::Value(value)) => match jsonp_callback {
            Some(callback) => Outcome::Jsonp {
                callback,
                result: value,
                context: method_ctx,
            },
            None => Outcome::Respond {
                response: Response::result(value),
                context: Some(method_ctx),
            },
        },
        Ok(MethodResult::Raw { body, content_type }) => Outcome::Raw {
            body,
            content_type,
            context: method_ctx,
        },
        Ok(MethodResult::Deferred) => {
            if !method.tags.contains(MethodTags::ASYNC_RESPONSE) {
                log::error!("method '{method_path}' deferred without the async tag");
            }
            let response = responder_rx
                .await
                .unwrap_or_else(|_| Response::error(TotoError::server("Response dropped")));
            Outcome::Respond {
                response,
                context: Some(method_ctx),
            }
        }
        Err(e) => {
            log::error!("toto error {}: {}", e.code, e.value);
            error_outcome(&method, method_ctx, e)
        }
    }
}

/// Apply the method's error redirect map before falling back to a
/// structured error response.
fn error_outcome(method: &Method, context: MethodContext, error: TotoError) -> Outcome {
    let code = error.code.to_string();
    if let Some(location) = method
        .error_redirects
        .get(&code)
        .or(method.default_redirect.as_ref())
    {
        return Outcome::Redirect {
            location: location.clone(),
            context,
        };
    }
    Outcome::Respond {
        response: Response::error(error),
        context: Some(context),
    }
}

fn select_method_path(
    mode: MethodSelect,
    path: Option<&str>,
    body_method: Option<&str>,
) -> Result<String, TotoError> {
    let from_path = || path.and_then(parse::method_from_path);
    let from_body = || body_method.map(str::to_owned);
    let selected = match mode {
        MethodSelect::Url => from_path(),
        MethodSelect::Parameter => from_body(),
        MethodSelect::Both => from_path().or_else(from_body),
    };
    selected.ok_or_else(TotoError::missing_method)
}

/// Batch items dispatch independently and complete unordered; the outer
/// response is written once every key has answered.
async fn process_batch(
    ctx: &Arc<ServiceContext>,
    batch: HashMap<String, Envelope>,
    session: Option<SessionRecord>,
    response_type: ResponseType,
) -> HttpResponse {
    let items = batch.into_iter().map(|(key, envelope)| {
        let ctx = Arc::clone(ctx);
        let session = session.clone();
        async move {
            let outcome = dispatch_envelope(
                &ctx,
                None,
                envelope.method.as_deref(),
                envelope.parameters,
                session,
            )
            .await;
            let response = match outcome {
                Outcome::Respond { response, context } => {
                    if let Some(context) = context {
                        context.finish();
                    }
                    response
                }
                // Raw, jsonp and redirect responses cannot nest inside a
                // batch; surface them as server errors.
                Outcome::Raw { context, .. }
                | Outcome::Jsonp { context, .. }
                | Outcome::Redirect { context, .. } => {
                    context.finish();
                    Response::error(TotoError::server(
                        "Method response type not supported in batch",
                    ))
                }
            };
            (key, response)
        }
    });
    let entries: HashMap<String, Response> = join_all(items).await.into_iter().collect();
    respond(
        ctx.config(),
        session.as_ref(),
        Response::batch(entries),
        response_type,
    )
}

fn render_outcome(
    ctx: &Arc<ServiceContext>,
    outcome: Outcome,
    request_session: Option<SessionRecord>,
    response_type: ResponseType,
) -> HttpResponse {
    match outcome {
        Outcome::Respond { response, context } => {
            // The method may have created or refreshed a session; prefer its
            // view over the one loaded from the request.
            let session = context
                .as_ref()
                .and_then(MethodContext::session)
                .or(request_session);
            if let Some(context) = context {
                context.finish();
            }
            respond(ctx.config(), session.as_ref(), response, response_type)
        }
        Outcome::Raw {
            body,
            content_type,
            context,
        } => {
            context.finish();
            let mut response = (StatusCode::OK, body).into_response();
            insert_header(response.headers_mut(), CONTENT_TYPE.as_str(), &content_type);
            add_cors_headers(ctx.config(), response.headers_mut());
            response
        }
        Outcome::Jsonp {
            callback,
            result,
            context,
        } => {
            context.finish();
            let json = serde_json::to_string(&result).unwrap_or_else(|_| "null".to_owned());
            let mut response =
                (StatusCode::OK, format!("{callback}({json})")).into_response();
            insert_header(response.headers_mut(), CONTENT_TYPE.as_str(), "text/javascript");
            add_cors_headers(ctx.config(), response.headers_mut());
            response
        }
        Outcome::Redirect { location, context } => {
            context.finish();
            let mut response = StatusCode::FOUND.into_response();
            insert_header(response.headers_mut(), LOCATION.as_str(), &location);
            response
        }
    }
}

/// Resolve the presented session id (header first, cookie when enabled) and
/// enforce the request HMAC.
fn load_session(
    ctx: &ServiceContext,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<SessionRecord>, TotoError> {
    let config = ctx.config();
    let header_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let session_id = header_id.or_else(|| {
        if config.use_cookies {
            CookieJar::from_headers(headers)
                .get(SESSION_COOKIE)
                .map(|cookie| cookie.value().to_owned())
        } else {
            None
        }
    });
    let Some(session_id) = session_id else {
        return Ok(None);
    };
    let Some(session) = ctx.store().retrieve_session(&session_id)? else {
        return Ok(None);
    };

    if config.hmac_enabled {
        if let Some(mac) = headers.get(HMAC_HEADER).and_then(|v| v.to_str().ok()) {
            let expected = match hmac_key(config, &session) {
                Some(key) => secret::sign(key.as_bytes(), body),
                None => return Err(TotoError::invalid_hmac()),
            };
            if expected != mac {
                return Err(TotoError::invalid_hmac());
            }
        }
    }
    Ok(Some(session))
}

fn hmac_key(config: &TotoConfig, session: &SessionRecord) -> Option<String> {
    match config.hmac_secret {
        HmacSecret::UserId => Some(session.user_id.to_lowercase()),
        HmacSecret::SessionKey => session.key.clone(),
    }
}

/// Serialize the response envelope, attach the session summary and the
/// response HMAC, and mirror the request's content type.
fn respond(
    config: &TotoConfig,
    session: Option<&SessionRecord>,
    mut response: Response,
    response_type: ResponseType,
) -> HttpResponse {
    if let Some(session) = session {
        response.session = Some(session.info());
    }
    let ResponseType::Wire(format) = response_type;
    let body = match format.encode(&response) {
        Ok(body) => body,
        Err(e) => {
            log::error!("failed to serialize response: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut http_response = (StatusCode::OK, body.clone()).into_response();
    let headers = http_response.headers_mut();
    insert_header(headers, CONTENT_TYPE.as_str(), response_type.mime());
    add_cors_headers(config, headers);
    if config.hmac_enabled {
        if let Some(key) = session.and_then(|s| hmac_key(config, s)) {
            insert_header(headers, HMAC_HEADER, &secret::sign(key.as_bytes(), &body));
        }
    }
    if config.use_cookies {
        if let Some(session) = session {
            let mut cookie = format!("{SESSION_COOKIE}={}; Path=/", session.session_id);
            if let Some(domain) = &config.cookie_domain {
                cookie.push_str("; Domain=");
                cookie.push_str(domain);
            }
            let remaining = session.expires - toto_core::session::unix_now();
            if remaining > 0.0 {
                cookie.push_str(&format!("; Max-Age={}", remaining as i64));
            }
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(SET_COOKIE, value);
            }
        }
    }
    http_response
}

fn add_cors_headers(config: &TotoConfig, headers: &mut HeaderMap) {
    insert_header(headers, "access-control-allow-origin", &config.allow_origin);
    insert_header(headers, "access-control-expose-headers", HMAC_HEADER);
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        headers.insert(name, value);
    }
}
