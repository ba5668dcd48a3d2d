//! End-to-end tests against a live server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use toto_client_api::pipeline::{HMAC_HEADER, SESSION_ID_HEADER};
use toto_client_api::router;
use toto_core::config::TotoConfig;
use toto_core::methods::{Method, MethodContext, MethodRegistry, MethodResult, MethodTags};
use toto_core::secret;
use toto_core::session::memory::MemoryBackend;
use toto_core::session::{SessionStore, SessionTtls};
use toto_core::ServiceContext;
use toto_lib::error::TotoError;

fn register_test_methods(registry: &MethodRegistry) {
    registry.register(
        "return_value",
        Method::new(|_ctx, params| async move { Ok(json!({"parameters": params})) }),
    );
    registry.register(
        "return_value_task",
        Method::with_result(|ctx: MethodContext, params| async move {
            let queue = ctx.service().task_queue("test", 2);
            let value = queue
                .await_task(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    json!({"parameters": params})
                })
                .await?;
            Ok(MethodResult::Value(value))
        }),
    );
    registry.register(
        "return_value_async",
        Method::with_result(|ctx: MethodContext, params| async move {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                ctx.respond_result(json!({"parameters": params}));
            });
            Ok(MethodResult::Deferred)
        })
        .tags(MethodTags::ASYNC_RESPONSE),
    );
    registry.register(
        "throw_toto_exception",
        Method::new(|_ctx, _params| async move {
            Err::<Value, _>(TotoError::new(4242, "Test Toto Exception"))
        }),
    );
    registry.register(
        "verify_session",
        Method::new(|ctx: MethodContext, _params| async move {
            let session = ctx.session().expect("authenticated");
            Ok(json!({"user_id": session.user_id}))
        })
        .tags(MethodTags::AUTHENTICATED),
    );
    registry.register(
        "increment",
        Method::new(|ctx: MethodContext, _params| async move {
            let mut count = 0i64;
            ctx.update_session_state(|state| {
                count = state.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
                state.insert("count".into(), count.into());
            })?;
            Ok(json!({"count": count}))
        })
        .tags(MethodTags::AUTHENTICATED),
    );
}

async fn spawn_server_with(config: TotoConfig) -> (String, Arc<ServiceContext>) {
    let store = SessionStore::new(MemoryBackend::default(), config.session_ttls());
    let ctx = ServiceContext::new(config, store);
    toto_core::methods::builtin::register_builtin_methods(ctx.registry());
    register_test_methods(ctx.registry());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = router(Arc::clone(&ctx));
    tokio::spawn(async move { axum::serve(listener, app).await });
    (base, ctx)
}

async fn spawn_server() -> (String, Arc<ServiceContext>) {
    spawn_server_with(TotoConfig::default()).await
}

async fn request(base: &str, method: &str, parameters: Value) -> Value {
    raw_request(base, &json!({"method": method, "parameters": parameters}), &[]).await
}

async fn raw_request(base: &str, body: &Value, headers: &[(&str, String)]) -> Value {
    let client = reqwest::Client::new();
    let mut builder = client
        .post(base)
        .header("content-type", "application/json")
        .body(body.to_string());
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    let response = builder.send().await.unwrap();
    assert!(response.status().is_success());
    response.json().await.unwrap()
}

async fn authenticated_request(
    base: &str,
    method: &str,
    parameters: Value,
    session_id: &str,
) -> Value {
    raw_request(
        base,
        &json!({"method": method, "parameters": parameters}),
        &[(SESSION_ID_HEADER, session_id.to_owned())],
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn method_returns_parameters() {
    let (base, _ctx) = spawn_server().await;
    let params = json!({"arg1": 1, "arg2": "hello"});
    let response = request(&base, "return_value", params.clone()).await;
    assert_eq!(response["result"]["parameters"], params);
}

#[tokio::test(flavor = "multi_thread")]
async fn task_queue_methods_resolve() {
    let (base, _ctx) = spawn_server().await;
    let params = json!({"arg1": 1, "arg2": "hello"});
    let response = request(&base, "return_value_task", params.clone()).await;
    assert_eq!(response["result"]["parameters"], params);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_methods_respond_out_of_band() {
    let (base, _ctx) = spawn_server().await;
    let params = json!({"arg1": 1, "arg2": "hello"});
    let response = request(&base, "return_value_async", params.clone()).await;
    assert_eq!(response["result"]["parameters"], params);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_method_is_1002() {
    let (base, _ctx) = spawn_server().await;
    let response = raw_request(&base, &json!({"parameters": {"a": 1}}), &[]).await;
    assert_eq!(
        response,
        json!({"error": {"code": 1002, "value": "Missing method."}})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_method_path_is_1001() {
    let (base, _ctx) = spawn_server().await;
    let response = request(&base, "bad_method.test", json!({})).await;
    assert_eq!(
        response["error"],
        json!({"code": 1001, "value": "Cannot call 'bad_method.test'."})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_error_codes_pass_through() {
    let (base, _ctx) = spawn_server().await;
    let response = request(&base, "throw_toto_exception", json!({})).await;
    assert_eq!(
        response["error"],
        json!({"code": 4242, "value": "Test Toto Exception"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn url_selects_the_method() {
    let (base, _ctx) = spawn_server().await;
    let params = json!({"arg1": 1, "arg2": "hello"});
    let response = raw_request(
        &format!("{base}/return_value"),
        &json!({"parameters": params}),
        &[],
    )
    .await;
    assert_eq!(response["result"]["parameters"], params);
}

#[tokio::test(flavor = "multi_thread")]
async fn get_flattens_single_query_values() {
    let (base, _ctx) = spawn_server().await;
    let response: Value = reqwest::get(format!("{base}/return_value?arg1=1&arg2=hello"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        response["result"]["parameters"],
        json!({"arg1": "1", "arg2": "hello"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn form_posts_carry_list_parameters() {
    let (base, _ctx) = spawn_server().await;
    let client = reqwest::Client::new();
    let response: Value = client
        .post(format!("{base}/return_value"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body("arg1=1&arg2=hello")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["result"]["parameters"]["arg1"][0], "1");
    assert_eq!(response["result"]["parameters"]["arg2"][0], "hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_entries_answer_under_their_keys() {
    let (base, _ctx) = spawn_server().await;
    let body = json!({"batch": {
        "k1": {"method": "return_value", "parameters": {"arg": "k1"}},
        "k2": {"method": "return_value", "parameters": {"arg": "k2"}},
    }});
    let response = raw_request(&base, &body, &[]).await;
    assert_eq!(response["batch"]["k1"]["result"]["parameters"]["arg"], "k1");
    assert_eq!(response["batch"]["k2"]["result"]["parameters"]["arg"], "k2");
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_mixes_sync_and_async_items() {
    let (base, _ctx) = spawn_server().await;
    let body = json!({"batch": {
        "a": {"method": "return_value_async", "parameters": {"arg": "a"}},
        "b": {"method": "return_value", "parameters": {"arg": "b"}},
        "c": {"method": "bad_method.test", "parameters": {}},
    }});
    let response = raw_request(&base, &body, &[]).await;
    assert_eq!(response["batch"]["a"]["result"]["parameters"]["arg"], "a");
    assert_eq!(response["batch"]["b"]["result"]["parameters"]["arg"], "b");
    assert_eq!(response["batch"]["c"]["error"]["code"], 1001);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_login_and_increment_a_counter() {
    let (base, _ctx) = spawn_server().await;
    let user = format!("u-{}", uuid::Uuid::new_v4().simple());

    let created = request(
        &base,
        "account.create",
        json!({"user_id": user, "password": "pw"}),
    )
    .await;
    let first_session = created["result"]["session_id"].as_str().unwrap().to_owned();

    let verified = authenticated_request(&base, "verify_session", json!({}), &first_session).await;
    assert_eq!(verified["result"]["user_id"], user);

    let login = request(
        &base,
        "account.login",
        json!({"user_id": user, "password": "pw"}),
    )
    .await;
    let session = login["result"]["session_id"].as_str().unwrap().to_owned();
    assert_ne!(session, first_session);

    for expected in 1..=3 {
        let response = authenticated_request(&base, "increment", json!({}), &session).await;
        assert_eq!(response["result"]["count"], expected);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_login_is_1005() {
    let (base, _ctx) = spawn_server().await;
    let response = request(
        &base,
        "account.login",
        json!({"user_id": "nope", "password": "x"}),
    )
    .await;
    assert_eq!(
        response["error"],
        json!({"code": 1005, "value": "Invalid user ID or password"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn authenticated_methods_require_a_session() {
    let (base, _ctx) = spawn_server().await;
    let response = request(&base, "verify_session", json!({})).await;
    assert_eq!(response["error"]["code"], 1004);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_hmac_verifies_and_rejects_tampering() {
    let (base, _ctx) = spawn_server().await;
    let user = format!("u-{}", uuid::Uuid::new_v4().simple());
    let created = request(
        &base,
        "account.create",
        json!({"user_id": user, "password": "pw"}),
    )
    .await;
    let session_id = created["result"]["session_id"].as_str().unwrap().to_owned();

    let body = json!({"method": "verify_session", "parameters": {}}).to_string();
    let mac = secret::sign(user.as_bytes(), body.as_bytes());

    let client = reqwest::Client::new();
    let ok: Value = client
        .post(&base)
        .header("content-type", "application/json")
        .header(SESSION_ID_HEADER, &session_id)
        .header(HMAC_HEADER, &mac)
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["result"]["user_id"], user);

    // Same header, single-byte body mutation.
    let tampered = body.replace("verify_session", "verify_sessioN");
    let rejected: Value = client
        .post(&base)
        .header("content-type", "application/json")
        .header(SESSION_ID_HEADER, &session_id)
        .header(HMAC_HEADER, &mac)
        .body(tampered)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rejected["error"]["code"], 1008);
}

#[tokio::test(flavor = "multi_thread")]
async fn responses_carry_a_session_hmac() {
    let (base, _ctx) = spawn_server().await;
    let user = format!("u-{}", uuid::Uuid::new_v4().simple());
    let created = request(
        &base,
        "account.create",
        json!({"user_id": user, "password": "pw"}),
    )
    .await;
    let session_id = created["result"]["session_id"].as_str().unwrap().to_owned();

    let client = reqwest::Client::new();
    let response = client
        .post(&base)
        .header("content-type", "application/json")
        .header(SESSION_ID_HEADER, &session_id)
        .body(json!({"method": "verify_session", "parameters": {}}).to_string())
        .send()
        .await
        .unwrap();
    let mac = response
        .headers()
        .get(HMAC_HEADER)
        .expect("response hmac present")
        .to_str()
        .unwrap()
        .to_owned();
    let body = response.bytes().await.unwrap();
    assert_eq!(mac, secret::sign(user.as_bytes(), &body));

    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["session"]["user_id"], user);
    assert_eq!(parsed["session"]["session_id"], session_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn options_answers_cors_preflight() {
    let (base, _ctx) = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, &base)
        .header("access-control-request-headers", "X-Custom, Content-Type")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "POST,OPTIONS,GET");
    assert_eq!(headers["access-control-expose-headers"], "x-toto-hmac");
    let allowed = headers["access-control-allow-headers"].to_str().unwrap();
    assert!(allowed.contains("x-toto-session-id"));
    assert!(allowed.contains("x-custom"));

    let rejected = client
        .request(reqwest::Method::OPTIONS, &base)
        .header("access-control-request-method", "DELETE")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test(flavor = "multi_thread")]
async fn msgpack_round_trips_when_enabled() {
    let config = TotoConfig {
        msgpack_enabled: true,
        ..TotoConfig::default()
    };
    let (base, _ctx) = spawn_server_with(config).await;
    let mut parameters = Map::new();
    parameters.insert("arg".into(), "x".into());
    let envelope = toto_lib::Envelope::call("return_value", parameters);
    let body = toto_lib::WireFormat::MsgPack.encode(&envelope).unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(&base)
        .header("content-type", "application/msgpack")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["content-type"], "application/msgpack");
    let bytes = response.bytes().await.unwrap();
    let parsed: Value = toto_lib::WireFormat::MsgPack.decode(&bytes).unwrap();
    assert_eq!(parsed["result"]["parameters"]["arg"], "x");
}
