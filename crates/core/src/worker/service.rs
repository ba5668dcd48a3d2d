//! Server side of the worker fabric.
//!
//! A [`WorkerService`] receives `(request_id, payload)` frames, dispatches
//! the decoded request into the method registry and replies with the
//! serialized return value. Methods tagged `ASYNC_RESPONSE` are
//! acknowledged immediately with a bare id frame, releasing the balancer
//! slot before the method runs for its side effects.
//!
//! A side channel accepts `status` and `shutdown` commands; `shutdown`
//! stops the service after the in-flight message.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use toto_lib::error::TotoError;

use super::{encode_frame, split_frame, WorkerRequest, WorkerWire};
use crate::context::ServiceContext;
use crate::methods::{invoke_guarded, prepare_invocation, MethodContext, MethodResult, MethodTags};

pub struct WorkerService {
    ctx: Arc<ServiceContext>,
    wire: WorkerWire,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        let wire = WorkerWire {
            format: ctx.config().worker_serialization,
            compression: ctx.config().worker_compression,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerService {
            ctx,
            wire,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A handle that stops the service when triggered.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Accept and serve until shut down.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("worker service shutting down");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let ctx = Arc::clone(&self.ctx);
                    let wire = self.wire;
                    let shutdown = self.shutdown_rx.clone();
                    tokio::spawn(serve_connection(ctx, wire, stream, shutdown));
                }
            }
        }
    }

    /// Listen for `status`/`shutdown` control commands.
    pub async fn serve_control(&self, listener: TcpListener) -> io::Result<()> {
        let shutdown = self.shutdown_tx.clone();
        loop {
            let (stream, _) = listener.accept().await?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut frames = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = frames.next().await {
                    match std::str::from_utf8(&frame).map(str::trim) {
                        Ok("shutdown") => {
                            log::info!("received shutdown command");
                            let _ = shutdown.send(true);
                        }
                        Ok("status") => {
                            log::info!("worker pid {} serving", std::process::id());
                        }
                        other => log::warn!("unknown control command: {other:?}"),
                    }
                }
            });
        }
    }
}

/// Send a control command to a running worker service.
pub async fn send_worker_command(address: &str, command: &str) -> io::Result<()> {
    let stream = TcpStream::connect(address).await?;
    let mut frames = Framed::new(stream, LengthDelimitedCodec::new());
    frames
        .send(Bytes::copy_from_slice(command.as_bytes()))
        .await
        .map_err(io::Error::other)
}

/// Requests on one connection are processed in order; only methods that
/// acknowledge early overlap with later messages.
async fn serve_connection(
    ctx: Arc<ServiceContext>,
    wire: WorkerWire,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log::error!("worker connection read failed: {e}");
                return;
            }
            None => return,
        };
        let Some((request_id, Some(payload))) = split_frame(&frame) else {
            log::error!("dropping malformed worker frame");
            continue;
        };

        let request: WorkerRequest = match wire.decode(payload) {
            Ok(request) => request,
            Err(e) => {
                let reply = encode_reply(&wire, Err(e));
                let _ = sink.send(encode_frame(request_id, Some(&reply))).await;
                continue;
            }
        };
        log::info!("received task {request_id}: {}", request.method);

        let Some(method) = ctx.registry().resolve(&request.method) else {
            let reply = encode_reply(&wire, Err(TotoError::invalid_method(&request.method)));
            let _ = sink.send(encode_frame(request_id, Some(&reply))).await;
            continue;
        };

        if method.tags.contains(MethodTags::ASYNC_RESPONSE) {
            // Release the balancer slot, then run for side effects.
            let _ = sink.send(encode_frame(request_id, None)).await;
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                if let Err(e) = run_method(&ctx, &method, request).await {
                    log::error!("async worker method failed: {e}");
                }
            });
            continue;
        }

        let outcome = run_method(&ctx, &method, request).await;
        let reply = encode_reply(&wire, outcome);
        if sink.send(encode_frame(request_id, Some(&reply))).await.is_err() {
            return;
        }
    }
}

async fn run_method(
    ctx: &Arc<ServiceContext>,
    method: &crate::methods::Method,
    request: WorkerRequest,
) -> Result<Value, TotoError> {
    let method_ctx = MethodContext::new(Arc::clone(ctx));
    let mut parameters = request.parameters;
    prepare_invocation(method, &method_ctx, &mut parameters)?;
    match invoke_guarded(method, method_ctx, parameters).await? {
        MethodResult::Value(value) => Ok(value),
        MethodResult::Raw { .. } | MethodResult::Deferred => Ok(Value::Null),
    }
}

/// Success serializes the return value itself; failure serializes the
/// structured error envelope.
fn encode_reply(wire: &WorkerWire, outcome: Result<Value, TotoError>) -> Bytes {
    let body = match outcome {
        Ok(value) => value,
        Err(e) => json!({"error": e}),
    };
    wire.encode(&body).unwrap_or_else(|e| {
        log::error!("failed to encode worker reply: {e}");
        Bytes::new()
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::TotoConfig;
    use crate::methods::Method;
    use crate::session::memory::MemoryBackend;
    use crate::session::{SessionStore, SessionTtls};
    use crate::worker::connection::{InvokeOptions, WorkerConnection};

    fn service_context() -> Arc<ServiceContext> {
        let store = SessionStore::new(MemoryBackend::default(), SessionTtls::default());
        let ctx = ServiceContext::new(TotoConfig::default(), store);
        ctx.registry().register(
            "return_value",
            Method::new(|_ctx, params| async move { Ok(Value::Object(params)) }),
        );
        ctx.registry().register(
            "return_pid",
            Method::new(|_ctx, _params| async move { Ok(json!({"pid": std::process::id()})) }),
        );
        ctx.registry().register(
            "throw_toto_exception",
            Method::new(|_ctx, _params| async move {
                Err::<Value, _>(TotoError::new(4242, "Test Toto Exception"))
            }),
        );
        ctx
    }

    async fn spawn_service(ctx: Arc<ServiceContext>) -> (String, watch::Sender<bool>) {
        let service = WorkerService::new(ctx);
        let shutdown = service.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { service.serve(listener).await });
        (address, shutdown)
    }

    fn client(addresses: &[String]) -> Arc<WorkerConnection> {
        WorkerConnection::connect_mq(
            addresses.iter().cloned(),
            WorkerWire::default(),
            InvokeOptions {
                timeout: Some(Duration::from_secs(5)),
                retries: 0,
            },
        )
    }

    #[tokio::test]
    async fn dispatches_and_replies() {
        let (address, _shutdown) = spawn_service(service_context()).await;
        let connection = client(&[address]);
        let mut parameters = serde_json::Map::new();
        parameters.insert("arg1".into(), 1.into());
        parameters.insert("arg2".into(), "hello".into());
        let response = connection.invoke("return_value", parameters).await.unwrap();
        assert_eq!(response["arg1"], 1);
        assert_eq!(response["arg2"], "hello");
    }

    #[tokio::test]
    async fn unknown_methods_return_structured_errors() {
        let (address, _shutdown) = spawn_service(service_context()).await;
        let connection = client(&[address]);
        let response = connection
            .invoke("bad_method", serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], 1001);
    }

    #[tokio::test]
    async fn custom_error_codes_pass_through() {
        let (address, _shutdown) = spawn_service(service_context()).await;
        let connection = client(&[address]);
        let response = connection
            .invoke("throw_toto_exception", serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], 4242);
        assert_eq!(response["error"]["value"], "Test Toto Exception");
    }

    #[tokio::test]
    async fn requests_round_robin_across_services() {
        // Three services in one process share a pid, so tag them through
        // distinct registries instead.
        let mut addresses = Vec::new();
        let mut shutdowns = Vec::new();
        for tag in ["a", "b", "c"] {
            let store = SessionStore::new(MemoryBackend::default(), SessionTtls::default());
            let ctx = ServiceContext::new(TotoConfig::default(), store);
            let tag = tag.to_owned();
            ctx.registry().register(
                "return_tag",
                Method::new(move |_ctx, _params| {
                    let tag = tag.clone();
                    async move { Ok(json!({"tag": tag})) }
                }),
            );
            let (address, shutdown) = spawn_service(ctx).await;
            shutdowns.push(shutdown);
            addresses.push(address);
        }
        let connection = client(&addresses);
        let mut seen = Vec::new();
        for _ in 0..30 {
            let response = connection
                .invoke("return_tag", serde_json::Map::new())
                .await
                .unwrap();
            seen.push(response["tag"].as_str().unwrap().to_owned());
        }
        // Round robin: the first three replies come from three distinct
        // workers, and the full run is evenly balanced.
        let first_three: std::collections::HashSet<_> = seen[..3].iter().collect();
        assert_eq!(first_three.len(), 3);
        for tag in ["a", "b", "c"] {
            assert_eq!(seen.iter().filter(|t| t.as_str() == tag).count(), 10);
        }
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_service() {
        let service = Arc::new(WorkerService::new(service_context()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_address = control.local_addr().unwrap().to_string();
        let serving = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.serve(listener).await })
        };
        {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.serve_control(control).await });
        }
        send_worker_command(&control_address, "shutdown")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("service stopped on command")
            .unwrap()
            .unwrap();
    }
}
