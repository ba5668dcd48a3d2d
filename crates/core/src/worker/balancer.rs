//! The router process in front of a worker pool.
//!
//! Clients connect to the balancer as if it were a single worker; each
//! request frame is forwarded to a backend worker round-robin, and replies
//! are routed back to the originating client by request id. Running with
//! zero sibling workers turns a deployment into a pure balancer node.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use super::{split_frame, RECONNECT_DELAY};

pub struct WorkerBalancer {
    backends: Vec<String>,
}

impl WorkerBalancer {
    pub fn new(backends: Vec<String>) -> Self {
        WorkerBalancer { backends }
    }

    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let routing: Arc<DashMap<Uuid, mpsc::UnboundedSender<Bytes>>> = Arc::new(DashMap::new());
        let mut backends = Vec::new();
        for address in &self.backends {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(backend_loop(address.clone(), rx, Arc::clone(&routing)));
            backends.push(tx);
        }
        if backends.is_empty() {
            return Err(io::Error::other("balancer needs at least one backend"));
        }
        let backends = Arc::new(backends);
        let cursor = Arc::new(AtomicUsize::new(0));

        loop {
            let (stream, _) = listener.accept().await?;
            let routing = Arc::clone(&routing);
            let backends = Arc::clone(&backends);
            let cursor = Arc::clone(&cursor);
            tokio::spawn(client_loop(stream, routing, backends, cursor));
        }
    }
}

async fn client_loop(
    stream: TcpStream,
    routing: Arc<DashMap<Uuid, mpsc::UnboundedSender<Bytes>>>,
    backends: Arc<Vec<mpsc::UnboundedSender<Bytes>>>,
    cursor: Arc<AtomicUsize>,
) {
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame.freeze(),
            Err(e) => {
                log::error!("balancer client read failed: {e}");
                break;
            }
        };
        let Some((request_id, _)) = split_frame(&frame) else {
            log::error!("dropping malformed frame at balancer");
            continue;
        };
        routing.insert(request_id, reply_tx.clone());
        let backend = &backends[cursor.fetch_add(1, Ordering::Relaxed) % backends.len()];
        if backend.send(frame).is_err() {
            routing.remove(&request_id);
        }
    }
    writer.abort();
}

/// One persistent connection per backend; replies route back by id.
async fn backend_loop(
    address: String,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    routing: Arc<DashMap<Uuid, mpsc::UnboundedSender<Bytes>>>,
) {
    loop {
        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("balancer backend {address} unreachable: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                if outgoing.is_closed() {
                    return;
                }
                continue;
            }
        };
        let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => return,
                },
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        let frame = frame.freeze();
                        if let Some((request_id, _)) = split_frame(&frame) {
                            if let Some((_, client)) = routing.remove(&request_id) {
                                let _ = client.send(frame);
                            }
                        }
                    }
                    _ => break,
                },
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::TotoConfig;
    use crate::context::ServiceContext;
    use crate::methods::Method;
    use crate::session::memory::MemoryBackend;
    use crate::session::{SessionStore, SessionTtls};
    use crate::worker::connection::{InvokeOptions, WorkerConnection};
    use crate::worker::service::WorkerService;
    use crate::worker::WorkerWire;

    #[tokio::test]
    async fn balances_between_backends_and_routes_replies() {
        let mut backend_addresses = Vec::new();
        for tag in ["x", "y"] {
            let store = SessionStore::new(MemoryBackend::default(), SessionTtls::default());
            let ctx = ServiceContext::new(TotoConfig::default(), store);
            let tag = tag.to_owned();
            ctx.registry().register(
                "return_tag",
                Method::new(move |_ctx, _params| {
                    let tag = tag.clone();
                    async move { Ok(serde_json::json!({"tag": tag})) }
                }),
            );
            let service = WorkerService::new(ctx);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            backend_addresses.push(listener.local_addr().unwrap().to_string());
            tokio::spawn(async move { service.serve(listener).await });
        }

        let balancer = WorkerBalancer::new(backend_addresses);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { balancer.serve(listener).await });

        let connection = WorkerConnection::connect_mq(
            [public],
            WorkerWire::default(),
            InvokeOptions {
                timeout: Some(Duration::from_secs(5)),
                retries: 0,
            },
        );
        let mut tags = Vec::new();
        for _ in 0..4 {
            let response = connection
                .invoke("return_tag", serde_json::Map::new())
                .await
                .unwrap();
            tags.push(response["tag"].as_str().unwrap().to_owned());
        }
        let distinct: std::collections::HashSet<_> = tags.iter().collect();
        assert_eq!(distinct.len(), 2);
    }
}
