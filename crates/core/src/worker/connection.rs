//! Client side of the worker fabric.
//!
//! A [`WorkerConnection`] multiplexes invocations over a mutable set of
//! worker endpoints. Each invocation gets a fresh request id, is emitted to
//! the next endpoint in a shuffled round-robin order, and resolves a future
//! when the matching reply arrives. A driver task owns the timeout wheel;
//! transport tasks own the sockets, so set mutations never touch a socket
//! from the caller's thread.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::time::delay_queue::{self, DelayQueue};
use uuid::Uuid;

use toto_lib::error::TotoError;

use super::{encode_frame, split_frame, WorkerRequest, WorkerWire, RECONNECT_DELAY};

/// Reply channel item: the request id plus the body (`None` for the early
/// acknowledgement) or a transport error.
type ReplyMsg = (Uuid, Result<Option<Bytes>, TotoError>);

/// Per-invocation deadline and retry policy.
#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    /// Reply deadline; `None` never times out.
    pub timeout: Option<Duration>,
    /// Re-sends to another endpoint before giving up.
    pub retries: u32,
}

struct ActiveRequest {
    payload: Bytes,
    timeout: Option<Duration>,
    retries_left: u32,
    responder: oneshot::Sender<Result<Value, TotoError>>,
}

#[derive(Default)]
struct ConnectionSet {
    active: HashSet<String>,
    ordered: Vec<String>,
    cursor: usize,
}

impl ConnectionSet {
    /// Reshuffle the linearization and reset the cursor; called after every
    /// mutation of the set.
    fn rebuild(&mut self) {
        self.ordered = self.active.iter().cloned().collect();
        self.ordered.shuffle(&mut rand::thread_rng());
        self.cursor = 0;
    }

    fn next(&mut self) -> Result<String, TotoError> {
        if self.ordered.is_empty() {
            return Err(TotoError::new(-1, "No active connections"));
        }
        let endpoint = self.ordered[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.ordered.len();
        Ok(endpoint)
    }
}

trait Transport: Send + Sync + 'static {
    fn connect(&self, _endpoint: &str) {}
    fn disconnect(&self, _endpoint: &str) {}
    fn send(&self, endpoint: &str, request_id: Uuid, payload: Bytes);
}

struct Shared {
    wire: WorkerWire,
    defaults: InvokeOptions,
    set: Mutex<ConnectionSet>,
    requests: DashMap<Uuid, ActiveRequest>,
    transport: Box<dyn Transport>,
}

impl Shared {
    fn next_endpoint(&self) -> Result<String, TotoError> {
        self.set.lock().next()
    }

    fn fulfill(&self, request_id: Uuid, outcome: Result<Value, TotoError>) {
        if let Some((_, request)) = self.requests.remove(&request_id) {
            // The caller may have stopped waiting; that is fine.
            let _ = request.responder.send(outcome);
        }
    }
}

pub struct WorkerConnection {
    shared: Arc<Shared>,
    timers: mpsc::UnboundedSender<TimerMsg>,
}

enum TimerMsg {
    Arm(Uuid, Duration),
}

impl WorkerConnection {
    /// Connect over the message-queue binding: one long-lived framed TCP
    /// connection per endpoint.
    pub fn connect_mq<I, S>(endpoints: I, wire: WorkerWire, defaults: InvokeOptions) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self::build(
            Box::new(MqTransport::new(reply_tx)),
            endpoints,
            wire,
            defaults,
            reply_rx,
        )
    }

    /// Connect over the HTTP binding: one POST per invocation.
    pub fn connect_http<I, S>(endpoints: I, wire: WorkerWire, defaults: InvokeOptions) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mime = wire.format.mime();
        Self::build(
            Box::new(HttpTransport::new(reply_tx, mime)),
            endpoints,
            wire,
            defaults,
            reply_rx,
        )
    }

    fn build<I, S>(
        transport: Box<dyn Transport>,
        endpoints: I,
        wire: WorkerWire,
        defaults: InvokeOptions,
        reply_rx: mpsc::UnboundedReceiver<ReplyMsg>,
    ) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shared = Arc::new(Shared {
            wire,
            defaults,
            set: Mutex::new(ConnectionSet::default()),
            requests: DashMap::new(),
            transport,
        });
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(Arc::clone(&shared), timer_rx, reply_rx));
        let connection = Arc::new(WorkerConnection {
            shared,
            timers: timer_tx,
        });
        for endpoint in endpoints {
            connection.add_connection(&endpoint.into());
        }
        connection
    }

    /// Invoke `method` on one of the connected workers with the connection's
    /// default timeout and retry policy.
    pub fn invoke(
        &self,
        method: &str,
        parameters: serde_json::Map<String, Value>,
    ) -> impl Future<Output = Result<Value, TotoError>> {
        self.invoke_with(method, parameters, self.shared.defaults)
    }

    pub fn invoke_with(
        &self,
        method: &str,
        parameters: serde_json::Map<String, Value>,
        options: InvokeOptions,
    ) -> impl Future<Output = Result<Value, TotoError>> {
        let (tx, rx) = oneshot::channel();
        self.start_invocation(method, parameters, options, tx);
        async move {
            rx.await
                .unwrap_or_else(|_| Err(TotoError::server("Worker connection closed")))
        }
    }

    fn start_invocation(
        &self,
        method: &str,
        parameters: serde_json::Map<String, Value>,
        options: InvokeOptions,
        responder: oneshot::Sender<Result<Value, TotoError>>,
    ) {
        let request = WorkerRequest {
            method: method.to_owned(),
            parameters,
        };
        let payload = match self.shared.wire.encode(&request) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };
        let endpoint = match self.shared.next_endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = responder.send(Err(e));
                return;
            }
        };
        let request_id = Uuid::new_v4();
        self.shared.requests.insert(
            request_id,
            ActiveRequest {
                payload: payload.clone(),
                timeout: options.timeout,
                retries_left: options.retries,
                responder,
            },
        );
        self.shared.transport.send(&endpoint, request_id, payload);
        if let Some(timeout) = options.timeout {
            if self.timers.send(TimerMsg::Arm(request_id, timeout)).is_err() {
                self.shared
                    .fulfill(request_id, Err(TotoError::server("Worker driver stopped")));
            }
        }
    }

    pub fn add_connection(&self, endpoint: &str) {
        let mut set = self.shared.set.lock();
        if set.active.insert(endpoint.to_owned()) {
            self.shared.transport.connect(endpoint);
            set.rebuild();
        }
    }

    pub fn remove_connection(&self, endpoint: &str) {
        let mut set = self.shared.set.lock();
        if set.active.remove(endpoint) {
            self.shared.transport.disconnect(endpoint);
            set.rebuild();
        }
    }

    /// Make the connected set exactly `endpoints`, connecting and
    /// disconnecting as needed. In-flight requests are unaffected; retries
    /// pick from the new set.
    pub fn set_connections<I, S>(&self, endpoints: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target: HashSet<String> = endpoints.into_iter().map(Into::into).collect();
        let mut set = self.shared.set.lock();
        for endpoint in set.active.difference(&target) {
            self.shared.transport.disconnect(endpoint);
        }
        for endpoint in target.difference(&set.active) {
            self.shared.transport.connect(endpoint);
        }
        set.active = target;
        set.rebuild();
    }

    pub fn active_connections(&self) -> HashSet<String> {
        self.shared.set.lock().active.clone()
    }

    /// Outstanding (unanswered) invocations.
    pub fn len(&self) -> usize {
        self.shared.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.requests.is_empty()
    }
}

/// The driver task: completes requests on reply, and on expiry either
/// re-emits to the next endpoint or fails the future with a timeout.
async fn drive(
    shared: Arc<Shared>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerMsg>,
    mut reply_rx: mpsc::UnboundedReceiver<ReplyMsg>,
) {
    let mut delays: DelayQueue<Uuid> = DelayQueue::new();
    let mut keys: HashMap<Uuid, delay_queue::Key> = HashMap::new();
    loop {
        tokio::select! {
            msg = timer_rx.recv() => match msg {
                Some(TimerMsg::Arm(request_id, timeout)) => {
                    keys.insert(request_id, delays.insert(request_id, timeout));
                }
                // The connection itself is gone.
                None => return,
            },
            Some((request_id, result)) = reply_rx.recv() => {
                if let Some(key) = keys.remove(&request_id) {
                    delays.try_remove(&key);
                }
                let outcome = match result {
                    Ok(Some(body)) => shared.wire.decode(&body),
                    Ok(None) => Ok(Value::Null),
                    Err(e) => Err(e),
                };
                // Unknown ids already timed out; `fulfill` drops them silently.
                shared.fulfill(request_id, outcome);
            },
            expired = std::future::poll_fn(|cx| delays.poll_expired(cx)), if !keys.is_empty() => {
                let Some(expired) = expired else { continue };
                let request_id = expired.into_inner();
                keys.remove(&request_id);
                if let Some(timeout) = handle_timeout(&shared, request_id) {
                    keys.insert(request_id, delays.insert(request_id, timeout));
                }
            },
        }
    }
}

/// Returns the new deadline when the request was re-emitted.
fn handle_timeout(shared: &Arc<Shared>, request_id: Uuid) -> Option<Duration> {
    let (payload, timeout) = {
        let mut entry = shared.requests.get_mut(&request_id)?;
        if entry.retries_left == 0 {
            drop(entry);
            shared.fulfill(request_id, Err(TotoError::new(-1, "Timeout")));
            return None;
        }
        entry.retries_left -= 1;
        (entry.payload.clone(), entry.timeout)
    };
    match shared.next_endpoint() {
        Ok(endpoint) => {
            log::info!("retrying worker request {request_id} on {endpoint}");
            shared.transport.send(&endpoint, request_id, payload);
            timeout
        }
        Err(e) => {
            shared.fulfill(request_id, Err(e));
            None
        }
    }
}

/// Message-queue binding: a command task owns per-endpoint writer channels;
/// each endpoint task owns one framed TCP connection and re-dials on
/// failure.
struct MqTransport {
    commands: mpsc::UnboundedSender<MqCommand>,
}

enum MqCommand {
    Connect(String),
    Disconnect(String),
    Send(String, Uuid, Bytes),
}

impl MqTransport {
    fn new(replies: mpsc::UnboundedSender<ReplyMsg>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(mq_command_loop(rx, replies));
        MqTransport { commands: tx }
    }
}

impl Transport for MqTransport {
    fn connect(&self, endpoint: &str) {
        let _ = self.commands.send(MqCommand::Connect(endpoint.to_owned()));
    }

    fn disconnect(&self, endpoint: &str) {
        let _ = self
            .commands
            .send(MqCommand::Disconnect(endpoint.to_owned()));
    }

    fn send(&self, endpoint: &str, request_id: Uuid, payload: Bytes) {
        let _ = self
            .commands
            .send(MqCommand::Send(endpoint.to_owned(), request_id, payload));
    }
}

async fn mq_command_loop(
    mut commands: mpsc::UnboundedReceiver<MqCommand>,
    replies: mpsc::UnboundedSender<ReplyMsg>,
) {
    let mut endpoints: HashMap<String, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    while let Some(command) = commands.recv().await {
        match command {
            MqCommand::Connect(endpoint) => {
                endpoints.entry(endpoint.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(mq_endpoint_loop(endpoint, rx, replies.clone()));
                    tx
                });
            }
            MqCommand::Disconnect(endpoint) => {
                // Dropping the writer ends the endpoint task.
                endpoints.remove(&endpoint);
            }
            MqCommand::Send(endpoint, request_id, payload) => match endpoints.get(&endpoint) {
                Some(writer) => {
                    let _ = writer.send(encode_frame(request_id, Some(&payload)));
                }
                None => log::warn!("dropping send to unconnected worker {endpoint}"),
            },
        }
    }
}

async fn mq_endpoint_loop(
    endpoint: String,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    replies: mpsc::UnboundedSender<ReplyMsg>,
) {
    loop {
        let stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("worker {endpoint} unreachable: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                if outgoing.is_closed() {
                    return;
                }
                continue;
            }
        };
        let (mut sink, mut stream) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            log::error!("send to worker {endpoint} failed: {e}");
                            break;
                        }
                    }
                    // Disconnected from the set.
                    None => return,
                },
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => match split_frame(&frame) {
                        Some((request_id, body)) => {
                            let _ = replies.send((request_id, Ok(body.map(Bytes::copy_from_slice))));
                        }
                        None => log::error!("malformed frame from worker {endpoint}"),
                    },
                    Some(Err(e)) => {
                        log::error!("worker {endpoint} read failed: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// HTTP binding: every invocation is an independent POST; the reply body is
/// the serialized response. Transport failures become errors on the future.
struct HttpTransport {
    client: reqwest::Client,
    replies: mpsc::UnboundedSender<ReplyMsg>,
    mime: &'static str,
}

impl HttpTransport {
    fn new(replies: mpsc::UnboundedSender<ReplyMsg>, mime: &'static str) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            replies,
            mime,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, endpoint: &str, request_id: Uuid, payload: Bytes) {
        let client = self.client.clone();
        let replies = self.replies.clone();
        let mime = self.mime;
        let url = endpoint.to_owned();
        tokio::spawn(async move {
            let result = async {
                let response = client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, mime)
                    .body(payload.to_vec())
                    .send()
                    .await
                    .map_err(|e| TotoError::new(-1, e.to_string()))?;
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| TotoError::new(-1, e.to_string()))?;
                Ok(Some(body))
            }
            .await;
            let _ = replies.send((request_id, result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(endpoints: &[&str]) -> Arc<WorkerConnection> {
        WorkerConnection::connect_mq(
            endpoints.iter().copied(),
            WorkerWire::default(),
            InvokeOptions {
                timeout: Some(Duration::from_millis(100)),
                retries: 0,
            },
        )
    }

    #[tokio::test]
    async fn set_connections_replaces_the_set() {
        let connection = connection(&["127.0.0.1:1", "127.0.0.1:2"]);
        connection.set_connections(["127.0.0.1:3"]);
        assert_eq!(
            connection.active_connections(),
            HashSet::from(["127.0.0.1:3".to_owned()])
        );
        connection.add_connection("127.0.0.1:4");
        connection.remove_connection("127.0.0.1:3");
        assert_eq!(
            connection.active_connections(),
            HashSet::from(["127.0.0.1:4".to_owned()])
        );
    }

    #[tokio::test]
    async fn invoke_with_no_connections_fails_fast() {
        let connection = connection(&[]);
        let err = connection
            .invoke("anything", serde_json::Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.value, "No active connections");
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        // A listener that accepts and never replies.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                sockets.push(socket);
            }
        });
        let connection = connection(&[address.as_str()]);
        let err = connection
            .invoke("return_value", serde_json::Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.value, "Timeout");
        assert!(connection.is_empty());
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let mut set = ConnectionSet::default();
        set.active = ["a", "b", "c"].map(str::to_owned).into();
        set.rebuild();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            *counts.entry(set.next().unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 10));
    }
}
