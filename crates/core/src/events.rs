//! Cross-process event fan-out.
//!
//! Every process runs one [`EventBus`]. Handlers register per event name,
//! either one-shot or persistent; messages arrive over length-delimited TCP
//! frames carrying a compressed, serialized `{name, args}` pair. Sending
//! either broadcasts to every registered peer or load-balances to one peer
//! through a rotating queue. A peer address registered as the local route
//! short-circuits in process.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use toto_lib::wire::{Compression, WireFormat};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One event as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub name: String,
    pub args: Value,
}

type Callback = Arc<dyn Fn(Value) + Send + Sync>;

struct HandlerRecord {
    id: u64,
    callback: Callback,
    on_main_loop: bool,
    /// Set by the owning request/connection when it finishes; a finished
    /// owner's handler is skipped silently.
    finished: Option<Arc<AtomicBool>>,
    persist: bool,
}

/// Identifies a registered handler for later removal.
pub struct EventHandle {
    name: String,
    id: u64,
}

#[derive(Default)]
struct Outbound {
    connections: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    rotation: VecDeque<String>,
    local_route: Option<String>,
}

pub struct EventBus {
    format: WireFormat,
    compression: Compression,
    handlers: Mutex<HashMap<String, Vec<HandlerRecord>>>,
    next_id: AtomicU64,
    outbound: Mutex<Outbound>,
}

impl EventBus {
    pub fn new(format: WireFormat, compression: Compression) -> Arc<Self> {
        Arc::new(EventBus {
            format,
            compression,
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            outbound: Mutex::new(Outbound::default()),
        })
    }

    /// Bind the listener and start dispatching inbound events. Returns the
    /// bound address (useful with port 0).
    pub async fn start_listening(self: &Arc<Self>, address: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let bus = Arc::clone(&bus);
                        tokio::spawn(bus.read_events(stream));
                    }
                    Err(e) => {
                        log::error!("event listener accept failed: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        Ok(local)
    }

    async fn read_events(self: Arc<Self>, stream: TcpStream) {
        let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => match self.decode(&frame) {
                    Ok(event) => self.receive(event),
                    Err(e) => log::error!("dropping undecodable event: {e}"),
                },
                Err(e) => {
                    log::error!("event connection failed: {e}");
                    return;
                }
            }
        }
    }

    /// Register a peer to receive sent events. The connection is maintained
    /// in the background and re-dialed on failure.
    pub fn register_server(&self, address: impl Into<String>) {
        let address = address.into();
        let mut outbound = self.outbound.lock();
        if outbound.connections.contains_key(&address) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        outbound.connections.insert(address.clone(), tx);
        outbound.rotation.push_back(address.clone());
        if outbound.local_route.as_deref() != Some(address.as_str()) {
            tokio::spawn(write_events(address, rx));
        }
    }

    /// Mark `address` as this process; events sent to it dispatch in-process
    /// instead of over the wire.
    pub fn set_local_route(&self, address: impl Into<String>) {
        self.outbound.lock().local_route = Some(address.into());
    }

    pub fn register_handler(
        &self,
        name: impl Into<String>,
        callback: impl Fn(Value) + Send + Sync + 'static,
        on_main_loop: bool,
        finished: Option<Arc<AtomicBool>>,
        persist: bool,
    ) -> EventHandle {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(name.clone())
            .or_default()
            .push(HandlerRecord {
                id,
                callback: Arc::new(callback),
                on_main_loop,
                finished,
                persist,
            });
        EventHandle { name, id }
    }

    pub fn remove_handler(&self, handle: &EventHandle) {
        if let Some(records) = self.handlers.lock().get_mut(&handle.name) {
            records.retain(|record| record.id != handle.id);
        }
    }

    /// Dispatch an event to the local handler set. One-shot handlers are
    /// removed before invocation; handlers whose owner already finished are
    /// skipped. Handler panics are logged and isolated.
    pub fn receive(&self, event: EventMessage) {
        let records: Vec<(Callback, bool)> = {
            let mut handlers = self.handlers.lock();
            let Some(list) = handlers.get_mut(&event.name) else {
                return;
            };
            let taken = std::mem::take(list);
            let mut runnable = Vec::new();
            for record in taken {
                let finished = record
                    .finished
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::Acquire));
                if finished {
                    continue;
                }
                runnable.push((Arc::clone(&record.callback), record.on_main_loop));
                if record.persist {
                    list.push(record);
                }
            }
            runnable
        };
        for (callback, on_main_loop) in records {
            let args = event.args.clone();
            if on_main_loop {
                tokio::spawn(async move {
                    if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                        log::error!("event handler panicked");
                    }
                });
            } else if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                log::error!("event handler panicked");
            }
        }
    }

    /// Send to one peer, rotating through the registered set.
    pub fn send(&self, name: impl Into<String>, args: Value) {
        self.dispatch(
            EventMessage {
                name: name.into(),
                args,
            },
            false,
        );
    }

    /// Send to every registered peer.
    pub fn broadcast(&self, name: impl Into<String>, args: Value) {
        self.dispatch(
            EventMessage {
                name: name.into(),
                args,
            },
            true,
        );
    }

    fn dispatch(&self, event: EventMessage, broadcast: bool) {
        let payload = match self.encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode event '{}': {e}", event.name);
                return;
            }
        };
        let mut outbound = self.outbound.lock();
        let targets: Vec<String> = if broadcast {
            outbound.rotation.iter().cloned().collect()
        } else {
            match outbound.rotation.pop_front() {
                Some(address) => {
                    outbound.rotation.push_back(address.clone());
                    vec![address]
                }
                None => Vec::new(),
            }
        };
        let local_route = outbound.local_route.clone();
        for address in targets {
            if local_route.as_deref() == Some(address.as_str()) {
                drop(outbound);
                self.receive(event.clone());
                outbound = self.outbound.lock();
                continue;
            }
            if let Some(sender) = outbound.connections.get(&address) {
                if sender.send(payload.clone()).is_err() {
                    log::error!("event writer for {address} is gone");
                }
            }
        }
    }

    fn encode(&self, event: &EventMessage) -> Result<Bytes, toto_lib::wire::WireError> {
        let bytes = self.format.encode(event)?;
        Ok(Bytes::from(self.compression.compress(&bytes)?))
    }

    fn decode(&self, frame: &[u8]) -> Result<EventMessage, toto_lib::wire::WireError> {
        let bytes = self.compression.decompress(frame)?;
        self.format.decode(&bytes)
    }
}

/// Writer task for one peer: dial, drain the queue, re-dial on failure.
/// Transport errors never kill the bus, only delay delivery.
async fn write_events(address: String, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    loop {
        let stream = match TcpStream::connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("event peer {address} unreachable: {e}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                if rx.is_closed() {
                    return;
                }
                continue;
            }
        };
        let mut frames = FramedWrite::new(stream, LengthDelimitedCodec::new());
        while let Some(payload) = rx.recv().await {
            if let Err(e) = frames.send(payload).await {
                log::error!("event send to {address} failed: {e}");
                break;
            }
        }
        if rx.is_closed() {
            return;
        }
    }
}
