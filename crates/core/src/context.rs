//! The explicit shared state of one service process.
//!
//! Everything the original kept in globals and singletons (options, the
//! event manager, named task queues, default worker connections) hangs off
//! one [`ServiceContext`] constructed in the binary and shared by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::TotoConfig;
use crate::events::EventBus;
use crate::methods::MethodRegistry;
use crate::session::SessionStore;
use crate::tasks::TaskQueue;
use crate::worker::connection::WorkerConnection;

pub struct ServiceContext {
    config: TotoConfig,
    store: SessionStore,
    registry: MethodRegistry,
    events: Arc<EventBus>,
    task_queues: Mutex<HashMap<String, TaskQueue>>,
    workers: RwLock<HashMap<String, Arc<WorkerConnection>>>,
}

impl ServiceContext {
    pub fn new(config: TotoConfig, store: SessionStore) -> Arc<Self> {
        let events = EventBus::new(config.event_serialization, config.event_compression);
        Arc::new(ServiceContext {
            config,
            store,
            registry: MethodRegistry::new(),
            events,
            task_queues: Mutex::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TotoConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The named task queue, created on first use.
    pub fn task_queue(&self, name: &str, thread_count: usize) -> TaskQueue {
        self.task_queues
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| TaskQueue::new(name, thread_count))
            .clone()
    }

    pub fn register_worker(&self, name: &str, connection: Arc<WorkerConnection>) {
        self.workers.write().insert(name.to_owned(), connection);
    }

    pub fn worker(&self, name: &str) -> Option<Arc<WorkerConnection>> {
        self.workers.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::MemoryBackend;
    use crate::session::SessionTtls;

    #[tokio::test]
    async fn named_task_queues_are_shared() {
        let store = SessionStore::new(MemoryBackend::default(), SessionTtls::default());
        let ctx = ServiceContext::new(TotoConfig::default(), store);
        let a = ctx.task_queue("db", 2);
        let b = ctx.task_queue("db", 4);
        assert_eq!(a.name(), b.name());
        // The second request reuses the existing queue; its thread count is
        // fixed at creation.
        let value = b.await_task(|| 7).await.unwrap();
        assert_eq!(value, 7);
    }
}
