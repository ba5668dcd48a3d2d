//! Bounded background execution for blocking work.
//!
//! Methods must never block the event loop; they hand blocking calls to a
//! [`TaskQueue`], a small pool of plain threads that grows on demand up to a
//! limit and shrinks again when idle. [`InstancePool`] layers a blocking
//! checkout queue over a set of non-thread-safe values (database handles,
//! typically) so they can be borrowed from queue tasks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use toto_lib::error::TotoError;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// FIFO queue executed by up to `thread_count` worker threads.
///
/// Enqueue order is FIFO but tasks run concurrently across workers, so
/// completion order is unspecified beyond the single-thread case.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    thread_count: usize,
    idle_timeout: Duration,
    live: Mutex<usize>,
    idle: AtomicUsize,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, thread_count: usize) -> Self {
        Self::with_idle_timeout(name, thread_count, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        name: impl Into<String>,
        thread_count: usize,
        idle_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        TaskQueue {
            inner: Arc::new(Inner {
                name: name.into(),
                sender,
                receiver,
                thread_count: thread_count.max(1),
                idle_timeout,
                live: Mutex::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a task, spawning a worker if all live workers are busy and
    /// the pool is under its limit.
    pub fn add(&self, task: impl FnOnce() + Send + 'static) {
        self.inner
            .sender
            .send(Box::new(task))
            .expect("task queue channel cannot close while the queue is alive");
        self.spawn_worker_if_needed();
    }

    /// Enqueue a task and await its result on the calling runtime. The
    /// completion is posted back over a channel, never fulfilled on the
    /// worker thread itself. Panics surface as server errors.
    pub fn await_task<T, F>(
        &self,
        task: F,
    ) -> impl std::future::Future<Output = Result<T, TotoError>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.add(move || {
            let result = catch_unwind(AssertUnwindSafe(task));
            // The receiver may have gone away; nothing to do then.
            let _ = tx.send(result.map_err(|cause| TotoError::server(panic_message(&cause))));
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Err(TotoError::server("Task dropped before completion")))
        }
    }

    /// Live worker threads plus queued tasks.
    pub fn len(&self) -> usize {
        *self.inner.live.lock() + self.inner.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_worker_if_needed(&self) {
        let inner = Arc::clone(&self.inner);
        {
            let mut live = inner.live.lock();
            if *live >= inner.thread_count || inner.idle.load(Ordering::Acquire) > 0 {
                return;
            }
            *live += 1;
        }
        std::thread::Builder::new()
            .name(format!("toto-tasks-{}", inner.name))
            .spawn(move || worker_loop(inner))
            .expect("failed to spawn task queue worker");
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let job = inner.receiver.recv_timeout(inner.idle_timeout);
        inner.idle.fetch_sub(1, Ordering::AcqRel);
        match job {
            Ok(job) => {
                if let Err(cause) = catch_unwind(AssertUnwindSafe(job)) {
                    log::error!(
                        "task queue '{}' task panicked: {}",
                        inner.name,
                        panic_message(&cause)
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                *inner.live.lock() -= 1;
                return;
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

/// A set of non-thread-safe instances behind a blocking checkout queue.
///
/// `transaction` borrows one instance for the duration of a closure and
/// returns it on every exit path, including panics. `await_transaction`
/// runs the transaction on the pool's task queue and resolves a future.
pub struct InstancePool<T: Send + 'static> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    queue: TaskQueue,
}

impl<T: Send + 'static> Clone for InstancePool<T> {
    fn clone(&self) -> Self {
        InstancePool {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Send + 'static> InstancePool<T> {
    pub fn new(name: impl Into<String>, instances: Vec<T>) -> Self {
        let name = name.into();
        let queue = TaskQueue::new(name, instances.len().max(1));
        let (sender, receiver) = crossbeam_channel::unbounded();
        for instance in instances {
            sender.send(instance).expect("pool channel open");
        }
        InstancePool {
            sender,
            receiver,
            queue,
        }
    }

    /// Borrow an instance for a multi-call transaction. Blocks until one is
    /// available; do not call from the event loop.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let instance = self
            .receiver
            .recv()
            .expect("instance pool channel cannot close while the pool is alive");
        let mut guard = Checkout {
            instance: Some(instance),
            home: self.sender.clone(),
        };
        f(guard.instance.as_mut().expect("instance checked out"))
    }

    /// Run `transaction` on the pool's task queue, resolving on the calling
    /// runtime.
    pub fn await_transaction<R, F>(
        &self,
        f: F,
    ) -> impl std::future::Future<Output = Result<R, TotoError>>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let pool = self.clone();
        self.queue.await_task(move || pool.transaction(f))
    }
}

struct Checkout<T: Send + 'static> {
    instance: Option<T>,
    home: Sender<T>,
}

impl<T: Send + 'static> Drop for Checkout<T> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            // Returning can only fail if the pool itself is gone.
            let _ = self.home.send(instance);
        }
    }
}
