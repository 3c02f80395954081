//! Work queue and worker thread for the update pipeline.
//!
//! The queue is the only concurrency point in the agent core: transport
//! threads enqueue opaque JSON payloads, a single dedicated worker thread
//! dequeues them in FIFO order and hands each to a processor callback. The
//! worker observes a cooperative stop flag so shutdown never blocks the
//! caller.
//!
//! # Example
//!
//! ```
//! use overair_queue::WorkQueue;
//!
//! let queue = WorkQueue::bounded(8);
//! assert!(queue.enqueue(r#"{"kind":"tick"}"#));
//! let item = queue.take_next().expect("item");
//! assert_eq!(item.payload(), r#"{"kind":"tick"}"#);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

/// One unit of work: an opaque JSON payload stamped at insertion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    payload: String,
    time_added_epoch_secs: i64,
}

impl WorkItem {
    /// The opaque JSON payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Epoch seconds at which the item was enqueued.
    pub fn time_added(&self) -> i64 {
        self.time_added_epoch_secs
    }
}

/// Bounded, lock-protected FIFO of [`WorkItem`]s.
#[derive(Debug)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    capacity: usize,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        })
    }

    /// Append an item. Returns `false` when the queue is full.
    pub fn enqueue(&self, payload: impl Into<String>) -> bool {
        let mut items = self.items.lock().expect("work queue poisoned");
        if items.len() >= self.capacity {
            warn!(capacity = self.capacity, "work queue full, dropping item");
            return false;
        }
        items.push_back(WorkItem {
            payload: payload.into(),
            time_added_epoch_secs: Utc::now().timestamp(),
        });
        true
    }

    /// Pop the oldest item without blocking.
    pub fn take_next(&self) -> Option<WorkItem> {
        self.items.lock().expect("work queue poisoned").pop_front()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().expect("work queue poisoned").len()
    }

    /// Whether the queue has no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interval the worker sleeps when the queue is empty.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Single dedicated worker thread draining a [`WorkQueue`].
///
/// `stop()` flips the shared flag and returns immediately; the thread
/// finishes its current item, observes the flag at the top of the loop and
/// exits. The join happens in [`Worker::join`] (or on drop).
pub struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread.
    ///
    /// `processor` runs on the worker thread for every dequeued item. The
    /// `stop` flag is shared so collaborators holding a clone may request
    /// shutdown themselves.
    pub fn start<F>(queue: Arc<WorkQueue>, stop: Arc<AtomicBool>, mut processor: F) -> Self
    where
        F: FnMut(WorkItem) + Send + 'static,
    {
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("overair-worker".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match queue.take_next() {
                        Some(item) => processor(item),
                        None => thread::sleep(IDLE_POLL_INTERVAL),
                    }
                }
            })
            .expect("failed to spawn worker thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Request a stop. Returns immediately; the thread exits after its
    /// current item.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Wait for the worker thread to exit. Implies [`Worker::stop`].
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
