//! Bounded, completable FIFO queue of detected file events
//!
//! Multiple producers (scans, watcher flushes) feed one consumer (the
//! handler's processing loop). `add` waits for capacity, which is the
//! backpressure mechanism bounding producer speed; `take` waits with a
//! timeout so the consumer stays responsive to pause and cancellation.
//! After `complete()` no further adds are accepted but draining continues
//! until empty.

use crate::error::{MonitorError, Result};
use crate::monitor::FileEvent;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

pub struct EventQueue {
    inner: Mutex<VecDeque<FileEvent>>,
    capacity: usize,
    completed: AtomicBool,
    item_added: Notify,
    space_freed: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            completed: AtomicBool::new(false),
            item_added: Notify::new(),
            space_freed: Notify::new(),
        }
    }

    /// Append an event, waiting for capacity if the queue is full.
    ///
    /// Fails with [`MonitorError::QueueClosed`] once the queue has been
    /// completed.
    pub async fn add(&self, event: FileEvent) -> Result<()> {
        loop {
            if self.completed.load(Ordering::Acquire) {
                return Err(MonitorError::QueueClosed);
            }
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.len() < self.capacity {
                    trace!(path = %event.path, kind = ?event.event_type, "enqueued event");
                    inner.push_back(event);
                    drop(inner);
                    self.item_added.notify_one();
                    return Ok(());
                }
            }
            self.space_freed.notified().await;
        }
    }

    /// Take the oldest event, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout or when the queue is completed and drained.
    pub async fn take(&self, timeout: Duration) -> Option<FileEvent> {
        tokio::time::timeout(timeout, async {
            loop {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(event) = inner.pop_front() {
                        drop(inner);
                        self.space_freed.notify_one();
                        return Some(event);
                    }
                }
                if self.completed.load(Ordering::Acquire) {
                    return None;
                }
                self.item_added.notified().await;
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Move to the terminal state: no further adds, drain proceeds to empty.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.item_added.notify_waiters();
        self.space_freed.notify_waiters();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
