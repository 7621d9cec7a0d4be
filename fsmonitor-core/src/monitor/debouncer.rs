//! Per-path debounce buffer between the watcher and the event queue
//!
//! Native watchers commonly fire a "created" and a "changed" notification
//! for a single write. The buffer coalesces those bursts so one logical
//! write yields one queued event, while a genuinely separate later
//! modification still gets its own event.

use crate::error::MonitorError;
use crate::monitor::{EventQueue, EventType, FileEvent, PathFilters};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const FLUSH_TICK: Duration = Duration::from_millis(50);

struct Buffered {
    event: FileEvent,
    buffered_at: Instant,
}

pub struct Debouncer {
    interval: Duration,
    buffer: DashMap<String, Buffered>,
    queue: Arc<EventQueue>,
    // Filters are re-applied at flush time; configuration may differ from
    // what the producer checked at arrival.
    filters: PathFilters,
}

impl Debouncer {
    pub fn new(interval: Duration, queue: Arc<EventQueue>, filters: PathFilters) -> Self {
        Self { interval, buffer: DashMap::new(), queue, filters }
    }

    /// Offer a freshly detected event for the given path.
    ///
    /// If an event for the path is already buffered and the new one is a
    /// `Changed` following an `Added` (or another `Changed`) within the
    /// debounce interval, the buffered event wins and only its timestamp is
    /// refreshed. Anything else flushes the buffered event immediately and
    /// buffers the new one.
    pub async fn offer(&self, event: FileEvent) {
        let flushed = {
            match self.buffer.entry(event.path.clone()) {
                Entry::Occupied(mut occupied) => {
                    let buffered = occupied.get();
                    let coalesce = buffered.buffered_at.elapsed() < self.interval
                        && matches!(
                            (buffered.event.event_type, event.event_type),
                            (EventType::Added, EventType::Changed)
                                | (EventType::Changed, EventType::Changed)
                        );
                    if coalesce {
                        trace!(path = %event.path, "coalesced into buffered event");
                        occupied.get_mut().buffered_at = Instant::now();
                        None
                    } else {
                        let old = occupied
                            .insert(Buffered { event, buffered_at: Instant::now() });
                        Some(old.event)
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Buffered { event, buffered_at: Instant::now() });
                    None
                }
            }
        };
        if let Some(event) = flushed {
            self.enqueue(event).await;
        }
    }

    /// Flush every buffered event whose age exceeds the debounce interval.
    pub async fn flush_expired(&self) {
        let expired: Vec<String> = self
            .buffer
            .iter()
            .filter(|entry| entry.buffered_at.elapsed() >= self.interval)
            .map(|entry| entry.key().clone())
            .collect();

        for path in expired {
            if let Some((_, buffered)) = self.buffer.remove(&path) {
                self.enqueue(buffered.event).await;
            }
        }
    }

    /// Flush everything regardless of age, for teardown.
    pub async fn flush_all(&self) {
        let paths: Vec<String> = self.buffer.iter().map(|entry| entry.key().clone()).collect();
        for path in paths {
            if let Some((_, buffered)) = self.buffer.remove(&path) {
                self.enqueue(buffered.event).await;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    async fn enqueue(&self, event: FileEvent) {
        if !self.filters.matches(&event.path) {
            debug!(path = %event.path, "dropping filtered event at flush");
            return;
        }
        match self.queue.add(event).await {
            Ok(()) => {}
            Err(MonitorError::QueueClosed) => {
                debug!("queue closed, dropping flushed event");
            }
            Err(err) => warn!(%err, "failed to enqueue flushed event"),
        }
    }

    /// Spawn the background ticker that flushes aged entries.
    pub fn spawn_flush_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let debouncer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(FLUSH_TICK) => debouncer.flush_expired().await,
                }
            }
        })
    }
}
