//! Per-location orchestration
//!
//! A `LocationHandler` owns the queue, rate limiter, processor chain,
//! debouncer, and watcher for one monitored location, and runs the single
//! background loop that consumes the queue: dequeue, acquire a rate-limit
//! token, persist the event, then run every enabled processor in chain
//! order with per-processor failure isolation.
//!
//! State machine: `Stopped → Starting → Running ⇄ Paused → Stopping →
//! Stopped`. Pause suppresses the watcher and halts queue consumption;
//! explicit scans still run and still enqueue, so their events are
//! processed after resume.

use crate::error::{MonitorError, Result};
use crate::monitor::{
    Debouncer, EventQueue, LocationOptions, PathFilters, ProcessingContext, ProcessingResult,
    ProcessorChain, ProgressFn, RateLimiter, ScanContext, ScanOptions, Scanner,
};
use crate::monitor::watcher::{BroadcastWatcher, LocalFsWatcher, LocationWatcher};
use crate::storage::StorageProvider;
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll interval of the processing loop; bounds how quickly pause and
/// cancellation take effect.
const LOOP_POLL: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Snapshot returned by [`LocationHandler::status`].
#[derive(Debug, Clone)]
pub struct LocationStatus {
    pub location: String,
    pub is_active: bool,
    pub is_paused: bool,
    pub queue_size: usize,
    pub last_scan_time: Option<DateTime<Utc>>,
}

/// Live resources of a started handler, torn down at stop.
struct Runtime {
    queue: Arc<EventQueue>,
    debouncer: Arc<Debouncer>,
    watcher: Option<Arc<dyn LocationWatcher>>,
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
    ticker_task: JoinHandle<()>,
}

pub struct LocationHandler {
    options: LocationOptions,
    provider: Arc<dyn StorageProvider>,
    store: Arc<dyn EventStore>,
    chain: Arc<ProcessorChain>,
    limiter: Arc<RateLimiter>,
    filters: PathFilters,
    paused: Arc<AtomicBool>,
    state: Mutex<HandlerState>,
    runtime: Mutex<Option<Runtime>>,
    last_scan: Mutex<Option<DateTime<Utc>>>,
}

impl LocationHandler {
    /// Build a handler for one location.
    ///
    /// Fails fast on invalid filter globs and on a provider that claims
    /// notification support without any usable subscription mechanism.
    pub fn new(
        options: LocationOptions,
        provider: Arc<dyn StorageProvider>,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        let filters = PathFilters::from_options(&options)?;
        let chain =
            Arc::new(ProcessorChain::new(&options.processors, &options.location_behaviors));
        let limiter = Arc::new(RateLimiter::new(options.rate_limit));

        if !options.use_on_demand_only
            && provider.supports_notifications()
            && provider.local_root().is_none()
            && provider.subscribe_changes().is_none()
        {
            return Err(MonitorError::misconfigured(
                &options.location,
                "provider claims notification support but exposes no subscription mechanism",
            ));
        }

        Ok(Self {
            options,
            provider,
            store,
            chain,
            limiter,
            filters,
            paused: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(HandlerState::Stopped),
            runtime: Mutex::new(None),
            last_scan: Mutex::new(None),
        })
    }

    pub fn location(&self) -> &str {
        &self.options.location
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }

    /// Start the background processing loop and, unless configured as
    /// on-demand-only, the real-time watcher. No-op if already running.
    pub async fn start(&self, external: Option<&CancellationToken>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != HandlerState::Stopped {
                debug!(location = %self.options.location, "start ignored, handler not stopped");
                return Ok(());
            }
            *state = HandlerState::Starting;
        }

        let cancel = external.map(|t| t.child_token()).unwrap_or_default();
        let queue = Arc::new(EventQueue::new(self.options.queue_capacity));
        let debouncer = Arc::new(Debouncer::new(
            self.options.debounce_interval,
            queue.clone(),
            self.filters.clone(),
        ));
        let ticker_task = debouncer.spawn_flush_task(cancel.clone());

        let watcher = if self.options.use_on_demand_only || !self.provider.supports_notifications()
        {
            None
        } else {
            match self.build_watcher(debouncer.clone()) {
                Ok(watcher) => {
                    if let Err(err) = watcher.start().await {
                        ticker_task.abort();
                        *self.state.lock().unwrap() = HandlerState::Stopped;
                        return Err(err);
                    }
                    Some(watcher)
                }
                Err(err) => {
                    ticker_task.abort();
                    *self.state.lock().unwrap() = HandlerState::Stopped;
                    return Err(err);
                }
            }
        };

        let loop_task = tokio::spawn(processing_loop(
            LoopContext {
                location: self.options.location.clone(),
                queue: queue.clone(),
                limiter: self.limiter.clone(),
                chain: self.chain.clone(),
                store: self.store.clone(),
                provider: self.provider.clone(),
                paused: self.paused.clone(),
            },
            cancel.clone(),
        ));

        self.paused.store(false, Ordering::Release);
        *self.runtime.lock().unwrap() = Some(Runtime {
            queue,
            debouncer,
            watcher,
            cancel: cancel.clone(),
            loop_task,
            ticker_task,
        });
        *self.state.lock().unwrap() = HandlerState::Running;
        info!(location = %self.options.location, "location handler started");

        if self.options.scan_on_start {
            if let Err(err) = self.scan(None, None, &cancel).await {
                warn!(location = %self.options.location, %err, "initial scan failed");
            }
        }
        Ok(())
    }

    /// Stop watching, reject further adds, drain the queue, and tear down.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, HandlerState::Running | HandlerState::Starting) {
                return Ok(());
            }
            *state = HandlerState::Stopping;
        }

        let runtime = self.runtime.lock().unwrap().take();
        if let Some(runtime) = runtime {
            if let Some(watcher) = &runtime.watcher {
                watcher.stop().await;
            }
            // Unpause so the loop can drain what is left in the queue.
            self.paused.store(false, Ordering::Release);
            runtime.debouncer.flush_all().await;
            runtime.queue.complete();
            // Drain to completion before cancelling the loop's token.
            if let Err(err) = runtime.loop_task.await {
                error!(location = %self.options.location, %err, "processing loop panicked");
            }
            runtime.cancel.cancel();
            let _ = runtime.ticker_task.await;
        }

        *self.state.lock().unwrap() = HandlerState::Stopped;
        info!(location = %self.options.location, "location handler stopped");
        Ok(())
    }

    /// Suppress the watcher and halt queue consumption.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        if let Some(watcher) = self.current_watcher() {
            watcher.pause();
        }
        info!(location = %self.options.location, "location paused");
    }

    /// Re-attach the watcher and resume queue consumption.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        if let Some(watcher) = self.current_watcher() {
            watcher.resume();
        }
        info!(location = %self.options.location, "location resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Run an on-demand scan.
    ///
    /// Runs in any non-stopping state, paused included; detected events are
    /// enqueued and consumed whenever the loop is (or becomes) unpaused.
    /// On a stopped handler the events are only recorded in the returned
    /// context, since no loop is draining the queue.
    pub async fn scan(
        &self,
        overrides: Option<ScanOptions>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<ScanContext> {
        if self.state() == HandlerState::Stopping {
            return Err(MonitorError::misconfigured(
                &self.options.location,
                "scan rejected while the handler is stopping",
            ));
        }

        let opts = overrides.unwrap_or_else(|| ScanOptions::from(&self.options));
        let queue = self
            .current_queue()
            .unwrap_or_else(|| Arc::new(EventQueue::new(self.options.queue_capacity)));
        let scanner = Scanner::new(
            self.options.location.clone(),
            self.provider.clone(),
            self.store.clone(),
            queue,
        );
        let ctx = scanner.scan(&opts, progress, cancel).await?;
        *self.last_scan.lock().unwrap() = Some(Utc::now());
        Ok(ctx)
    }

    pub fn status(&self) -> LocationStatus {
        let state = self.state();
        LocationStatus {
            location: self.options.location.clone(),
            is_active: matches!(state, HandlerState::Running | HandlerState::Starting),
            is_paused: self.is_paused(),
            queue_size: self.queue_size(),
            last_scan_time: *self.last_scan.lock().unwrap(),
        }
    }

    pub fn queue_size(&self) -> usize {
        self.current_queue().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_queue_empty(&self) -> bool {
        self.current_queue().map(|q| q.is_empty()).unwrap_or(true)
    }

    /// Wait until the queue drains, failing with [`MonitorError::Timeout`]
    /// when the deadline passes first.
    pub async fn wait_for_queue_empty(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_queue_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MonitorError::Timeout(timeout));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Names of currently enabled processors, in chain order.
    pub fn active_processors(&self) -> Vec<String> {
        self.chain.active_names()
    }

    /// Names of all configured processors, enabled or not.
    pub fn processors(&self) -> Vec<String> {
        self.chain.all_names()
    }

    pub fn enable_processor(&self, name: &str) -> bool {
        self.chain.enable(name)
    }

    pub fn disable_processor(&self, name: &str) -> bool {
        self.chain.disable(name)
    }

    fn build_watcher(&self, debouncer: Arc<Debouncer>) -> Result<Arc<dyn LocationWatcher>> {
        if self.provider.local_root().is_some() {
            Ok(Arc::new(LocalFsWatcher::new(
                self.options.location.clone(),
                self.provider.clone(),
                debouncer,
                self.filters.clone(),
                self.options.skip_checksum,
            )?))
        } else {
            Ok(Arc::new(BroadcastWatcher::new(
                self.options.location.clone(),
                self.provider.clone(),
                debouncer,
                self.filters.clone(),
                self.options.skip_checksum,
            )?))
        }
    }

    fn current_queue(&self) -> Option<Arc<EventQueue>> {
        self.runtime.lock().unwrap().as_ref().map(|rt| rt.queue.clone())
    }

    fn current_watcher(&self) -> Option<Arc<dyn LocationWatcher>> {
        self.runtime.lock().unwrap().as_ref().and_then(|rt| rt.watcher.clone())
    }
}

/// Everything the background loop needs, detached from the handler.
struct LoopContext {
    location: String,
    queue: Arc<EventQueue>,
    limiter: Arc<RateLimiter>,
    chain: Arc<ProcessorChain>,
    store: Arc<dyn EventStore>,
    provider: Arc<dyn StorageProvider>,
    paused: Arc<AtomicBool>,
}

/// Single consumer of one location's queue.
///
/// Runs until cancelled, or until the queue is completed and drained. While
/// paused it idles without dequeuing, so pause applies to every queued
/// event regardless of whether a scan or the watcher produced it.
async fn processing_loop(ctx: LoopContext, cancel: CancellationToken) {
    debug!(location = %ctx.location, "processing loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if ctx.queue.is_completed() && ctx.queue.is_empty() {
            break;
        }
        // A completed queue overrides pause: stop() relies on the loop
        // draining whatever is left, even when stop arrives while paused.
        if ctx.paused.load(Ordering::Acquire) && !ctx.queue.is_completed() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(LOOP_POLL) => {}
            }
            continue;
        }

        let Some(event) = ctx.queue.take(LOOP_POLL).await else {
            continue;
        };
        if !ctx.limiter.wait_for_token(&cancel).await {
            debug!(location = %ctx.location, "cancelled while waiting for a token");
            break;
        }
        process_event(&ctx, event, &cancel).await;
    }
    debug!(location = %ctx.location, "processing loop exited");
}

/// Persist the event, then run every enabled processor, isolating failures.
async fn process_event(ctx: &LoopContext, event: crate::monitor::FileEvent, cancel: &CancellationToken) {
    if let Err(err) = ctx.store.store_event(&event, cancel).await {
        error!(location = %ctx.location, path = %event.path, %err, "failed to persist event");
    }

    if ctx.chain.active_names().is_empty() {
        debug!(location = %ctx.location, path = %event.path, "no enabled processors");
        return;
    }

    let pctx = ProcessingContext::new(event.clone(), ctx.provider.clone());
    for entry in ctx.chain.entries() {
        if !entry.is_enabled() {
            continue;
        }
        let outcome = entry.processor().process(&pctx, cancel).await;
        if let Err(err) = &outcome {
            warn!(
                location = %ctx.location,
                processor = entry.name(),
                path = %event.path,
                %err,
                "processor failed"
            );
        }
        let result = ProcessingResult::from_outcome(&event, entry.name(), &outcome);
        if let Err(err) = ctx.store.store_processing_result(&result, cancel).await {
            error!(processor = entry.name(), %err, "failed to persist processing result");
        }
    }
}
