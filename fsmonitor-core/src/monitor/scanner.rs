//! On-demand scanning of a location against recorded state
//!
//! A scan pages through the provider's listing, runs the change detector on
//! every file that passes the filters, synthesizes `Deleted` events for
//! recorded files missing from the listing, and reports progress along the
//! way. Detected events go to the event queue and into the returned
//! `ScanContext`. Provider failures for a single file are logged and skipped;
//! they never abort the scan.

use crate::error::{MonitorError, Result};
use crate::monitor::detector::determine_event_type;
use crate::monitor::{
    EventQueue, EventType, FileEvent, LocationOptions, PathFilters, ScanContext,
};
use crate::storage::StorageProvider;
use crate::store::EventStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(300);
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Options for one scan invocation.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub file_pattern: Option<String>,
    pub blacklist: Vec<String>,
    pub event_filter: Vec<EventType>,
    pub skip_checksum: bool,
    pub max_files_to_scan: Option<usize>,
    pub batch_size: usize,
    pub delay_per_batch: Option<Duration>,
    pub progress_interval_percent: u8,
    pub wait_for_processing: bool,
    pub processing_timeout: Option<Duration>,
    pub fail_if_root_missing: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            file_pattern: None,
            blacklist: Vec::new(),
            event_filter: vec![EventType::Added, EventType::Changed, EventType::Deleted],
            skip_checksum: false,
            max_files_to_scan: None,
            batch_size: 100,
            delay_per_batch: None,
            progress_interval_percent: 10,
            wait_for_processing: false,
            processing_timeout: None,
            fail_if_root_missing: false,
        }
    }
}

impl From<&LocationOptions> for ScanOptions {
    fn from(options: &LocationOptions) -> Self {
        Self {
            file_pattern: options.file_pattern.clone(),
            blacklist: options.blacklist.clone(),
            event_filter: options.event_filter.clone(),
            skip_checksum: options.skip_checksum,
            max_files_to_scan: options.max_files_to_scan,
            batch_size: options.batch_size,
            delay_per_batch: options.delay_per_batch,
            progress_interval_percent: options.progress_interval_percent,
            wait_for_processing: options.wait_for_processing,
            processing_timeout: options.processing_timeout,
            fail_if_root_missing: options.fail_if_root_missing,
        }
    }
}

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub location: String,
    pub scanned: usize,
    pub total_estimated: usize,
    pub percent: u8,
}

pub type ProgressFn = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Observer of scan lifecycle milestones.
#[allow(unused_variables)]
pub trait ScanObserver: Send + Sync {
    fn on_scan_started(&self, ctx: &ScanContext) {}
    fn on_file_detected(&self, event: &FileEvent) {}
    fn on_scan_completed(&self, ctx: &ScanContext, elapsed: Duration) {}
}

pub struct Scanner {
    location: String,
    provider: Arc<dyn StorageProvider>,
    store: Arc<dyn EventStore>,
    queue: Arc<EventQueue>,
    observers: Vec<Arc<dyn ScanObserver>>,
}

/// Running state threaded through one scan call.
struct ScanState {
    ctx: ScanContext,
    scanned: usize,
    detected: usize,
    estimate: usize,
    next_threshold: u8,
}

impl Scanner {
    pub fn new(
        location: impl Into<String>,
        provider: Arc<dyn StorageProvider>,
        store: Arc<dyn EventStore>,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            location: location.into(),
            provider,
            store,
            queue,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn ScanObserver>) {
        self.observers.push(observer);
    }

    /// Perform one scan.
    ///
    /// Cancellation is cooperative, checked at page and file boundaries; a
    /// cancelled scan returns the partial context with `cancelled` set.
    pub async fn scan(
        &self,
        opts: &ScanOptions,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<ScanContext> {
        let filters = PathFilters::new(opts.file_pattern.as_deref(), &opts.blacklist)?;

        if opts.fail_if_root_missing && !self.provider.root_exists().await? {
            return Err(MonitorError::RootMissing(self.location.clone()));
        }

        let ctx = ScanContext::new(&self.location);
        info!(location = %self.location, scan_id = %ctx.scan_id, "scan started");
        for observer in &self.observers {
            observer.on_scan_started(&ctx);
        }

        let present = self.store.get_present_files(&self.location).await?;
        let mut estimate = present.len().max(1);
        if let Some(cap) = opts.max_files_to_scan {
            estimate = estimate.min(cap.max(1));
        }

        let mut state = ScanState {
            ctx,
            scanned: 0,
            detected: 0,
            estimate,
            next_threshold: opts.progress_interval_percent.max(1),
        };

        let seen = self.walk_listing(opts, &filters, &progress, cancel, &mut state).await?;

        if !state.ctx.cancelled {
            self.synthesize_deletions(opts, &filters, &present, &seen, &progress, cancel, &mut state)
                .await;
        }

        state.ctx.ended_at = Some(Utc::now());
        let elapsed = state
            .ctx
            .elapsed()
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        info!(
            location = %self.location,
            events = state.ctx.events.len(),
            cancelled = state.ctx.cancelled,
            ?elapsed,
            "scan completed"
        );
        for observer in &self.observers {
            observer.on_scan_completed(&state.ctx, elapsed);
        }
        if let Some(progress) = &progress {
            progress(ScanProgress {
                location: self.location.clone(),
                scanned: state.scanned,
                total_estimated: state.estimate,
                percent: 100,
            });
        }

        if opts.wait_for_processing && !state.ctx.cancelled {
            self.wait_for_drain(opts.processing_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT)).await;
        }

        Ok(state.ctx)
    }

    /// Page through the provider listing, detecting events for every file
    /// passing the filters. Returns the set of listed paths.
    async fn walk_listing(
        &self,
        opts: &ScanOptions,
        filters: &PathFilters,
        progress: &Option<ProgressFn>,
        cancel: &CancellationToken,
        state: &mut ScanState,
    ) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        let mut token: Option<String> = None;

        'listing: loop {
            if cancel.is_cancelled() {
                state.ctx.cancelled = true;
                break;
            }
            let listing = match self
                .provider
                .list_files("", true, token.as_deref(), cancel)
                .await
            {
                Ok(listing) => listing,
                Err(MonitorError::Cancelled) => {
                    state.ctx.cancelled = true;
                    break;
                }
                Err(err) => return Err(err),
            };

            let mut page = listing.files;
            page.sort();

            // The store only knows previously recorded files, so fold what
            // the listing actually returns into the progress estimate.
            let mut estimate = state.estimate.max(seen.len() + page.len());
            if let Some(cap) = opts.max_files_to_scan {
                estimate = estimate.min(cap.max(1));
            }
            state.estimate = estimate;

            for path in page {
                if cancel.is_cancelled() {
                    state.ctx.cancelled = true;
                    break 'listing;
                }
                if let Some(cap) = opts.max_files_to_scan {
                    if state.scanned >= cap {
                        debug!(cap, "scan reached max file count");
                        break 'listing;
                    }
                }
                seen.insert(path.clone());
                if !filters.matches(&path) {
                    continue;
                }
                state.scanned += 1;

                if let Some(event) = self.detect(opts, &path, cancel).await? {
                    if opts.event_filter.contains(&event.event_type) {
                        self.emit(opts, event, state).await;
                    }
                }
                self.report_progress(opts, progress, state);
            }

            match listing.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(seen)
    }

    /// Fetch metadata and checksum for one listed file and run the detector.
    ///
    /// Provider failures are contained to this file: logged and `None`.
    async fn detect(
        &self,
        opts: &ScanOptions,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FileEvent>> {
        let meta = match self.provider.get_metadata(path, cancel).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path, %err, "skipping file, metadata fetch failed");
                return Ok(None);
            }
        };
        let checksum = if opts.skip_checksum {
            String::new()
        } else {
            match self.provider.get_checksum(path, cancel).await {
                Ok(checksum) => checksum,
                Err(err) => {
                    warn!(path, %err, "skipping file, checksum fetch failed");
                    return Ok(None);
                }
            }
        };

        let last = self.store.get_file_event(&self.location, path).await?;
        let event_type = determine_event_type(last.as_ref(), &meta, &checksum);
        Ok(Some(FileEvent::new(
            &self.location,
            path,
            event_type,
            Some(meta.len),
            Some(meta.modified),
            checksum,
        )))
    }

    /// Synthesize `Deleted` events for recorded files absent from the listing.
    #[allow(clippy::too_many_arguments)]
    async fn synthesize_deletions(
        &self,
        opts: &ScanOptions,
        filters: &PathFilters,
        present: &HashSet<String>,
        seen: &HashSet<String>,
        progress: &Option<ProgressFn>,
        cancel: &CancellationToken,
        state: &mut ScanState,
    ) {
        let mut missing: Vec<&String> = present
            .iter()
            .filter(|path| !seen.contains(*path) && filters.matches(path))
            .collect();
        missing.sort();

        for path in missing {
            if cancel.is_cancelled() {
                state.ctx.cancelled = true;
                break;
            }
            state.scanned += 1;
            if opts.event_filter.contains(&EventType::Deleted) {
                let event = FileEvent::deleted(&self.location, path);
                self.emit(opts, event, state).await;
            }
            self.report_progress(opts, progress, state);
        }
    }

    /// Queue the event, record it in the context, notify observers, and
    /// apply batch pacing.
    async fn emit(&self, opts: &ScanOptions, event: FileEvent, state: &mut ScanState) {
        match self.queue.add(event.clone()).await {
            Ok(()) => {}
            Err(MonitorError::QueueClosed) => {
                debug!(path = %event.path, "queue closed, event recorded in context only");
            }
            Err(err) => warn!(%err, "failed to enqueue scan event"),
        }
        for observer in &self.observers {
            observer.on_file_detected(&event);
        }
        state.ctx.events.push(event);

        state.detected += 1;
        if state.detected % opts.batch_size.max(1) == 0 {
            if let Some(delay) = opts.delay_per_batch {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn report_progress(
        &self,
        opts: &ScanOptions,
        progress: &Option<ProgressFn>,
        state: &mut ScanState,
    ) {
        let Some(progress) = progress else { return };
        let percent = ((state.scanned * 100 / state.estimate).min(99)) as u8;
        if percent < state.next_threshold {
            return;
        }
        progress(ScanProgress {
            location: self.location.clone(),
            scanned: state.scanned,
            total_estimated: state.estimate,
            percent,
        });
        // Advance past the reported value so each percent is reported once.
        let interval = opts.progress_interval_percent.max(1);
        state.next_threshold = percent.saturating_add(interval);
    }

    async fn wait_for_drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.queue.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    location = %self.location,
                    remaining = self.queue.len(),
                    "timed out waiting for queued scan events to process"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageProvider;
    use crate::store::InMemoryEventStore;
    use std::sync::Mutex;

    struct Fixture {
        provider: Arc<InMemoryStorageProvider>,
        store: Arc<InMemoryEventStore>,
        queue: Arc<EventQueue>,
        scanner: Scanner,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(InMemoryStorageProvider::new());
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(EventQueue::new(1000));
        let scanner =
            Scanner::new("loc", provider.clone(), store.clone(), queue.clone());
        Fixture { provider, store, queue, scanner, cancel: CancellationToken::new() }
    }

    /// Persist every event of a scan, simulating a processing loop run.
    async fn persist(fixture: &Fixture, ctx: &ScanContext) {
        for event in &ctx.events {
            fixture.store.store_event(event, &fixture.cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_initial_scan_of_three_files_yields_three_added() {
        let f = fixture();
        for name in ["a.txt", "b.txt", "c.txt"] {
            f.provider.write_file(name, b"data", &f.cancel).await.unwrap();
        }

        let ctx = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();

        assert_eq!(ctx.events.len(), 3);
        assert!(ctx.events.iter().all(|e| e.event_type == EventType::Added));
        assert!(ctx.ended_at.is_some());
        assert!(!ctx.cancelled);
        assert_eq!(f.queue.len(), 3);
    }

    #[tokio::test]
    async fn test_second_scan_detects_delete_and_add() {
        let f = fixture();
        f.provider.write_file("old.txt", b"old", &f.cancel).await.unwrap();
        f.provider.write_file("kept.txt", b"kept", &f.cancel).await.unwrap();

        let first = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();
        persist(&f, &first).await;

        f.provider.delete_file("old.txt", &f.cancel).await.unwrap();
        f.provider.write_file("new.txt", b"new", &f.cancel).await.unwrap();

        let second = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();

        assert_eq!(second.events.len(), 2);
        let added: Vec<_> =
            second.events.iter().filter(|e| e.event_type == EventType::Added).collect();
        let deleted: Vec<_> =
            second.events.iter().filter(|e| e.event_type == EventType::Deleted).collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].path, "new.txt");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].path, "old.txt");
    }

    #[tokio::test]
    async fn test_unchanged_files_are_suppressed_by_default() {
        let f = fixture();
        f.provider.write_file("same.txt", b"same", &f.cancel).await.unwrap();

        let first = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();
        persist(&f, &first).await;

        let second = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();
        assert!(second.events.is_empty());

        // Widening the filter surfaces the Unchanged event.
        let opts = ScanOptions {
            event_filter: vec![
                EventType::Added,
                EventType::Changed,
                EventType::Deleted,
                EventType::Unchanged,
            ],
            ..ScanOptions::default()
        };
        let third = f.scanner.scan(&opts, None, &f.cancel).await.unwrap();
        assert_eq!(third.events.len(), 1);
        assert_eq!(third.events[0].event_type, EventType::Unchanged);
    }

    #[tokio::test]
    async fn test_modified_file_is_changed_not_added() {
        let f = fixture();
        f.provider.write_file("f.txt", b"v1", &f.cancel).await.unwrap();

        let first = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();
        persist(&f, &first).await;

        f.provider.write_file("f.txt", b"v2", &f.cancel).await.unwrap();
        let second = f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();

        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].event_type, EventType::Changed);
    }

    #[tokio::test]
    async fn test_pattern_and_blacklist_filtering() {
        let f = fixture();
        f.provider.write_file("keep.csv", b"1", &f.cancel).await.unwrap();
        f.provider.write_file("skip.txt", b"2", &f.cancel).await.unwrap();
        f.provider.write_file("tmp/drop.csv", b"3", &f.cancel).await.unwrap();

        let opts = ScanOptions {
            file_pattern: Some("**/*.csv".to_string()),
            blacklist: vec!["tmp/**".to_string()],
            ..ScanOptions::default()
        };
        let ctx = f.scanner.scan(&opts, None, &f.cancel).await.unwrap();

        assert_eq!(ctx.events.len(), 1);
        assert_eq!(ctx.events[0].path, "keep.csv");
    }

    #[tokio::test]
    async fn test_max_files_caps_the_scan() {
        let f = fixture();
        for i in 0..10 {
            f.provider.write_file(&format!("{i}.txt"), b"x", &f.cancel).await.unwrap();
        }

        let opts =
            ScanOptions { max_files_to_scan: Some(4), ..ScanOptions::default() };
        let ctx = f.scanner.scan(&opts, None, &f.cancel).await.unwrap();

        assert_eq!(ctx.events.len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_partial_context() {
        let f = fixture();
        f.provider.write_file("a.txt", b"x", &f.cancel).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let ctx = f.scanner.scan(&ScanOptions::default(), None, &cancelled).await.unwrap();

        assert!(ctx.cancelled);
        assert!(ctx.events.is_empty());
        assert!(ctx.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_reaches_one_hundred() {
        let f = fixture();
        for i in 0..5 {
            f.provider.write_file(&format!("{i}.txt"), b"x", &f.cancel).await.unwrap();
        }

        let reported: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let progress: ProgressFn = Arc::new(move |p: ScanProgress| {
            sink.lock().unwrap().push(p.percent);
        });

        f.scanner.scan(&ScanOptions::default(), Some(progress), &f.cancel).await.unwrap();

        let reported = reported.lock().unwrap();
        assert!(!reported.is_empty());
        assert_eq!(*reported.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_first_scan_progress_is_incremental_without_duplicates() {
        // No recorded state: the estimate must come from the listing itself,
        // so intermediate percents are spread out instead of jumping to 99.
        let f = fixture();
        for i in 0..10 {
            f.provider.write_file(&format!("{i:02}.txt"), b"x", &f.cancel).await.unwrap();
        }

        let reported: Arc<Mutex<Vec<ScanProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let progress: ProgressFn = Arc::new(move |p: ScanProgress| {
            sink.lock().unwrap().push(p);
        });

        f.scanner.scan(&ScanOptions::default(), Some(progress), &f.cancel).await.unwrap();

        let reported = reported.lock().unwrap();
        assert!(reported.len() >= 3);
        assert!(reported.iter().all(|p| p.total_estimated == 10));
        // Strictly increasing: one callback per distinct percent.
        assert!(reported.windows(2).all(|pair| pair[0].percent < pair[1].percent));
        assert!(reported.first().unwrap().percent < 50);
        assert_eq!(reported.last().unwrap().percent, 100);
    }

    #[tokio::test]
    async fn test_missing_root_fails_fast_when_configured() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let provider = Arc::new(crate::storage::LocalStorageProvider::new(missing));
        let store = Arc::new(InMemoryEventStore::new());
        let queue = Arc::new(EventQueue::new(10));
        let scanner = Scanner::new("loc", provider, store, queue);

        let opts = ScanOptions { fail_if_root_missing: true, ..ScanOptions::default() };
        let err = scanner
            .scan(&opts, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::RootMissing(_)));
    }

    #[tokio::test]
    async fn test_observers_see_lifecycle() {
        struct CountingObserver {
            detected: Mutex<usize>,
            completed: Mutex<bool>,
        }
        impl ScanObserver for CountingObserver {
            fn on_file_detected(&self, _event: &FileEvent) {
                *self.detected.lock().unwrap() += 1;
            }
            fn on_scan_completed(&self, _ctx: &ScanContext, _elapsed: Duration) {
                *self.completed.lock().unwrap() = true;
            }
        }

        let mut f = fixture();
        f.provider.write_file("a.txt", b"x", &f.cancel).await.unwrap();
        let observer =
            Arc::new(CountingObserver { detected: Mutex::new(0), completed: Mutex::new(false) });
        f.scanner.add_observer(observer.clone());

        f.scanner.scan(&ScanOptions::default(), None, &f.cancel).await.unwrap();

        assert_eq!(*observer.detected.lock().unwrap(), 1);
        assert!(*observer.completed.lock().unwrap());
    }
}
