//! Processor contract, behavior decoration, and the chain
//!
//! A processor performs the side effect for one detected file event and
//! fails by returning an error. Behaviors are decorators around a
//! processor's execution: `before_process` runs first, then the inner
//! processor, then `after_process` with the pass/fail outcome. The chain is
//! built once; only the per-processor enabled flag mutates afterwards, so it
//! is an atomic read concurrently with the processing loop.

use crate::monitor::{ProcessingContext, ProcessingResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A unit of side-effecting work performed per detected file event.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// Stable name used for enable/disable and result records.
    fn name(&self) -> &str;

    async fn process(
        &self,
        ctx: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Cross-cutting hooks wrapped around a processor's execution.
#[async_trait]
pub trait ProcessorBehavior: Send + Sync {
    fn name(&self) -> &str;

    async fn before_process(&self, ctx: &ProcessingContext);

    async fn after_process(&self, ctx: &ProcessingContext, result: &ProcessingResult);
}

/// One behavior wrapped around an inner processor.
///
/// Decorators form a strictly linear chain; each wrapping layer observes the
/// outcome of all layers beneath it.
pub struct BehaviorDecorator {
    inner: Arc<dyn FileProcessor>,
    behavior: Arc<dyn ProcessorBehavior>,
}

impl BehaviorDecorator {
    pub fn wrap(inner: Arc<dyn FileProcessor>, behavior: Arc<dyn ProcessorBehavior>) -> Arc<Self> {
        Arc::new(Self { inner, behavior })
    }
}

#[async_trait]
impl FileProcessor for BehaviorDecorator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(
        &self,
        ctx: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.behavior.before_process(ctx).await;
        let outcome = self.inner.process(ctx, cancel).await;
        let result = ProcessingResult::from_outcome(ctx.event(), self.name(), &outcome);
        self.behavior.after_process(ctx, &result).await;
        outcome
    }
}

/// Configuration for one chain entry.
#[derive(Clone)]
pub struct ProcessorConfig {
    pub processor: Arc<dyn FileProcessor>,
    /// Processor-specific behaviors, applied after the location-wide ones.
    pub behaviors: Vec<Arc<dyn ProcessorBehavior>>,
    pub enabled: bool,
}

impl ProcessorConfig {
    pub fn new(processor: Arc<dyn FileProcessor>) -> Self {
        Self { processor, behaviors: Vec::new(), enabled: true }
    }

    pub fn with_behavior(mut self, behavior: Arc<dyn ProcessorBehavior>) -> Self {
        self.behaviors.push(behavior);
        self
    }
}

/// One named, toggleable slot in the chain.
pub struct ChainEntry {
    name: String,
    enabled: AtomicBool,
    processor: Arc<dyn FileProcessor>,
    behavior_names: Vec<String>,
}

impl ChainEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn processor(&self) -> &Arc<dyn FileProcessor> {
        &self.processor
    }

    pub fn behavior_names(&self) -> &[String] {
        &self.behavior_names
    }
}

/// Ordered list of behavior-wrapped processors for one location.
pub struct ProcessorChain {
    entries: Vec<ChainEntry>,
}

impl ProcessorChain {
    /// Build the chain: each configured processor is wrapped first by the
    /// location-wide behaviors, then by its own, in configured order.
    pub fn new(
        configs: &[ProcessorConfig],
        location_behaviors: &[Arc<dyn ProcessorBehavior>],
    ) -> Self {
        let entries = configs
            .iter()
            .map(|config| {
                let name = config.processor.name().to_string();
                let mut wrapped = config.processor.clone();
                let mut behavior_names = Vec::new();
                for behavior in location_behaviors.iter().chain(config.behaviors.iter()) {
                    behavior_names.push(behavior.name().to_string());
                    wrapped = BehaviorDecorator::wrap(wrapped, behavior.clone());
                }
                ChainEntry {
                    name,
                    enabled: AtomicBool::new(config.enabled),
                    processor: wrapped,
                    behavior_names,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enable a processor by name. Returns false for unknown names.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a processor by name without removing it from the chain.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.iter().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                debug!(processor = name, enabled, "toggled processor");
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name && entry.is_enabled())
    }

    /// Names of currently enabled processors, in chain order.
    pub fn active_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.is_enabled())
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Names of all processors, enabled or not, in chain order.
    pub fn all_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{EventType, FileEvent};
    use crate::storage::{InMemoryStorageProvider, StorageProvider};
    use std::sync::Mutex;

    /// Processor that records invocations and optionally always fails.
    struct RecordingProcessor {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl FileProcessor for RecordingProcessor {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(
            &self,
            ctx: &ProcessingContext,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("{}:{}", self.name, ctx.event().path));
            if self.fail {
                anyhow::bail!("{} always fails", self.name);
            }
            Ok(())
        }
    }

    /// Behavior that records its hook invocations and observed outcomes.
    struct RecordingBehavior {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProcessorBehavior for RecordingBehavior {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before_process(&self, _ctx: &ProcessingContext) {
            self.calls.lock().unwrap().push(format!("{}:before", self.name));
        }

        async fn after_process(&self, _ctx: &ProcessingContext, result: &ProcessingResult) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:after:{}", self.name, result.success));
        }
    }

    fn context() -> ProcessingContext {
        let provider: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new());
        let event =
            FileEvent::new("loc", "f.txt", EventType::Added, Some(1), None, String::new());
        ProcessingContext::new(event, provider)
    }

    fn recording(
        name: &str,
        calls: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn FileProcessor> {
        Arc::new(RecordingProcessor { name: name.to_string(), calls: calls.clone(), fail })
    }

    #[tokio::test]
    async fn test_behavior_hooks_bracket_the_processor() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let behavior: Arc<dyn ProcessorBehavior> =
            Arc::new(RecordingBehavior { name: "audit".to_string(), calls: calls.clone() });

        let config =
            ProcessorConfig::new(recording("mover", &calls, false)).with_behavior(behavior);
        let chain = ProcessorChain::new(&[config], &[]);

        let ctx = context();
        let cancel = CancellationToken::new();
        let entry = chain.entries().next().unwrap();
        entry.processor().process(&ctx, &cancel).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["audit:before", "mover:f.txt", "audit:after:true"]);
    }

    #[tokio::test]
    async fn test_failure_reaches_outer_behavior() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let behavior: Arc<dyn ProcessorBehavior> =
            Arc::new(RecordingBehavior { name: "audit".to_string(), calls: calls.clone() });

        let config =
            ProcessorConfig::new(recording("broken", &calls, true)).with_behavior(behavior);
        let chain = ProcessorChain::new(&[config], &[]);

        let ctx = context();
        let cancel = CancellationToken::new();
        let outcome = chain.entries().next().unwrap().processor().process(&ctx, &cancel).await;

        assert!(outcome.is_err());
        assert!(calls.lock().unwrap().contains(&"audit:after:false".to_string()));
    }

    #[tokio::test]
    async fn test_location_behaviors_wrap_before_processor_specific() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let location: Arc<dyn ProcessorBehavior> =
            Arc::new(RecordingBehavior { name: "loc".to_string(), calls: calls.clone() });
        let specific: Arc<dyn ProcessorBehavior> =
            Arc::new(RecordingBehavior { name: "own".to_string(), calls: calls.clone() });

        let config = ProcessorConfig::new(recording("p", &calls, false)).with_behavior(specific);
        let chain = ProcessorChain::new(&[config], &[location]);

        let ctx = context();
        let cancel = CancellationToken::new();
        chain.entries().next().unwrap().processor().process(&ctx, &cancel).await.unwrap();

        // Processor-specific behavior is the outermost layer.
        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec!["own:before", "loc:before", "p:f.txt", "loc:after:true", "own:after:true"]
        );
    }

    #[test]
    fn test_enable_disable_by_name() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = ProcessorChain::new(
            &[
                ProcessorConfig::new(recording("a", &calls, false)),
                ProcessorConfig::new(recording("b", &calls, false)),
            ],
            &[],
        );

        assert_eq!(chain.active_names(), vec!["a", "b"]);
        assert!(chain.disable("a"));
        assert_eq!(chain.active_names(), vec!["b"]);
        // Disabled processors stay listed.
        assert_eq!(chain.all_names(), vec!["a", "b"]);
        assert!(chain.enable("a"));
        assert!(!chain.disable("missing"));
    }
}
