//! Multi-location façade
//!
//! `MonitoringService` owns one [`LocationHandler`] per named location and
//! routes every per-location operation by name. Unknown names fail with
//! [`MonitorError::UnknownLocation`]; registering a duplicate name is
//! rejected rather than silently replacing the running handler.

use crate::error::{MonitorError, Result};
use crate::monitor::handler::{LocationHandler, LocationStatus};
use crate::monitor::{LocationOptions, ProgressFn, ScanContext, ScanOptions};
use crate::storage::StorageProvider;
use crate::store::EventStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct MonitoringService {
    store: Arc<dyn EventStore>,
    handlers: DashMap<String, Arc<LocationHandler>>,
    cancel: CancellationToken,
}

impl MonitoringService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            handlers: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a location and construct its handler. The handler is not
    /// started; call [`start`](Self::start) separately.
    pub fn add_location(
        &self,
        options: LocationOptions,
        provider: Arc<dyn StorageProvider>,
    ) -> Result<()> {
        let name = options.location.clone();
        if self.handlers.contains_key(&name) {
            return Err(MonitorError::misconfigured(
                &name,
                "location is already registered",
            ));
        }
        let handler = Arc::new(LocationHandler::new(options, provider, self.store.clone())?);
        self.handlers.insert(name.clone(), handler);
        info!(location = %name, "location registered");
        Ok(())
    }

    /// Stop and deregister a location. Unknown names are a no-op.
    pub async fn remove_location(&self, name: &str) -> Result<()> {
        if let Some((_, handler)) = self.handlers.remove(name) {
            handler.stop().await?;
            info!(location = %name, "location removed");
        }
        Ok(())
    }

    pub fn locations(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.handler(name)?.start(Some(&self.cancel)).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.handler(name)?.stop().await
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        self.handler(name)?.pause();
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        self.handler(name)?.resume();
        Ok(())
    }

    pub async fn scan(
        &self,
        name: &str,
        overrides: Option<ScanOptions>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<ScanContext> {
        self.handler(name)?.scan(overrides, progress, cancel).await
    }

    pub fn status(&self, name: &str) -> Result<LocationStatus> {
        Ok(self.handler(name)?.status())
    }

    /// Status of every registered location, in arbitrary order.
    pub fn status_all(&self) -> Vec<LocationStatus> {
        self.handlers.iter().map(|entry| entry.value().status()).collect()
    }

    pub async fn wait_for_queue_empty(&self, name: &str, timeout: Duration) -> Result<()> {
        self.handler(name)?.wait_for_queue_empty(timeout).await
    }

    pub fn enable_processor(&self, name: &str, processor: &str) -> Result<bool> {
        Ok(self.handler(name)?.enable_processor(processor))
    }

    pub fn disable_processor(&self, name: &str, processor: &str) -> Result<bool> {
        Ok(self.handler(name)?.disable_processor(processor))
    }

    pub fn active_processors(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.handler(name)?.active_processors())
    }

    /// Stop every location, draining each queue in turn.
    pub async fn stop_all(&self) {
        let handlers: Vec<Arc<LocationHandler>> =
            self.handlers.iter().map(|entry| entry.value().clone()).collect();
        for handler in handlers {
            if let Err(err) = handler.stop().await {
                warn!(location = handler.location(), %err, "failed to stop location");
            }
        }
        self.cancel.cancel();
        info!("monitoring service stopped");
    }

    fn handler(&self, name: &str) -> Result<Arc<LocationHandler>> {
        self.handlers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MonitorError::UnknownLocation(name.to_string()))
    }
}
