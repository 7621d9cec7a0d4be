//! In-memory storage provider with an in-process change feed

use crate::error::{MonitorError, Result};
use crate::storage::{ChangeKind, FileListing, FileMetadata, ProviderChange, StorageProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const CHANGE_FEED_CAPACITY: usize = 256;
const DEFAULT_PAGE_SIZE: usize = 1000;

struct StoredFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// Storage provider holding files in memory.
///
/// Every write and delete is broadcast on the change feed, which makes this
/// provider the "native notification" backing store for tests and for any
/// embedder that produces files programmatically.
pub struct InMemoryStorageProvider {
    files: DashMap<String, StoredFile>,
    changes: broadcast::Sender<ProviderChange>,
    page_size: usize,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { files: DashMap::new(), changes, page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn with_page_size(page_size: usize) -> Self {
        let mut provider = Self::new();
        provider.page_size = page_size.max(1);
        provider
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn emit(&self, path: &str, kind: ChangeKind) {
        // No receivers is fine; the feed is opt-in.
        let _ = self.changes.send(ProviderChange { path: path.to_string(), kind });
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() { Err(MonitorError::Cancelled) } else { Ok(()) }
    }
}

impl Default for InMemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn list_files(
        &self,
        prefix: &str,
        recursive: bool,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FileListing> {
        Self::check_cancelled(cancel)?;

        let mut paths: Vec<String> = self
            .files
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|path| path.starts_with(prefix))
            .filter(|path| recursive || !path[prefix.len()..].trim_start_matches('/').contains('/'))
            .collect();
        paths.sort();

        let offset: usize = continuation.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        let page: Vec<String> = paths.iter().skip(offset).take(self.page_size).cloned().collect();
        let consumed = offset + page.len();
        let next_token = (consumed < paths.len()).then(|| consumed.to_string());

        Ok(FileListing { files: page, next_token })
    }

    async fn get_metadata(&self, path: &str, cancel: &CancellationToken) -> Result<FileMetadata> {
        Self::check_cancelled(cancel)?;
        let file = self
            .files
            .get(path)
            .ok_or_else(|| MonitorError::provider(anyhow::anyhow!("no such file: {path}")))?;
        Ok(FileMetadata { len: file.data.len() as u64, modified: file.modified })
    }

    async fn get_checksum(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check_cancelled(cancel)?;
        let file = self
            .files
            .get(path)
            .ok_or_else(|| MonitorError::provider(anyhow::anyhow!("no such file: {path}")))?;
        Ok(format!("{:x}", Sha256::digest(&file.data)))
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let existed = self
            .files
            .insert(
                path.to_string(),
                StoredFile { data: contents.to_vec(), modified: Utc::now() },
            )
            .is_some();
        self.emit(path, if existed { ChangeKind::Modified } else { ChangeKind::Created });
        Ok(())
    }

    async fn delete_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        if self.files.remove(path).is_some() {
            self.emit(path, ChangeKind::Removed);
        }
        Ok(())
    }

    async fn root_exists(&self) -> Result<bool> {
        Ok(true)
    }

    fn supports_notifications(&self) -> bool {
        true
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ProviderChange>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_write_then_list() {
        let provider = InMemoryStorageProvider::new();
        provider.write_file("b.txt", b"b", &cancel()).await.unwrap();
        provider.write_file("a.txt", b"a", &cancel()).await.unwrap();

        let listing = provider.list_files("", true, None, &cancel()).await.unwrap();
        assert_eq!(listing.files, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn test_change_feed_emits_created_then_modified() {
        let provider = InMemoryStorageProvider::new();
        let mut rx = provider.subscribe_changes().unwrap();

        provider.write_file("f.txt", b"one", &cancel()).await.unwrap();
        provider.write_file("f.txt", b"two", &cancel()).await.unwrap();
        provider.delete_file("f.txt", &cancel()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Created);
        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Modified);
        assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn test_non_recursive_listing_excludes_nested() {
        let provider = InMemoryStorageProvider::new();
        provider.write_file("top.txt", b"t", &cancel()).await.unwrap();
        provider.write_file("dir/nested.txt", b"n", &cancel()).await.unwrap();

        let listing = provider.list_files("", false, None, &cancel()).await.unwrap();
        assert_eq!(listing.files, vec!["top.txt"]);
    }

    #[tokio::test]
    async fn test_metadata_missing_file_is_provider_error() {
        let provider = InMemoryStorageProvider::new();
        let err = provider.get_metadata("nope", &cancel()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Provider(_)));
    }
}
