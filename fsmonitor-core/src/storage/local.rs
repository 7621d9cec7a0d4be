//! Local filesystem storage provider

use crate::error::{MonitorError, Result};
use crate::storage::{FileListing, FileMetadata, StorageProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use walkdir::WalkDir;

const DEFAULT_PAGE_SIZE: usize = 1000;

/// Storage provider rooted at a local directory.
///
/// Listing is a sorted recursive walk, paginated with numeric offset
/// continuation tokens. Checksums are SHA-256 over the file contents.
pub struct LocalStorageProvider {
    root: PathBuf,
    page_size: usize,
}

impl LocalStorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn with_page_size(root: impl Into<PathBuf>, page_size: usize) -> Self {
        Self { root: root.into(), page_size: page_size.max(1) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() { Err(MonitorError::Cancelled) } else { Ok(()) }
    }
}

/// Convert an absolute path under `root` to a relative forward-slash path.
fn relativize(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> =
        rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
    if parts.is_empty() { None } else { Some(parts.join("/")) }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    async fn list_files(
        &self,
        prefix: &str,
        recursive: bool,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FileListing> {
        Self::check_cancelled(cancel)?;

        let root = self.root.clone();
        let prefix = prefix.to_string();
        let max_depth = if recursive { usize::MAX } else { 1 };

        let mut paths = tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in WalkDir::new(&root).max_depth(max_depth).into_iter().filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(rel) = relativize(&root, entry.path()) {
                    if rel.starts_with(&prefix) {
                        paths.push(rel);
                    }
                }
            }
            paths
        })
        .await
        .map_err(MonitorError::provider)?;

        paths.sort();

        let offset: usize = continuation.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        let page: Vec<String> =
            paths.iter().skip(offset).take(self.page_size).cloned().collect();
        let consumed = offset + page.len();
        let next_token = (consumed < paths.len()).then(|| consumed.to_string());

        trace!(offset, returned = page.len(), total = paths.len(), "listed local files");
        Ok(FileListing { files: page, next_token })
    }

    async fn get_metadata(&self, path: &str, cancel: &CancellationToken) -> Result<FileMetadata> {
        Self::check_cancelled(cancel)?;
        let meta = tokio::fs::metadata(self.absolute(path)).await?;
        let modified = meta.modified().map(DateTime::<Utc>::from)?;
        Ok(FileMetadata { len: meta.len(), modified })
    }

    async fn get_checksum(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        Self::check_cancelled(cancel)?;
        let contents = tokio::fs::read(self.absolute(path)).await?;
        let digest = Sha256::digest(&contents);
        Ok(format!("{:x}", digest))
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let absolute = self.absolute(path);
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(absolute, contents).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        tokio::fs::remove_file(self.absolute(path)).await?;
        Ok(())
    }

    async fn root_exists(&self) -> Result<bool> {
        Ok(self.root.is_dir())
    }

    fn supports_notifications(&self) -> bool {
        true
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_relative() {
        let dir = TempDir::new().unwrap();
        let provider = LocalStorageProvider::new(dir.path());

        provider.write_file("b.txt", b"b", &cancel()).await.unwrap();
        provider.write_file("a/nested.txt", b"n", &cancel()).await.unwrap();
        provider.write_file("c.txt", b"c", &cancel()).await.unwrap();

        let listing = provider.list_files("", true, None, &cancel()).await.unwrap();
        assert_eq!(listing.files, vec!["a/nested.txt", "b.txt", "c.txt"]);
        assert!(listing.next_token.is_none());
    }

    #[tokio::test]
    async fn test_listing_pagination() {
        let dir = TempDir::new().unwrap();
        let provider = LocalStorageProvider::with_page_size(dir.path(), 2);

        for name in ["1.txt", "2.txt", "3.txt"] {
            provider.write_file(name, b"x", &cancel()).await.unwrap();
        }

        let first = provider.list_files("", true, None, &cancel()).await.unwrap();
        assert_eq!(first.files.len(), 2);
        let token = first.next_token.expect("expected a continuation token");

        let second = provider.list_files("", true, Some(&token), &cancel()).await.unwrap();
        assert_eq!(second.files, vec!["3.txt"]);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_checksum_changes_with_contents() {
        let dir = TempDir::new().unwrap();
        let provider = LocalStorageProvider::new(dir.path());

        provider.write_file("f.txt", b"one", &cancel()).await.unwrap();
        let before = provider.get_checksum("f.txt", &cancel()).await.unwrap();

        provider.write_file("f.txt", b"two", &cancel()).await.unwrap();
        let after = provider.get_checksum("f.txt", &cancel()).await.unwrap();

        assert_ne!(before, after);
        assert_eq!(before.len(), 64);
    }

    #[tokio::test]
    async fn test_metadata_reports_length() {
        let dir = TempDir::new().unwrap();
        let provider = LocalStorageProvider::new(dir.path());

        provider.write_file("f.txt", b"hello", &cancel()).await.unwrap();
        let meta = provider.get_metadata("f.txt", &cancel()).await.unwrap();
        assert_eq!(meta.len, 5);
    }

    #[tokio::test]
    async fn test_cancelled_listing_fails() {
        let dir = TempDir::new().unwrap();
        let provider = LocalStorageProvider::new(dir.path());

        let token = CancellationToken::new();
        token.cancel();
        let err = provider.list_files("", true, None, &token).await.unwrap_err();
        assert!(matches!(err, MonitorError::Cancelled));
    }
}
