//! Storage provider abstraction
//!
//! A storage provider exposes a named root (a directory, an in-memory tree,
//! a bucket prefix) through a narrow listing/metadata/checksum/read-write
//! contract. The monitoring engine only ever talks to this trait; the
//! concrete backing store decides how listing pagination and change
//! notifications work.

pub mod local;
pub mod memory;

pub use local::LocalStorageProvider;
pub use memory::InMemoryStorageProvider;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Provider-reported attributes of a file at a point in time.
///
/// Ephemeral: consumed immediately when deciding an event type, never
/// persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Length in bytes.
    pub len: u64,
    /// Last-modified timestamp.
    pub modified: DateTime<Utc>,
}

/// One page of a continuation-token driven listing.
#[derive(Debug, Clone, Default)]
pub struct FileListing {
    /// Relative, forward-slash paths in this page.
    pub files: Vec<String>,
    /// Token to fetch the next page, `None` when the listing is exhausted.
    pub next_token: Option<String>,
}

/// Kind of a native change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A native change notification emitted by a provider.
#[derive(Debug, Clone)]
pub struct ProviderChange {
    /// Path relative to the provider root.
    pub path: String,
    pub kind: ChangeKind,
}

/// Contract every backing store implements.
///
/// All paths are relative to the provider's root and use forward slashes.
/// Implementations must be safe for concurrent use by multiple location
/// handlers and by one handler's concurrent scan + real-time paths.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// List files under `prefix`, one page per call.
    ///
    /// Pass the `next_token` of the previous page as `continuation` to
    /// resume. Entries within a page are in lexicographic order.
    async fn list_files(
        &self,
        prefix: &str,
        recursive: bool,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FileListing>;

    async fn get_metadata(&self, path: &str, cancel: &CancellationToken) -> Result<FileMetadata>;

    /// SHA-256 of the file contents as lowercase hex.
    async fn get_checksum(&self, path: &str, cancel: &CancellationToken) -> Result<String>;

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn delete_file(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Whether the provider's root currently exists.
    async fn root_exists(&self) -> Result<bool>;

    /// Whether this provider can deliver real-time change notifications.
    fn supports_notifications(&self) -> bool;

    /// The on-disk root for providers backed by the local filesystem.
    ///
    /// Watcher adapters that need a native OS subscription require this to
    /// be `Some`; everything else treats the provider as opaque.
    fn local_root(&self) -> Option<&Path> {
        None
    }

    /// Subscribe to the provider's in-process change feed, if it has one.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ProviderChange>> {
        None
    }
}
