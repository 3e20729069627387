//! Shared document store abstraction.
//!
//! The [`DocumentStore`] trait is the contract the watch loop needs from
//! wherever source documents live: read, write, remove, list a directory
//! and subscribe to changes of one path. Paths are logical and
//! slash-separated (e.g. `data/3f2a…`); each backend maps them to its own
//! layout.
//!
//! | Backend | Storage | Change notification |
//! |---------|---------|---------------------|
//! | [`memory::MemoryDocumentStore`] | `HashMap` | on every write that changes the document |
//! | [`fs::FsDocumentStore`] | one JSON file per document | `notify` events, deduplicated by SHA-256 |
//!
//! Stores are eventually consistent and offer no cross-path transactions.

pub mod fs;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::SourceDocument;

/// Capacity of each per-path notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Kind of a directory entry returned by [`DocumentStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Change notifications for one path. Dropping it unsubscribes.
pub struct Subscription {
    path: String,
    rx: broadcast::Receiver<()>,
}

impl Subscription {
    fn new(path: String, rx: broadcast::Receiver<()>) -> Self {
        Self { path, rx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change. Bursts that overflow the channel collapse
    /// into a single wake-up. Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<()> {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(()),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Abstract document store shared between the UI layer and the indexer.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the document at `path`, or `None` if absent.
    async fn read_doc(&self, path: &str) -> Result<Option<SourceDocument>>;

    /// Create or replace the document at `path`.
    async fn write_doc(&self, path: &str, doc: &SourceDocument) -> Result<()>;

    /// Delete the document at `path`. Returns whether it existed.
    async fn remove_doc(&self, path: &str) -> Result<bool>;

    /// Direct children of the directory `path`. A missing directory is empty.
    async fn list(&self, path: &str) -> Result<Vec<StoreEntry>>;

    /// Subscribe to changes of the document at `path`.
    ///
    /// Only changes after the call are reported; the current state is not.
    async fn subscribe(&self, path: &str) -> Result<Subscription>;
}

/// Strip leading and trailing separators so `"/data/x/"` and `"data/x"`
/// address the same document.
pub fn normalize_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Join a directory and a child name into a logical path.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.trim_matches('/').to_string()
    } else {
        format!("{}/{}", dir, name.trim_matches('/'))
    }
}
