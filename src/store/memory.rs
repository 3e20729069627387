//! In-memory [`DocumentStore`] for tests and single-process use.
//!
//! Documents live in a `HashMap` behind `std::sync::RwLock`. Each
//! subscribed path owns a `tokio::sync::broadcast` sender; a write fires
//! it only when the stored document actually changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    normalize_path, DocumentStore, EntryKind, StoreEntry, Subscription, CHANGE_CHANNEL_CAPACITY,
};
use crate::models::SourceDocument;

#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<String, SourceDocument>>,
    channels: RwLock<HashMap<String, broadcast::Sender<()>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, path: &str) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(path) {
            if tx.send(()).is_err() {
                // Every subscriber is gone.
                channels.remove(path);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read_doc(&self, path: &str) -> Result<Option<SourceDocument>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_path(path))
            .cloned())
    }

    async fn write_doc(&self, path: &str, doc: &SourceDocument) -> Result<()> {
        let path = normalize_path(path);
        let changed = {
            let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
            match docs.get(&path) {
                Some(existing) if existing == doc => false,
                _ => {
                    docs.insert(path.clone(), doc.clone());
                    true
                }
            }
        };
        if changed {
            self.notify(&path);
        }
        Ok(())
    }

    async fn remove_doc(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        let existed = self
            .docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&path)
            .is_some();
        if existed {
            self.notify(&path);
        }
        Ok(existed)
    }

    async fn list(&self, path: &str) -> Result<Vec<StoreEntry>> {
        let dir = normalize_path(path);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut children: BTreeMap<String, EntryKind> = BTreeMap::new();
        for key in docs.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((name, _)) => {
                    children.insert(name.to_string(), EntryKind::Directory);
                }
                None => {
                    children.entry(rest.to_string()).or_insert(EntryKind::File);
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(name, kind)| StoreEntry { name, kind })
            .collect())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        let path = normalize_path(path);
        let rx = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Subscription::new(path, rx))
    }
}
