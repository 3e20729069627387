//! File-backed [`DocumentStore`].
//!
//! Every document is a pretty-printed JSON file: the logical path
//! `data/abc` maps to `{root}/data/abc.json`. Writes go to a temporary
//! sibling first and are renamed into place, so readers never observe a
//! half-written file.
//!
//! # Change detection
//!
//! One recursive `notify` watcher covers the whole root. For each event on
//! a `.json` file that has subscribers, the file is re-read and hashed with
//! SHA-256; subscribers are woken only when the hash differs from the last
//! one seen. Editors that save twice, or a write that leaves the bytes
//! unchanged, therefore produce no extra notification.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use walkdir::WalkDir;

use super::{
    normalize_path, DocumentStore, EntryKind, StoreEntry, Subscription, CHANGE_CHANNEL_CAPACITY,
};
use crate::models::SourceDocument;

const DOC_EXTENSION: &str = "json";

struct WatchedDoc {
    tx: broadcast::Sender<()>,
    last_hash: Option<String>,
}

type WatchTable = Arc<Mutex<HashMap<String, WatchedDoc>>>;

pub struct FsDocumentStore {
    root: PathBuf,
    watched: WatchTable,
    _watcher: Mutex<RecommendedWatcher>,
}

impl FsDocumentStore {
    /// Open (creating if needed) a store rooted at `root` and start
    /// watching it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store root: {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve store root: {}", root.display()))?;

        let watched: WatchTable = Arc::new(Mutex::new(HashMap::new()));
        let callback_table = watched.clone();
        let callback_root = root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |event: Result<Event, notify::Error>| match event {
                Ok(event) => handle_event(&callback_root, &callback_table, event),
                Err(e) => tracing::warn!(error = %e, "document store watch error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        tracing::debug!(root = %root.display(), "opened file document store");

        Ok(Self {
            root,
            watched,
            _watcher: Mutex::new(watcher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, path: &str) -> Result<PathBuf> {
        let logical = normalize_path(path);
        if logical.is_empty() {
            bail!("empty document path");
        }
        let mut file = self.dir_for(&logical)?.into_os_string();
        file.push(".");
        file.push(DOC_EXTENSION);
        Ok(PathBuf::from(file))
    }

    fn dir_for(&self, path: &str) -> Result<PathBuf> {
        let logical = normalize_path(path);
        let mut out = self.root.clone();
        for part in logical.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                bail!("invalid document path: {}", path);
            }
            out.push(part);
        }
        Ok(out)
    }
}

fn hash_file(file: &Path) -> Option<String> {
    let bytes = std::fs::read(file).ok()?;
    Some(format!("{:x}", Sha256::digest(&bytes)))
}

/// Logical path for a `.json` file under `root`, or `None` for anything else.
fn logical_path(root: &Path, file: &Path) -> Option<String> {
    if file.extension().and_then(|e| e.to_str()) != Some(DOC_EXTENSION) {
        return None;
    }
    let relative = file.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn handle_event(root: &Path, table: &WatchTable, event: Event) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return;
    }

    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    for file in &event.paths {
        let Some(key) = logical_path(root, file) else {
            continue;
        };
        let Some(entry) = table.get_mut(&key) else {
            continue;
        };

        let hash = hash_file(file);
        if hash == entry.last_hash {
            continue;
        }
        entry.last_hash = hash;

        if entry.tx.send(()).is_err() {
            table.remove(&key);
        } else {
            tracing::debug!(path = %key, "document changed on disk");
        }
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read_doc(&self, path: &str) -> Result<Option<SourceDocument>> {
        let file = self.file_for(path)?;
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", file.display()))
            }
        };
        let doc = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed document: {}", file.display()))?;
        Ok(Some(doc))
    }

    async fn write_doc(&self, path: &str, doc: &SourceDocument) -> Result<()> {
        let file = self.file_for(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .with_context(|| format!("Failed to move {} into place", file.display()))?;
        Ok(())
    }

    async fn remove_doc(&self, path: &str) -> Result<bool> {
        let file = self.file_for(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", file.display())),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<StoreEntry>> {
        let dir = self.dir_for(path)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().is_dir() {
                entries.push(StoreEntry {
                    name,
                    kind: EntryKind::Directory,
                });
            } else if entry.path().extension().and_then(|e| e.to_str()) == Some(DOC_EXTENSION) {
                if let Some(stem) = name.strip_suffix(".json") {
                    entries.push(StoreEntry {
                        name: stem.to_string(),
                        kind: EntryKind::File,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        let key = normalize_path(path);
        let file = self.file_for(&key)?;
        let current = hash_file(&file);

        let rx = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| WatchedDoc {
                tx: broadcast::channel(CHANGE_CHANNEL_CAPACITY).0,
                last_hash: current,
            })
            .tx
            .subscribe();
        Ok(Subscription::new(key, rx))
    }
}
