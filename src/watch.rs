//! Source watch loop: keeps both indexes in step with the document store.
//!
//! [`SourceWatcher`] owns the "already indexed" id sets, the table of
//! watched paths and the [`ProgressTracker`]. The store and both indexes
//! are injected, so tests can run the whole loop against in-memory fakes.
//!
//! # Algorithm
//!
//! Every `rescan_interval` (and once at startup):
//!
//! 1. List the store's data directory and start a cycle on the tracker
//!    with the number of documents found.
//! 2. Subscribe to every path not yet watched. Read its document and queue
//!    it when it has content and its source id is **not** in the indexed
//!    set of its kind. The guard is by source id, not path.
//! 3. Also queue any watched path whose source failed in an earlier cycle.
//! 4. Sum the estimated batches of the queue (`ceil(chunks / batch_size)`
//!    for vector sources, `1` per CSV source) into the tracker's total.
//! 5. Index the queue. Each source's outcome is recorded independently;
//!    one failure never stops the others or the loop.
//!
//! A change notification on a watched path always re-indexes, without the
//! guard, because edits must propagate. A notification for a document that
//! no longer exists removes the source from both indexes.
//!
//! # Routing
//!
//! | `metadata.type` | Index | Content |
//! |-----------------|-------|---------|
//! | `text`, `pdf`, `web` | vector | `content` |
//! | `csv` | tabular | `rawCsvContent`, else `content` |
//! | anything else | vector, labelled `text` | `content` |

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::models::{path_leaf, IndexKind, Source, SourceDocument, SourceType};
use crate::progress::{ProgressReporter, ProgressSnapshot, ProgressTracker};
use crate::store::{join_path, normalize_path, DocumentStore, EntryKind};
use crate::tabular::{parse_csv, TabularIndex};
use crate::vector::{BatchProgress, VectorIndex};

/// Timing and layout options for a [`SourceWatcher`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Store directory whose documents are sources.
    pub data_path: String,
    pub rescan_interval: Duration,
    pub activity_window: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            data_path: "data".to_string(),
            rescan_interval: Duration::from_secs(30),
            activity_window: crate::progress::DEFAULT_ACTIVITY_WINDOW,
        }
    }
}

impl WatchOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            data_path: config.store.data_path.clone(),
            rescan_interval: Duration::from_secs(config.watch.rescan_interval_secs),
            activity_window: Duration::from_secs(config.watch.activity_window_secs),
        }
    }
}

/// Source ids currently held by each index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexedIds {
    pub vector: BTreeSet<String>,
    pub csv: BTreeSet<String>,
}

/// Result of one [`SourceWatcher::rescan`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub discovered: usize,
    pub newly_watched: usize,
    pub queued: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What indexing one source did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The source now lives in the index of this kind.
    Indexed { kind: IndexKind, batches: usize },
    /// Nothing usable to index; no index was touched.
    Skipped { kind: IndexKind },
}

struct WatchedPath {
    source_id: String,
    task: AbortHandle,
}

#[derive(Default)]
struct WatchState {
    vector_ids: HashSet<String>,
    csv_ids: HashSet<String>,
    watched: HashMap<String, WatchedPath>,
}

/// A queued unit of work.
struct Pending {
    source: Source,
    doc: SourceDocument,
    planned: usize,
}

pub struct SourceWatcher {
    store: Arc<dyn DocumentStore>,
    vector: Arc<VectorIndex>,
    tabular: Arc<TabularIndex>,
    options: WatchOptions,
    tracker: ProgressTracker,
    state: RwLock<WatchState>,
}

impl SourceWatcher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        vector: Arc<VectorIndex>,
        tabular: Arc<TabularIndex>,
        options: WatchOptions,
    ) -> Self {
        let tracker = ProgressTracker::new(options.activity_window);
        Self {
            store,
            vector,
            tabular,
            options,
            tracker,
            state: RwLock::new(WatchState::default()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.tracker = ProgressTracker::new(self.options.activity_window).with_reporter(reporter);
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex> {
        &self.vector
    }

    pub fn tabular_index(&self) -> &Arc<TabularIndex> {
        &self.tabular
    }

    pub fn data_path(&self) -> &str {
        &self.options.data_path
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.tracker.snapshot()
    }

    pub fn indexed_ids(&self) -> IndexedIds {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        IndexedIds {
            vector: state.vector_ids.iter().cloned().collect(),
            csv: state.csv_ids.iter().cloned().collect(),
        }
    }

    pub fn watched_paths(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<String> = state.watched.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Seed the indexed sets from what the backends already hold, so a
    /// restart does not re-index unchanged sources.
    pub async fn initialize(&self) {
        let vector_ids = match self.vector.get_existing_sources().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "could not list existing vector sources");
                HashSet::new()
            }
        };
        let csv_ids: Vec<String> = self
            .tabular
            .get_all_sources()
            .into_iter()
            .map(|s| s.source_id)
            .collect();

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.vector_ids.extend(vector_ids);
            state.csv_ids.extend(csv_ids);
        }
        self.sync_counts();

        let ids = self.indexed_ids();
        tracing::info!(
            vector = ids.vector.len(),
            csv = ids.csv.len(),
            "initialized indexed source sets"
        );
    }

    /// One discovery pass over the store's data directory.
    pub async fn rescan(self: &Arc<Self>) -> Result<ScanSummary> {
        let entries = self
            .store
            .list(&self.options.data_path)
            .await
            .with_context(|| format!("listing {} failed", self.options.data_path))?;
        let listed: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| join_path(&self.options.data_path, &e.name))
            .collect();

        self.tracker.begin_scan(listed.len());
        let mut summary = ScanSummary {
            discovered: listed.len(),
            ..ScanSummary::default()
        };

        // Paths that disappeared from the listing stop being watched.
        let listed_set: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let vanished: Vec<String> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state
                .watched
                .keys()
                .filter(|p| !listed_set.contains(p.as_str()))
                .cloned()
                .collect()
        };
        for path in vanished {
            self.unwatch_path(&path);
        }

        let mut queue: Vec<Pending> = Vec::new();
        let mut queued_ids: HashSet<String> = HashSet::new();

        for path in &listed {
            let retry = match self.watched_source_id(path) {
                None => {
                    // An unwatched path is attached again on the next rescan.
                    if let Err(e) = self.attach(path).await {
                        let message = format!("{:#}", e);
                        tracing::error!(path = %path, error = %message, "failed to watch source");
                        self.tracker.finish_source(
                            path_leaf(path),
                            IndexKind::Vector,
                            0,
                            Some(message),
                        );
                        summary.failed += 1;
                        continue;
                    }
                    summary.newly_watched += 1;
                    false
                }
                Some(id) if self.tracker.is_failed(&id) => true,
                Some(_) => continue,
            };

            let Some((source, doc)) = self.read_source(path).await else {
                summary.failed += 1;
                continue;
            };
            self.set_watched_source_id(path, &source.id);

            if !doc.has_content() || queued_ids.contains(&source.id) {
                continue;
            }
            if !retry && self.already_indexed(&source) {
                tracing::debug!(source_id = %source.id, path = %path, "already indexed, skipping");
                continue;
            }

            queued_ids.insert(source.id.clone());
            let planned = self.estimate_batches(&source, &doc);
            queue.push(Pending {
                source,
                doc,
                planned,
            });
        }

        summary.queued = queue.len();
        for item in &queue {
            self.tracker.mark_pending(&item.source.id);
        }
        self.tracker
            .add_planned_batches(queue.iter().map(|p| p.planned).sum());

        for item in queue {
            match self.process(&item.source, &item.doc, item.planned).await {
                Some(IndexOutcome::Indexed { .. }) => summary.indexed += 1,
                Some(IndexOutcome::Skipped { .. }) => summary.skipped += 1,
                None => summary.failed += 1,
            }
        }

        self.tracker.end_scan();
        tracing::info!(
            discovered = summary.discovered,
            queued = summary.queued,
            indexed = summary.indexed,
            failed = summary.failed,
            "rescan complete"
        );
        Ok(summary)
    }

    /// Watch `path` and index its document if it is not indexed yet.
    ///
    /// Returns `false` when the path was already watched.
    pub async fn watch_path(self: &Arc<Self>, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        if self.watched_source_id(&path).is_some() {
            return Ok(false);
        }
        self.attach(&path).await?;

        if let Some((source, doc)) = self.read_source(&path).await {
            self.set_watched_source_id(&path, &source.id);
            if doc.has_content() && !self.already_indexed(&source) {
                let planned = self.estimate_batches(&source, &doc);
                self.tracker.mark_pending(&source.id);
                self.tracker.add_planned_batches(planned);
                self.process(&source, &doc, planned).await;
                self.tracker.end_scan();
            }
        }
        Ok(true)
    }

    /// Stop watching `path`. Indexed content is left in place.
    pub fn unwatch_path(&self, path: &str) -> bool {
        let removed = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .remove(&normalize_path(path));
        match removed {
            Some(w) => {
                w.task.abort();
                tracing::debug!(path = %path, source_id = %w.source_id, "unwatched path");
                true
            }
            None => false,
        }
    }

    /// React to a change notification: re-index unconditionally, or remove
    /// the source when its document is gone.
    pub async fn handle_change(&self, path: &str) {
        let doc = match self.store.read_doc(path).await {
            Ok(doc) => doc,
            Err(e) => {
                let id = self
                    .watched_source_id(path)
                    .unwrap_or_else(|| path_leaf(path).to_string());
                tracing::error!(path = %path, error = %format!("{:#}", e), "failed to read changed document");
                self.tracker
                    .finish_source(&id, IndexKind::Vector, 0, Some(format!("{:#}", e)));
                return;
            }
        };

        let Some(doc) = doc else {
            if let Some(id) = self.watched_source_id(path) {
                tracing::info!(path = %path, source_id = %id, "document deleted, removing source");
                if let Err(e) = self.remove_source(&id).await {
                    tracing::error!(source_id = %id, error = %format!("{:#}", e), "failed to remove deleted source");
                }
            }
            return;
        };

        let source = Source::from_document(path, &doc);
        self.set_watched_source_id(path, &source.id);
        tracing::info!(source_id = %source.id, path = %path, "document changed, re-indexing");

        let planned = self.estimate_batches(&source, &doc);
        self.tracker.mark_pending(&source.id);
        self.tracker.add_planned_batches(planned);
        self.process(&source, &doc, planned).await;
        self.tracker.end_scan();
    }

    /// Remove a source from both indexes and the indexed sets.
    pub async fn remove_source(&self, source_id: &str) -> Result<()> {
        self.vector.remove_document(source_id).await?;
        self.tabular.remove_csv_source(source_id);
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.vector_ids.remove(source_id);
            state.csv_ids.remove(source_id);
        }
        self.tracker.forget_source(source_id);
        self.sync_counts();
        tracing::info!(source_id = %source_id, "removed source from indexes");
        Ok(())
    }

    /// Route a source to its index. Errors are returned, not recorded.
    pub async fn index_source(&self, source: &Source, doc: &SourceDocument) -> Result<IndexOutcome> {
        match &source.source_type {
            SourceType::Text | SourceType::Pdf | SourceType::Web => {
                self.index_vector(source, source.source_type.as_str(), doc)
                    .await
            }
            SourceType::Csv => self.index_csv(source, doc).await,
            SourceType::Unknown(raw) => {
                tracing::debug!(source_id = %source.id, source_type = %raw, "unknown source type, indexing as text");
                self.index_vector(source, "text", doc).await
            }
        }
    }

    /// Periodic rescans until `shutdown` resolves. Subscriptions are
    /// cancelled on exit, as is a rescan in flight.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) {
        self.initialize().await;

        let mut ticker = tokio::time::interval(self.options.rescan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            let cycle = async {
                ticker.tick().await;
                if let Err(e) = self.rescan().await {
                    tracing::warn!(error = %format!("{:#}", e), "rescan failed");
                }
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = cycle => {}
            }
        }

        self.unwatch_all();
        tracing::info!("watch loop stopped");
    }

    pub fn unwatch_all(&self) {
        let drained: Vec<WatchedPath> = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .drain()
            .map(|(_, w)| w)
            .collect();
        for w in drained {
            w.task.abort();
        }
    }

    // ============ Internals ============

    /// Subscribe to `path` and spawn its change listener.
    async fn attach(self: &Arc<Self>, path: &str) -> Result<()> {
        let mut subscription = self
            .store
            .subscribe(path)
            .await
            .with_context(|| format!("subscribing to {} failed", path))?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let listen_path = path.to_string();
        let task = tokio::spawn(async move {
            while subscription.changed().await.is_some() {
                let Some(watcher) = weak.upgrade() else {
                    break;
                };
                watcher.handle_change(&listen_path).await;
            }
        });

        let previous = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .insert(
                path.to_string(),
                WatchedPath {
                    source_id: path_leaf(path).to_string(),
                    task: task.abort_handle(),
                },
            );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        tracing::debug!(path = %path, "watching path");
        Ok(())
    }

    /// Read and resolve a listed document. Failures are recorded on the
    /// tracker and yield `None`.
    async fn read_source(&self, path: &str) -> Option<(Source, SourceDocument)> {
        match self.store.read_doc(path).await {
            Ok(Some(doc)) => Some((Source::from_document(path, &doc), doc)),
            Ok(None) => {
                tracing::debug!(path = %path, "listed document vanished before read");
                None
            }
            Err(e) => {
                let id = path_leaf(path).to_string();
                tracing::error!(path = %path, error = %format!("{:#}", e), "failed to read source document");
                self.tracker
                    .finish_source(&id, IndexKind::Vector, 0, Some(format!("{:#}", e)));
                None
            }
        }
    }

    fn watched_source_id(&self, path: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .get(path)
            .map(|w| w.source_id.clone())
    }

    fn set_watched_source_id(&self, path: &str, source_id: &str) {
        if let Some(w) = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .watched
            .get_mut(path)
        {
            w.source_id = source_id.to_string();
        }
    }

    fn already_indexed(&self, source: &Source) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match source.source_type.index_kind() {
            IndexKind::Vector => state.vector_ids.contains(&source.id),
            IndexKind::Tabular => state.csv_ids.contains(&source.id),
        }
    }

    fn estimate_batches(&self, source: &Source, doc: &SourceDocument) -> usize {
        match source.source_type.index_kind() {
            IndexKind::Vector => doc
                .content
                .as_deref()
                .map(|c| self.vector.estimate_batches(c))
                .unwrap_or(0),
            IndexKind::Tabular => 1,
        }
    }

    /// Index one source and record the outcome. Returns `None` on failure.
    async fn process(
        &self,
        source: &Source,
        doc: &SourceDocument,
        planned: usize,
    ) -> Option<IndexOutcome> {
        let kind = source.source_type.index_kind();
        let result = self.index_source(source, doc).await;

        let outcome = match result {
            Ok(outcome) => {
                let consumed = match outcome {
                    IndexOutcome::Indexed { batches, .. } => {
                        self.mark_indexed(&source.id, kind);
                        batches
                    }
                    IndexOutcome::Skipped { .. } => planned,
                };
                self.tracker.finish_source(&source.id, kind, consumed, None);
                Some(outcome)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(source_id = %source.id, error = %message, "indexing failed");
                self.tracker
                    .finish_source(&source.id, kind, planned, Some(message));
                None
            }
        };
        self.sync_counts();
        outcome
    }

    async fn index_vector(
        &self,
        source: &Source,
        type_label: &str,
        doc: &SourceDocument,
    ) -> Result<IndexOutcome> {
        let Some(content) = doc.content.as_deref() else {
            tracing::warn!(source_id = %source.id, "source has no content, nothing to index");
            return Ok(IndexOutcome::Skipped {
                kind: IndexKind::Vector,
            });
        };

        // A source that changed type leaves its old index.
        if self.tabular.remove_csv_source(&source.id) {
            self.unmark_indexed(&source.id, IndexKind::Tabular);
            tracing::debug!(source_id = %source.id, "dropped stale CSV cache");
        }

        let on_batch = |p: BatchProgress| self.tracker.record_batch(&source.id, &source.title, p);
        let outcome = self
            .vector
            .add_document(source, type_label, content, Some(&on_batch))
            .await?;

        tracing::info!(
            source_id = %source.id,
            title = %source.title,
            chunks = outcome.chunks,
            batches = outcome.batches,
            "indexed text source"
        );
        Ok(IndexOutcome::Indexed {
            kind: IndexKind::Vector,
            batches: outcome.batches,
        })
    }

    async fn index_csv(&self, source: &Source, doc: &SourceDocument) -> Result<IndexOutcome> {
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.trim().is_empty());
        let Some(csv_text) = non_empty(&doc.raw_csv_content).or_else(|| non_empty(&doc.content))
        else {
            tracing::warn!(source_id = %source.id, "CSV source has neither rawCsvContent nor content");
            return Ok(IndexOutcome::Skipped {
                kind: IndexKind::Tabular,
            });
        };

        parse_csv(&csv_text)
            .with_context(|| format!("parsing CSV source {} failed", source.id))?;

        // Stale chunks go before the rows are cached, so a failed delete
        // never leaves the source queryable from both indexes.
        let was_vector = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vector_ids
            .contains(&source.id);
        if was_vector {
            self.vector.remove_document(&source.id).await?;
            self.unmark_indexed(&source.id, IndexKind::Vector);
            tracing::debug!(source_id = %source.id, "dropped stale vector chunks");
        }

        let rows = self
            .tabular
            .add_csv_source(source, &csv_text)
            .with_context(|| format!("parsing CSV source {} failed", source.id))?;

        tracing::info!(source_id = %source.id, title = %source.title, rows, "indexed CSV source");
        Ok(IndexOutcome::Indexed {
            kind: IndexKind::Tabular,
            batches: 1,
        })
    }

    fn mark_indexed(&self, source_id: &str, kind: IndexKind) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match kind {
            IndexKind::Vector => {
                state.csv_ids.remove(source_id);
                state.vector_ids.insert(source_id.to_string());
            }
            IndexKind::Tabular => {
                state.vector_ids.remove(source_id);
                state.csv_ids.insert(source_id.to_string());
            }
        }
    }

    fn unmark_indexed(&self, source_id: &str, kind: IndexKind) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match kind {
                IndexKind::Vector => state.vector_ids.remove(source_id),
                IndexKind::Tabular => state.csv_ids.remove(source_id),
            };
        }
        self.sync_counts();
    }

    fn sync_counts(&self) {
        let (vector, csv) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            (state.vector_ids.len(), state.csv_ids.len())
        };
        self.tracker.set_indexed_counts(vector, csv);
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.unwatch_all();
    }
}
