//! Integration tests for the watch loop, both indexes and the retrieval
//! merger, run against in-memory backends through the public API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use notes_rag::chunk::ChunkParams;
use notes_rag::embedding::HashingEmbedder;
use notes_rag::models::{ChunkMetadata, DocumentMetadata, SourceDocument};
use notes_rag::progress::{ProgressEvent, ProgressReporter};
use notes_rag::rag::{RagAssembler, RetrievalOptions, TextSearch, NO_SOURCES_CONTEXT};
use notes_rag::store::memory::MemoryDocumentStore;
use notes_rag::store::{DocumentStore, StoreEntry, Subscription};
use notes_rag::tabular::TabularIndex;
use notes_rag::vector::memory::MemoryEngine;
use notes_rag::vector::{MetadataFilter, QueryResponse, VectorEngine, VectorIndex};
use notes_rag::watch::{SourceWatcher, WatchOptions};

// ─── Test engine ────────────────────────────────────────────────────

/// Wraps [`MemoryEngine`], counting calls and optionally failing the
/// upserts of one source or every delete.
struct CountingEngine {
    inner: MemoryEngine,
    deletes: AtomicUsize,
    upserts: AtomicUsize,
    fail_source: Option<String>,
    failing: AtomicBool,
    failing_deletes: AtomicBool,
}

impl CountingEngine {
    fn new(fail_source: Option<&str>) -> Self {
        Self {
            inner: MemoryEngine::new("test", Arc::new(HashingEmbedder::new(128))),
            deletes: AtomicUsize::new(0),
            upserts: AtomicUsize::new(0),
            fail_source: fail_source.map(str::to_string),
            failing: AtomicBool::new(fail_source.is_some()),
            failing_deletes: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.deletes.store(0, Ordering::SeqCst);
        self.upserts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn collection(&self) -> &str {
        self.inner.collection()
    }

    async fn upsert(
        &self,
        ids: Vec<String>,
        documents: Vec<String>,
        metadatas: Vec<ChunkMetadata>,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            if let Some(bad) = &self.fail_source {
                if metadatas.iter().any(|m| &m.source_id == bad) {
                    bail!("simulated outage for {}", bad);
                }
            }
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(ids, documents, metadatas).await
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<()> {
        if self.failing_deletes.load(Ordering::SeqCst) {
            bail!("simulated delete outage");
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_where(filter).await
    }

    async fn query(&self, text: &str, n_results: usize) -> Result<QueryResponse> {
        self.inner.query(text, n_results).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn source_ids(&self) -> Result<HashSet<String>> {
        self.inner.source_ids().await
    }
}

/// Wraps [`MemoryDocumentStore`], refusing subscriptions to one path.
struct RefusingStore {
    inner: MemoryDocumentStore,
    refused: Mutex<Option<String>>,
}

#[async_trait]
impl DocumentStore for RefusingStore {
    async fn read_doc(&self, path: &str) -> Result<Option<SourceDocument>> {
        self.inner.read_doc(path).await
    }

    async fn write_doc(&self, path: &str, doc: &SourceDocument) -> Result<()> {
        self.inner.write_doc(path, doc).await
    }

    async fn remove_doc(&self, path: &str) -> Result<bool> {
        self.inner.remove_doc(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<StoreEntry>> {
        self.inner.list(path).await
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        if self.refused.lock().unwrap().as_deref() == Some(path) {
            bail!("subscribe refused");
        }
        self.inner.subscribe(path).await
    }
}

/// Collects every progress event.
#[derive(Default)]
struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

struct Harness {
    store: Arc<MemoryDocumentStore>,
    engine: Arc<CountingEngine>,
    vector: Arc<VectorIndex>,
    tabular: Arc<TabularIndex>,
    watcher: Arc<SourceWatcher>,
}

fn harness(fail_source: Option<&str>, reporter: Option<Arc<dyn ProgressReporter>>) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let engine = Arc::new(CountingEngine::new(fail_source));
    let params = ChunkParams {
        max_chars: 100,
        overlap_chars: 20,
    };
    let vector = Arc::new(
        VectorIndex::new(engine.clone(), params).with_batching(2, Duration::ZERO),
    );
    let tabular = Arc::new(TabularIndex::new());
    let mut watcher = SourceWatcher::new(
        store.clone(),
        vector.clone(),
        tabular.clone(),
        WatchOptions {
            activity_window: Duration::ZERO,
            ..WatchOptions::default()
        },
    );
    if let Some(reporter) = reporter {
        watcher = watcher.with_reporter(reporter);
    }
    Harness {
        store,
        engine,
        vector,
        tabular,
        watcher: Arc::new(watcher),
    }
}

fn text_doc(title: &str, content: &str) -> SourceDocument {
    SourceDocument {
        title: title.to_string(),
        content: Some(content.to_string()),
        raw_csv_content: None,
        metadata: DocumentMetadata::default(),
    }
}

fn csv_doc(title: &str, raw: &str) -> SourceDocument {
    SourceDocument {
        title: title.to_string(),
        content: None,
        raw_csv_content: Some(raw.to_string()),
        metadata: DocumentMetadata {
            source_type: "csv".to_string(),
            ..DocumentMetadata::default()
        },
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

const LONG_TEXT: &str = "Sediment cores from the northern basin show layered deposits. \
    Each layer records a flood season and its pollen load. \
    Radiocarbon dates place the oldest layer around four thousand years ago. \
    The upper layers carry charcoal from recent fires in the catchment.";

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_edit_reindexes_with_one_delete() {
    let h = harness(None, None);
    h.store
        .write_doc("data/cores", &text_doc("Cores", LONG_TEXT))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();
    assert!(h.watcher.indexed_ids().vector.contains("cores"));

    h.engine.reset();
    h.store
        .write_doc("data/cores", &text_doc("Cores", "Only one short line now."))
        .await
        .unwrap();

    let engine = h.engine.clone();
    wait_until(|| engine.upserts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.engine.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.upserts.load(Ordering::SeqCst), 1);

    let hits = h.vector.search("short line", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "Only one short line now.");
}

#[tokio::test]
async fn test_rescan_skips_already_indexed_sources() {
    let h = harness(None, None);
    h.store
        .write_doc("data/a", &text_doc("A", "alpha notes"))
        .await
        .unwrap();
    let first = h.watcher.rescan().await.unwrap();
    assert_eq!(first.indexed, 1);

    h.engine.reset();
    let second = h.watcher.rescan().await.unwrap();
    assert_eq!(second.discovered, 1);
    assert_eq!(second.queued, 0);
    assert_eq!(h.engine.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_restart_does_not_reindex_existing_sources() {
    let h = harness(None, None);
    h.store
        .write_doc("data/a", &text_doc("A", "alpha notes"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();

    // A second watcher over the same engine stands in for a restart.
    let restarted = Arc::new(SourceWatcher::new(
        h.store.clone(),
        h.vector.clone(),
        Arc::new(TabularIndex::new()),
        WatchOptions::default(),
    ));
    restarted.initialize().await;
    h.engine.reset();
    let summary = restarted.rescan().await.unwrap();
    assert_eq!(summary.newly_watched, 1);
    assert_eq!(summary.queued, 0);
    assert_eq!(h.engine.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_csv_sources_route_to_tabular_index() {
    let h = harness(None, None);
    h.store
        .write_doc("data/test", &csv_doc("test.csv", "CSV Data: test.csv\na,b\n1,2\n3,4"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();

    let ids = h.watcher.indexed_ids();
    assert!(ids.csv.contains("test"));
    assert!(ids.vector.is_empty());
    assert_eq!(h.engine.upserts.load(Ordering::SeqCst), 0);

    let rows = h.tabular.query_source("test", "b contains 2").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["a"], "1");
    assert_eq!(rows[0]["b"], "2");
}

#[tokio::test]
async fn test_type_change_moves_source_between_indexes() {
    let h = harness(None, None);
    h.store
        .write_doc("data/t", &text_doc("Table", "plain prose first"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();
    assert!(h.watcher.indexed_ids().vector.contains("t"));

    h.store
        .write_doc("data/t", &csv_doc("Table", "x,y\n1,2"))
        .await
        .unwrap();
    let watcher = h.watcher.clone();
    wait_until(|| watcher.indexed_ids().csv.contains("t")).await;

    let ids = h.watcher.indexed_ids();
    assert!(ids.csv.contains("t"));
    assert!(!ids.vector.contains("t"));
    assert!(h.vector.get_existing_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_one_failing_source_does_not_block_others() {
    let h = harness(Some("bad"), None);
    h.store
        .write_doc("data/bad", &text_doc("Bad", "this one hits an outage"))
        .await
        .unwrap();
    h.store
        .write_doc("data/good", &text_doc("Good", "this one indexes fine"))
        .await
        .unwrap();

    let summary = h.watcher.rescan().await.unwrap();
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.failed, 1);

    let progress = h.watcher.progress();
    assert_eq!(progress.failed, vec!["bad".to_string()]);
    assert_eq!(progress.processed_batches, progress.total_batches);
    assert!(h.watcher.indexed_ids().vector.contains("good"));
    assert!(!h.watcher.indexed_ids().vector.contains("bad"));

    // The outage ends; the next cycle retries the failed source only.
    h.engine.failing.store(false, Ordering::SeqCst);
    let retry = h.watcher.rescan().await.unwrap();
    assert_eq!(retry.queued, 1);
    assert_eq!(retry.indexed, 1);
    assert!(h.watcher.progress().failed.is_empty());
    assert!(h.watcher.indexed_ids().vector.contains("bad"));
}

#[tokio::test]
async fn test_unwatchable_path_does_not_stop_rescan() {
    let store = Arc::new(RefusingStore {
        inner: MemoryDocumentStore::new(),
        refused: Mutex::new(Some("data/a_broken".to_string())),
    });
    store
        .write_doc("data/a_broken", &text_doc("Broken", "cannot be watched yet"))
        .await
        .unwrap();
    store
        .write_doc("data/b_good", &text_doc("Good", "indexes on the first pass"))
        .await
        .unwrap();
    let vector = Arc::new(VectorIndex::new(
        Arc::new(CountingEngine::new(None)),
        ChunkParams::default(),
    ));
    let watcher = Arc::new(SourceWatcher::new(
        store.clone(),
        vector,
        Arc::new(TabularIndex::new()),
        WatchOptions::default(),
    ));

    let summary = watcher.rescan().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.indexed, 1);
    assert!(watcher.indexed_ids().vector.contains("b_good"));
    assert_eq!(watcher.progress().failed, vec!["a_broken".to_string()]);

    // The path stayed unwatched, so the next cycle attaches it again.
    *store.refused.lock().unwrap() = None;
    let retry = watcher.rescan().await.unwrap();
    assert_eq!(retry.newly_watched, 1);
    assert_eq!(retry.indexed, 1);
    assert!(watcher.indexed_ids().vector.contains("a_broken"));
    assert!(watcher.progress().failed.is_empty());
}

#[tokio::test]
async fn test_failed_csv_to_text_change_clears_csv_state() {
    let h = harness(Some("t"), None);
    h.store
        .write_doc("data/t", &csv_doc("Table", "x,y\n1,2"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();
    assert!(h.watcher.indexed_ids().csv.contains("t"));

    // Upserts for "t" fail, so the text version never lands.
    h.store
        .write_doc("data/t", &text_doc("Table", "now plain prose"))
        .await
        .unwrap();
    let watcher = h.watcher.clone();
    wait_until(|| watcher.progress().failed.contains(&"t".to_string())).await;

    let ids = h.watcher.indexed_ids();
    assert!(!ids.csv.contains("t"));
    assert!(!ids.vector.contains("t"));
    assert!(!h.tabular.contains("t"));
    assert_eq!(h.watcher.progress().csv_indexed, 0);

    h.engine.failing.store(false, Ordering::SeqCst);
    let retry = h.watcher.rescan().await.unwrap();
    assert_eq!(retry.indexed, 1);
    assert!(h.watcher.indexed_ids().vector.contains("t"));
}

#[tokio::test]
async fn test_failed_text_to_csv_change_keeps_rows_out_of_cache() {
    let h = harness(None, None);
    h.store
        .write_doc("data/t", &text_doc("Table", "plain prose first"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();
    assert!(h.watcher.indexed_ids().vector.contains("t"));

    h.engine.failing_deletes.store(true, Ordering::SeqCst);
    h.store
        .write_doc("data/t", &csv_doc("Table", "x,y\n1,2"))
        .await
        .unwrap();
    let watcher = h.watcher.clone();
    wait_until(|| watcher.progress().failed.contains(&"t".to_string())).await;

    let ids = h.watcher.indexed_ids();
    assert!(ids.vector.contains("t"));
    assert!(!ids.csv.contains("t"));
    assert!(!h.tabular.contains("t"));
    assert!(h.tabular.query_source("t", "x contains 1").is_none());

    h.engine.failing_deletes.store(false, Ordering::SeqCst);
    h.watcher.rescan().await.unwrap();
    let ids = h.watcher.indexed_ids();
    assert!(ids.csv.contains("t"));
    assert!(!ids.vector.contains("t"));
    assert!(h.vector.get_existing_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_is_monotonic_within_a_cycle() {
    let reporter = Arc::new(RecordingReporter::default());
    let h = harness(None, Some(reporter.clone()));
    h.store
        .write_doc("data/long", &text_doc("Long", &LONG_TEXT.repeat(3)))
        .await
        .unwrap();
    h.store
        .write_doc("data/short", &text_doc("Short", "brief"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();

    let events = reporter.events.lock().unwrap().clone();
    let mut last_processed = 0;
    let mut last_chunks: Option<(String, usize)> = None;
    let mut planned = 0;
    for event in &events {
        match event {
            ProgressEvent::Planned { total_batches } => planned = *total_batches,
            ProgressEvent::Batch(batch) => {
                if let Some((id, chunks)) = &last_chunks {
                    if id == &batch.source_id {
                        assert!(batch.processed_chunks >= *chunks);
                    }
                }
                assert!(batch.processed_chunks <= batch.total_chunks);
                last_chunks = Some((batch.source_id.clone(), batch.processed_chunks));
            }
            ProgressEvent::SourceFinished {
                processed_batches, ..
            } => {
                assert!(*processed_batches >= last_processed);
                assert!(*processed_batches <= planned);
                last_processed = *processed_batches;
            }
            _ => {}
        }
    }
    assert!(planned > 2);
    assert_eq!(last_processed, planned);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::ScanFinished { failed: 0, .. })
    ));
    assert_eq!(h.watcher.progress().percent, 100.0);
}

#[tokio::test]
async fn test_deleted_document_is_removed_from_indexes() {
    let h = harness(None, None);
    h.store
        .write_doc("data/gone", &text_doc("Gone", "temporary notes"))
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();

    assert!(h.store.remove_doc("data/gone").await.unwrap());
    let watcher = h.watcher.clone();
    wait_until(|| watcher.indexed_ids().vector.is_empty()).await;
    assert!(h.vector.get_existing_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retrieval_merges_text_and_csv() {
    let h = harness(None, None);
    h.store
        .write_doc("data/notes", &text_doc("Field notes", "The north site had acidic soil."))
        .await
        .unwrap();
    h.store
        .write_doc(
            "data/survey",
            &csv_doc("survey.csv", "site,ph\nnorth,5.9\nsouth,7.2\n"),
        )
        .await
        .unwrap();
    h.watcher.rescan().await.unwrap();

    let text: Arc<dyn TextSearch> = h.vector.clone();
    let rag = RagAssembler::new(Some(text), h.tabular.clone());
    let result = rag
        .query_relevant_sources("site contains north", &RetrievalOptions::default())
        .await;

    assert_eq!(result.text_results.len(), 1);
    assert_eq!(result.csv_results.len(), 1);
    assert_eq!(result.csv_results[0].match_count, 1);
    assert!(result.context.contains("Source 1 - Field notes (text):"));
    assert!(result.context.contains("Source 2 - survey.csv (csv):"));
    assert!(result.context.contains("Found 1 relevant rows:"));
}

#[tokio::test]
async fn test_retrieval_with_nothing_indexed_is_graceful() {
    let h = harness(None, None);
    let text: Arc<dyn TextSearch> = h.vector.clone();
    let rag = RagAssembler::new(Some(text), h.tabular.clone());

    let result = rag
        .query_relevant_sources("anything at all", &RetrievalOptions::default())
        .await;
    assert!(result.is_empty());
    assert_eq!(result.context, NO_SOURCES_CONTEXT);
}
