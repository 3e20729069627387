//! Vector index adapter over an external similarity-search engine.
//!
//! The [`VectorEngine`] trait is the contract the indexing core needs from
//! a vector database: id-keyed upsert, metadata-filtered delete, text
//! similarity query and count. [`VectorIndex`] layers the source-level
//! semantics on top of it:
//!
//! | Method | Behavior |
//! |--------|----------|
//! | [`add_document`](VectorIndex::add_document) | delete all chunks of the source, then upsert fresh chunks in batches |
//! | [`remove_document`](VectorIndex::remove_document) | delete by `sourceId`; deleting nothing is success |
//! | [`search`](VectorIndex::search) | top-k query, `score = 1 − distance`; no hits is an empty list |
//! | [`get_existing_sources`](VectorIndex::get_existing_sources) | distinct source ids in the collection |
//! | [`get_stats`](VectorIndex::get_stats) | chunk and source counts |
//!
//! Writes are at-least-once: if batch `k` fails, batches `0..k` stay in
//! the engine and the error is returned to the caller.

pub mod chroma;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::chunk::{build_chunks, count_chunks, ChunkParams};
use crate::models::{ChunkMetadata, SearchHit, Source};

/// Default number of chunks per upsert call.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default pause between two upsert calls of the same source.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Metadata field every chunk is tagged with.
pub const SOURCE_ID_FIELD: &str = "sourceId";

/// Equality filter on one metadata field, e.g. `{ "sourceId": "abc" }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFilter {
    pub field: String,
    pub value: String,
}

impl MetadataFilter {
    pub fn source_id(id: &str) -> Self {
        Self {
            field: SOURCE_ID_FIELD.to_string(),
            value: id.to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(self.field.clone(), serde_json::Value::String(self.value.clone()));
        serde_json::Value::Object(map)
    }
}

/// Column-oriented query result, nearest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<ChunkMetadata>,
    pub distances: Vec<f64>,
}

/// External vector database contract.
#[async_trait]
pub trait VectorEngine: Send + Sync {
    /// Engine identifier for logs and stats (e.g. `"memory"`, `"chroma"`).
    fn name(&self) -> &str;

    /// Collection this engine writes to.
    fn collection(&self) -> &str;

    /// Insert or overwrite rows by id.
    async fn upsert(
        &self,
        ids: Vec<String>,
        documents: Vec<String>,
        metadatas: Vec<ChunkMetadata>,
    ) -> Result<()>;

    /// Delete every row whose metadata matches `filter`.
    async fn delete_where(&self, filter: &MetadataFilter) -> Result<()>;

    /// Nearest `n_results` rows to `text`.
    async fn query(&self, text: &str, n_results: usize) -> Result<QueryResponse>;

    /// Total number of rows.
    async fn count(&self) -> Result<usize>;

    /// Distinct `sourceId` values present in the collection.
    async fn source_ids(&self) -> Result<HashSet<String>>;
}

/// Progress of one source's batched upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_index: usize,
    pub total_batches: usize,
    pub processed_chunks: usize,
    pub total_chunks: usize,
}

/// Result of a completed [`VectorIndex::add_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub chunks: usize,
    pub batches: usize,
}

/// Collection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VectorStats {
    pub engine: String,
    pub collection: String,
    pub total_chunks: usize,
    pub sources: usize,
}

/// Number of upsert batches needed for `chunks` chunks.
pub fn batch_count(chunks: usize, batch_size: usize) -> usize {
    chunks.div_ceil(batch_size.max(1))
}

/// Source-level adapter over a [`VectorEngine`].
pub struct VectorIndex {
    engine: Arc<dyn VectorEngine>,
    chunking: ChunkParams,
    batch_size: usize,
    batch_delay: Duration,
}

impl VectorIndex {
    pub fn new(engine: Arc<dyn VectorEngine>, chunking: ChunkParams) -> Self {
        Self {
            engine,
            chunking,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
        }
    }

    pub fn with_batching(mut self, batch_size: usize, batch_delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_delay = batch_delay;
        self
    }

    pub fn chunking(&self) -> ChunkParams {
        self.chunking
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches [`add_document`](Self::add_document) would issue for `content`.
    pub fn estimate_batches(&self, content: &str) -> usize {
        batch_count(count_chunks(content, self.chunking), self.batch_size)
    }

    /// Replace every chunk of `source` with chunks of `content`.
    ///
    /// The delete always completes before the first upsert starts. The
    /// callback fires before and after each batch. The inter-batch pause
    /// is a `tokio` sleep, so dropping the future cancels it.
    pub async fn add_document(
        &self,
        source: &Source,
        type_label: &str,
        content: &str,
        on_progress: Option<&(dyn Fn(BatchProgress) + Send + Sync)>,
    ) -> Result<AddOutcome> {
        self.remove_document(&source.id).await?;

        let chunks = build_chunks(source, content, type_label, self.chunking);
        let total_chunks = chunks.len();
        let total_batches = batch_count(total_chunks, self.batch_size);
        let mut processed_chunks = 0;

        let report = |batch_index: usize, processed_chunks: usize| {
            if let Some(cb) = on_progress {
                cb(BatchProgress {
                    batch_index,
                    total_batches,
                    processed_chunks,
                    total_chunks,
                });
            }
        };

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            report(batch_index, processed_chunks);

            let ids = batch.iter().map(|c| c.id.clone()).collect();
            let documents = batch.iter().map(|c| c.content.clone()).collect();
            let metadatas = batch.iter().map(|c| c.metadata.clone()).collect();
            self.engine
                .upsert(ids, documents, metadatas)
                .await
                .with_context(|| {
                    format!(
                        "upsert of batch {}/{} for source {} failed",
                        batch_index + 1,
                        total_batches,
                        source.id
                    )
                })?;

            processed_chunks += batch.len();
            report(batch_index, processed_chunks);

            if batch_index + 1 < total_batches && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        tracing::debug!(
            source_id = %source.id,
            chunks = total_chunks,
            batches = total_batches,
            "indexed source in vector engine"
        );

        Ok(AddOutcome {
            chunks: total_chunks,
            batches: total_batches,
        })
    }

    /// Delete every chunk of `source_id`. Deleting an absent source succeeds.
    pub async fn remove_document(&self, source_id: &str) -> Result<()> {
        self.engine
            .delete_where(&MetadataFilter::source_id(source_id))
            .await
            .with_context(|| format!("delete of source {} failed", source_id))
    }

    /// Top-`top_k` chunks for `query`, best first.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let resp = self.engine.query(query, top_k).await?;
        let hits = resp
            .ids
            .into_iter()
            .zip(resp.documents)
            .zip(resp.metadatas)
            .zip(resp.distances)
            .map(|(((id, content), metadata), distance)| SearchHit {
                id,
                content,
                metadata,
                score: 1.0 - distance,
            })
            .collect();
        Ok(hits)
    }

    pub async fn get_existing_sources(&self) -> Result<HashSet<String>> {
        self.engine.source_ids().await
    }

    pub async fn get_stats(&self) -> Result<VectorStats> {
        Ok(VectorStats {
            engine: self.engine.name().to_string(),
            collection: self.engine.collection().to_string(),
            total_chunks: self.engine.count().await?,
            sources: self.engine.source_ids().await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::memory::MemoryEngine;
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::SourceType;

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            title: format!("Title {}", id),
            path: format!("app/data/{}", id),
            note_id: None,
            source_type: SourceType::Text,
            created_at: None,
        }
    }

    fn index(engine: Arc<dyn VectorEngine>) -> VectorIndex {
        VectorIndex::new(
            engine,
            ChunkParams {
                max_chars: 40,
                overlap_chars: 5,
            },
        )
        .with_batching(2, Duration::ZERO)
    }

    fn memory_engine() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine::new(
            "test",
            Arc::new(HashingEmbedder::new(128)),
        ))
    }

    /// Engine that fails the `fail_on`-th upsert call (1-based).
    struct FlakyEngine {
        inner: Arc<MemoryEngine>,
        upserts: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl VectorEngine for FlakyEngine {
        fn name(&self) -> &str {
            "flaky"
        }
        fn collection(&self) -> &str {
            "test"
        }
        async fn upsert(
            &self,
            ids: Vec<String>,
            documents: Vec<String>,
            metadatas: Vec<ChunkMetadata>,
        ) -> Result<()> {
            let n = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                anyhow::bail!("engine unavailable");
            }
            self.inner.upsert(ids, documents, metadatas).await
        }
        async fn delete_where(&self, filter: &MetadataFilter) -> Result<()> {
            self.inner.delete_where(filter).await
        }
        async fn query(&self, text: &str, n: usize) -> Result<QueryResponse> {
            self.inner.query(text, n).await
        }
        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
        async fn source_ids(&self) -> Result<HashSet<String>> {
            self.inner.source_ids().await
        }
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(0, 25), 0);
        assert_eq!(batch_count(1, 25), 1);
        assert_eq!(batch_count(25, 25), 1);
        assert_eq!(batch_count(26, 25), 2);
    }

    #[tokio::test]
    async fn test_add_reports_progress_around_each_batch() {
        let engine = memory_engine();
        let idx = index(engine.clone());
        let content = "Rivers carry water to the sea. ".repeat(8);
        let events = Mutex::new(Vec::new());
        let cb = |p: BatchProgress| events.lock().unwrap().push(p);

        let outcome = idx
            .add_document(&source("s1"), "text", &content, Some(&cb))
            .await
            .unwrap();

        let events = events.into_inner().unwrap();
        assert_eq!(outcome.batches, batch_count(outcome.chunks, 2));
        assert_eq!(idx.estimate_batches(&content), outcome.batches);
        assert_eq!(events.len(), outcome.batches * 2);
        assert_eq!(events[0].processed_chunks, 0);
        let last = events.last().unwrap();
        assert_eq!(last.processed_chunks, outcome.chunks);
        assert_eq!(last.batch_index + 1, outcome.batches);
        assert!(events
            .windows(2)
            .all(|w| w[0].processed_chunks <= w[1].processed_chunks));
        assert_eq!(engine.count().await.unwrap(), outcome.chunks);
    }

    #[tokio::test]
    async fn test_second_add_replaces_first() {
        let engine = memory_engine();
        let idx = index(engine.clone());
        let first = "Volcanoes erupt molten lava. ".repeat(10);
        idx.add_document(&source("s1"), "text", &first, None)
            .await
            .unwrap();
        let outcome = idx
            .add_document(&source("s1"), "text", "Glaciers move slowly.", None)
            .await
            .unwrap();

        assert_eq!(outcome.chunks, 1);
        assert_eq!(engine.count().await.unwrap(), 1);
        let hits = idx.search("volcanoes lava", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Glaciers move slowly.");
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_earlier_batches() {
        let flaky = Arc::new(FlakyEngine {
            inner: memory_engine(),
            upserts: AtomicUsize::new(0),
            fail_on: 2,
        });
        let idx = index(flaky.clone());
        let content = "Bees pollinate many flowering plants. ".repeat(10);

        let err = idx
            .add_document(&source("s1"), "text", &content, None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("engine unavailable"));
        assert_eq!(flaky.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let engine = memory_engine();
        let idx = index(engine.clone());
        idx.remove_document("never-added").await.unwrap();
        idx.add_document(&source("s1"), "text", "Some text.", None)
            .await
            .unwrap();
        idx.remove_document("s1").await.unwrap();
        idx.remove_document("s1").await.unwrap();
        assert_eq!(engine.count().await.unwrap(), 0);
        assert!(idx.get_existing_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_scores_and_empty_results() {
        let engine = memory_engine();
        let idx = index(engine);
        assert!(idx.search("anything", 5).await.unwrap().is_empty());

        idx.add_document(&source("a"), "pdf", "Quantum entanglement links particles.", None)
            .await
            .unwrap();
        idx.add_document(&source("b"), "web", "Bread needs flour and yeast.", None)
            .await
            .unwrap();

        let hits = idx.search("quantum particles", 5).await.unwrap();
        assert_eq!(hits[0].metadata.source_id, "a");
        assert_eq!(hits[0].metadata.source_type, "pdf");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| h.score <= 1.0 + 1e-9));

        let stats = idx.get_stats().await.unwrap();
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.engine, "memory");
    }
}
