//! Wiring of the indexing and retrieval components from a [`Config`].
//!
//! | Config | Component |
//! |--------|-----------|
//! | `[store].root` set / unset | [`FsDocumentStore`] / [`MemoryDocumentStore`] |
//! | `[embedding].provider` | [`Embedder`](crate::embedding::Embedder) via [`create_embedder`] |
//! | `[vector].engine` | [`MemoryEngine`] or [`ChromaEngine`] behind a [`VectorIndex`] |
//! | `[retrieval].search_url` | [`RemoteSearch`] instead of the local index for RAG text search |
//! | `[llm]` | [`ChatClient`] |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::llm::ChatClient;
use crate::progress::ProgressReporter;
use crate::rag::{RagAssembler, RemoteSearch, RetrievalOptions, TextSearch};
use crate::store::fs::FsDocumentStore;
use crate::store::memory::MemoryDocumentStore;
use crate::store::DocumentStore;
use crate::tabular::TabularIndex;
use crate::vector::chroma::ChromaEngine;
use crate::vector::memory::MemoryEngine;
use crate::vector::{VectorEngine, VectorIndex};
use crate::watch::{SourceWatcher, WatchOptions};

/// Every long-lived component of one process.
pub struct Pipeline {
    pub store: Arc<dyn DocumentStore>,
    pub vector: Arc<VectorIndex>,
    pub tabular: Arc<TabularIndex>,
    pub watcher: Arc<SourceWatcher>,
    pub rag: Arc<RagAssembler>,
}

impl Pipeline {
    pub fn from_config(config: &Config, reporter: Arc<dyn ProgressReporter>) -> Result<Self> {
        let store = open_store(config)?;
        Self::with_store(config, store, reporter)
    }

    /// Like [`from_config`](Self::from_config) with an explicit store.
    pub fn with_store(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let engine = create_engine(config, embedder)?;
        let vector = Arc::new(
            VectorIndex::new(engine, config.chunk_params()).with_batching(
                config.vector.batch_size,
                Duration::from_millis(config.vector.batch_delay_ms),
            ),
        );
        let tabular = Arc::new(TabularIndex::new());

        let watcher = Arc::new(
            SourceWatcher::new(
                store.clone(),
                vector.clone(),
                tabular.clone(),
                WatchOptions::from_config(config),
            )
            .with_reporter(reporter),
        );

        let text: Arc<dyn TextSearch> = match &config.retrieval.search_url {
            Some(url) => Arc::new(RemoteSearch::new(url)?),
            None => vector.clone(),
        };
        let rag = Arc::new(
            RagAssembler::new(Some(text), tabular.clone())
                .with_chat(Arc::new(ChatClient::new(&config.llm)?))
                .with_defaults(RetrievalOptions::from_config(&config.retrieval)),
        );

        Ok(Self {
            store,
            vector,
            tabular,
            watcher,
            rag,
        })
    }
}

pub fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match &config.store.root {
        Some(root) => Ok(Arc::new(FsDocumentStore::open(root)?)),
        None => Ok(Arc::new(MemoryDocumentStore::new())),
    }
}

/// Create the configured [`VectorEngine`].
///
/// | Config Value | Engine |
/// |-------------|--------|
/// | `"memory"` | [`MemoryEngine`] |
/// | `"chroma"` | [`ChromaEngine`] |
pub fn create_engine(
    config: &Config,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorEngine>> {
    match config.vector.engine.as_str() {
        "memory" => Ok(Arc::new(MemoryEngine::new(
            &config.vector.collection,
            embedder,
        ))),
        "chroma" => Ok(Arc::new(ChromaEngine::new(&config.vector, embedder)?)),
        other => bail!("Unknown vector engine: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    #[tokio::test]
    async fn test_minimal_pipeline_is_in_memory() {
        let pipeline = Pipeline::from_config(&Config::minimal(), Arc::new(NoProgress)).unwrap();
        let stats = pipeline.vector.get_stats().await.unwrap();
        assert_eq!(stats.engine, "memory");
        assert_eq!(stats.collection, "research_sources");
        assert!(pipeline.store.list("data").await.unwrap().is_empty());
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let mut config = Config::minimal();
        config.vector.engine = "faiss".to_string();
        let embedder = create_embedder(&config.embedding).unwrap();
        assert!(create_engine(&config, embedder).is_err());
    }
}
