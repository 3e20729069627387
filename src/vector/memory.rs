//! In-memory [`VectorEngine`] for tests and single-process use.
//!
//! Rows live in a `BTreeMap` behind `std::sync::RwLock`. Queries are
//! brute-force cosine similarity over every stored vector; the reported
//! distance is `1 − cosine`, matching a cosine-space external engine.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{MetadataFilter, QueryResponse, VectorEngine, SOURCE_ID_FIELD};
use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::models::ChunkMetadata;

struct StoredRow {
    document: String,
    metadata: ChunkMetadata,
    vector: Vec<f32>,
}

fn metadata_field<'a>(metadata: &'a ChunkMetadata, field: &str) -> Option<&'a str> {
    match field {
        SOURCE_ID_FIELD => Some(&metadata.source_id),
        "sourceType" => Some(&metadata.source_type),
        "title" => Some(&metadata.title),
        _ => None,
    }
}

pub struct MemoryEngine {
    collection: String,
    embedder: Arc<dyn Embedder>,
    rows: RwLock<BTreeMap<String, StoredRow>>,
}

impl MemoryEngine {
    pub fn new(collection: &str, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            collection: collection.to_string(),
            embedder,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Ids currently stored for `source_id`, in id order.
    pub fn chunk_ids(&self, source_id: &str) -> Vec<String> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, row)| row.metadata.source_id == source_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl VectorEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    async fn upsert(
        &self,
        ids: Vec<String>,
        documents: Vec<String>,
        metadatas: Vec<ChunkMetadata>,
    ) -> Result<()> {
        if ids.len() != documents.len() || ids.len() != metadatas.len() {
            bail!(
                "upsert length mismatch: {} ids, {} documents, {} metadatas",
                ids.len(),
                documents.len(),
                metadatas.len()
            );
        }

        let vectors = self.embedder.embed(&documents).await?;

        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for (((id, document), metadata), vector) in
            ids.into_iter().zip(documents).zip(metadatas).zip(vectors)
        {
            rows.insert(
                id,
                StoredRow {
                    document,
                    metadata,
                    vector,
                },
            );
        }
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, row| {
                metadata_field(&row.metadata, &filter.field) != Some(filter.value.as_str())
            });
        Ok(())
    }

    async fn query(&self, text: &str, n_results: usize) -> Result<QueryResponse> {
        let query_vec = embed_query(self.embedder.as_ref(), text).await?;

        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(f64, &String, &StoredRow)> = rows
            .iter()
            .map(|(id, row)| {
                let distance = 1.0 - cosine_similarity(&query_vec, &row.vector) as f64;
                (distance, id, row)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        scored.truncate(n_results);

        let mut resp = QueryResponse::default();
        for (distance, id, row) in scored {
            resp.ids.push(id.clone());
            resp.documents.push(row.document.clone());
            resp.metadatas.push(row.metadata.clone());
            resp.distances.push(distance);
        }
        Ok(resp)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn source_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|row| row.metadata.source_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn meta(source_id: &str, index: usize) -> ChunkMetadata {
        ChunkMetadata {
            source_id: source_id.to_string(),
            source_type: "text".to_string(),
            chunk_index: index,
            title: "t".to_string(),
        }
    }

    fn engine() -> MemoryEngine {
        MemoryEngine::new("notes", Arc::new(HashingEmbedder::new(64)))
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_id() {
        let e = engine();
        e.upsert(vec!["a_chunk_0".into()], vec!["one".into()], vec![meta("a", 0)])
            .await
            .unwrap();
        e.upsert(vec!["a_chunk_0".into()], vec!["two".into()], vec![meta("a", 0)])
            .await
            .unwrap();
        assert_eq!(e.count().await.unwrap(), 1);
        let resp = e.query("two", 5).await.unwrap();
        assert_eq!(resp.documents, vec!["two".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_where_only_matches_filter() {
        let e = engine();
        e.upsert(
            vec!["a_chunk_0".into(), "b_chunk_0".into()],
            vec!["alpha".into(), "beta".into()],
            vec![meta("a", 0), meta("b", 0)],
        )
        .await
        .unwrap();
        e.delete_where(&MetadataFilter::source_id("a")).await.unwrap();
        assert_eq!(e.chunk_ids("a"), Vec::<String>::new());
        assert_eq!(e.chunk_ids("b"), vec!["b_chunk_0".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_mismatched_columns() {
        let e = engine();
        let err = e
            .upsert(vec!["x".into()], vec![], vec![meta("x", 0)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }
}
