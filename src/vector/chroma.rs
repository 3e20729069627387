//! [`VectorEngine`] backed by a Chroma server over its REST API.
//!
//! The collection is created on first use (`get_or_create`) in cosine
//! space, so the distances Chroma returns are `1 − cosine`. Embeddings are
//! computed client-side with the configured [`Embedder`] and sent with each
//! upsert and query.
//!
//! # Endpoints
//!
//! All paths are relative to
//! `{url}/api/v2/tenants/{tenant}/databases/{database}`.
//!
//! | Method | Path | Use |
//! |--------|------|-----|
//! | `POST` | `/collections` | resolve collection id |
//! | `POST` | `/collections/{id}/upsert` | write chunks |
//! | `POST` | `/collections/{id}/delete` | delete by `where` filter |
//! | `POST` | `/collections/{id}/query` | similarity query |
//! | `GET`  | `/collections/{id}/count` | row count |
//! | `POST` | `/collections/{id}/get` | page through metadatas |

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{MetadataFilter, QueryResponse, VectorEngine};
use crate::config::VectorConfig;
use crate::embedding::{embed_query, Embedder};
use crate::models::ChunkMetadata;

/// Page size used when listing metadatas for [`VectorEngine::source_ids`].
const GET_PAGE_SIZE: usize = 1000;

pub struct ChromaEngine {
    client: reqwest::Client,
    base: String,
    collection: String,
    collection_id: OnceCell<String>,
    embedder: Arc<dyn Embedder>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryPayload {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<ChunkMetadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f64>>>>,
}

#[derive(Deserialize)]
struct GetPayload {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    metadatas: Option<Vec<Option<serde_json::Value>>>,
}

impl ChromaEngine {
    pub fn new(config: &VectorConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("vector.url required for chroma engine"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base: format!(
                "{}/api/v2/tenants/{}/databases/{}",
                url.trim_end_matches('/'),
                config.tenant,
                config.database
            ),
            collection: config.collection.clone(),
            collection_id: OnceCell::new(),
            embedder,
        })
    }

    async fn collection_url(&self) -> Result<String> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let body = serde_json::json!({
                    "name": self.collection,
                    "get_or_create": true,
                    "metadata": { "hnsw:space": "cosine" },
                });
                let resp = self
                    .client
                    .post(format!("{}/collections", self.base))
                    .json(&body)
                    .send()
                    .await
                    .context("chroma unreachable")?;
                let resp = check_status(resp, "create collection").await?;
                let created: CollectionResponse = resp.json().await?;
                tracing::info!(collection = %self.collection, id = %created.id, "resolved chroma collection");
                Ok::<_, anyhow::Error>(created.id)
            })
            .await?;
        Ok(format!("{}/collections/{}", self.base, id))
    }

    async fn post(&self, op: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.collection_url().await?, op);
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("chroma {} request failed", op))?;
        Ok(resp)
    }
}

async fn check_status(resp: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("chroma {} error {}: {}", op, status, body)
}

#[async_trait]
impl VectorEngine for ChromaEngine {
    fn name(&self) -> &str {
        "chroma"
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
        let embeddings = self.embedder.embed(&documents).await?;
        let body = serde_json::json!({
            "ids": ids,
            "documents": documents,
            "metadatas": metadatas,
            "embeddings": embeddings,
        });
        let resp = self.post("upsert", body).await?;
        check_status(resp, "upsert").await?;
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<()> {
        let resp = self
            .post("delete", serde_json::json!({ "where": filter.to_json() }))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(filter = ?filter, "chroma delete matched nothing");
            return Ok(());
        }
        check_status(resp, "delete").await?;
        Ok(())
    }

    async fn query(&self, text: &str, n_results: usize) -> Result<QueryResponse> {
        let query_vec = embed_query(self.embedder.as_ref(), text).await?;
        let body = serde_json::json!({
            "query_embeddings": [query_vec],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        let resp = self.post("query", body).await?;
        let payload: QueryPayload = check_status(resp, "query").await?.json().await?;
        Ok(flatten_query(payload))
    }

    async fn count(&self) -> Result<usize> {
        let url = format!("{}/count", self.collection_url().await?);
        let resp = self.client.get(url).send().await.context("chroma count request failed")?;
        let count: usize = check_status(resp, "count").await?.json().await?;
        Ok(count)
    }

    async fn source_ids(&self) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        let mut offset = 0;
        loop {
            let body = serde_json::json!({
                "include": ["metadatas"],
                "limit": GET_PAGE_SIZE,
                "offset": offset,
            });
            let resp = self.post("get", body).await?;
            let page: GetPayload = check_status(resp, "get").await?.json().await?;
            let fetched = page.ids.len();
            out.extend(
                page.metadatas
                    .unwrap_or_default()
                    .into_iter()
                    .flatten()
                    .filter_map(|m| {
                        m.get(super::SOURCE_ID_FIELD)
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    }),
            );
            if fetched < GET_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(out)
    }
}

/// Chroma nests every column per query text; only one text is ever sent.
fn flatten_query(payload: QueryPayload) -> QueryResponse {
    fn first<T>(v: Option<Vec<Vec<Option<T>>>>) -> Option<Vec<Option<T>>> {
        v.and_then(|rows| rows.into_iter().next())
    }

    let ids = payload.ids.into_iter().next().unwrap_or_default();
    let documents = first(payload.documents).unwrap_or_default();
    let metadatas = first(payload.metadatas).unwrap_or_default();
    let distances = first(payload.distances).unwrap_or_default();

    let mut resp = QueryResponse::default();
    for (i, id) in ids.into_iter().enumerate() {
        let (Some(Some(metadata)), Some(distance)) = (metadatas.get(i), distances.get(i)) else {
            continue;
        };
        resp.ids.push(id);
        resp.documents
            .push(documents.get(i).cloned().flatten().unwrap_or_default());
        resp.metadatas.push(metadata.clone());
        resp.distances.push(distance.unwrap_or(1.0));
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_query_payload() {
        let json = serde_json::json!({
            "ids": [["s1_chunk_0", "s2_chunk_3"]],
            "documents": [["first", null]],
            "metadatas": [[
                { "sourceId": "s1", "sourceType": "text", "chunkIndex": 0, "title": "One" },
                { "sourceId": "s2", "sourceType": "web", "chunkIndex": 3, "title": "Two" }
            ]],
            "distances": [[0.25, 0.5]]
        });
        let payload: QueryPayload = serde_json::from_value(json).unwrap();
        let resp = flatten_query(payload);
        assert_eq!(resp.ids, vec!["s1_chunk_0", "s2_chunk_3"]);
        assert_eq!(resp.documents, vec!["first".to_string(), String::new()]);
        assert_eq!(resp.metadatas[1].chunk_index, 3);
        assert_eq!(resp.distances, vec![0.25, 0.5]);
    }

    #[test]
    fn test_flatten_empty_payload() {
        let payload: QueryPayload =
            serde_json::from_value(serde_json::json!({ "ids": [[]] })).unwrap();
        assert_eq!(flatten_query(payload), QueryResponse::default());
    }

    #[test]
    fn test_new_requires_url() {
        let config = VectorConfig::default();
        let embedder = Arc::new(crate::embedding::HashingEmbedder::new(8));
        assert!(ChromaEngine::new(&config, embedder).is_err());
    }
}
