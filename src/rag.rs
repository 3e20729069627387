//! Retrieval merger and RAG prompt assembly.
//!
//! [`RagAssembler::query_relevant_sources`] runs a text similarity search
//! and a tabular query side by side and renders both into one context
//! string. Each backend is optional and failure-tolerant: an error from
//! one is logged and treated as "no results", so a chat turn is never
//! blocked by a single outage.
//!
//! # Context format
//!
//! ```text
//! Source 1 - {title} ({type}):
//! {chunk text}
//!
//! Source 2 - {title} (csv):
//! Found {n} relevant rows:
//! • {header}: {value}, {header}: {value}
//! • …
//! ... and {n - 2} more rows
//! ```
//!
//! When neither backend returns anything the context is exactly
//! [`NO_SOURCES_CONTEXT`], a valid non-error state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::llm::{ChatMessage, ChatProvider};
use crate::models::SearchHit;
use crate::tabular::{format_row, ColumnQuery, TabularIndex, TabularMatch};
use crate::vector::VectorIndex;

/// Context used when no backend returned anything.
pub const NO_SOURCES_CONTEXT: &str = "No relevant sources found for this query.";

/// Prefix of the assistant reply when a chat turn fails.
pub const ERROR_REPLY_PREFIX: &str = "Sorry, I encountered an error: ";

/// Example rows rendered per CSV match.
const CSV_EXAMPLE_ROWS: usize = 2;

const SYSTEM_PROMPT: &str = "You are a research assistant helping the user work with the \
sources attached to their notes. Answer using the sources below. Cite sources by their \
number when you rely on them. If the sources do not contain the answer, say so plainly \
instead of guessing.";

/// Similarity search over chunk text.
#[async_trait]
pub trait TextSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>>;
}

#[async_trait]
impl TextSearch for VectorIndex {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        VectorIndex::search(self, query, max_results).await
    }
}

/// Request body of `POST /search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// Response body of `POST /search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

/// [`TextSearch`] against a running `nrag serve` over HTTP, for processes
/// that query but do not index.
pub struct RemoteSearch {
    client: reqwest::Client,
    url: String,
}

impl RemoteSearch {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/search", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TextSearch for RemoteSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&SearchRequest {
                query: query.to_string(),
                max_results: Some(max_results),
            })
            .send()
            .await
            .with_context(|| format!("search request to {} failed", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("search error {}: {}", status, body);
        }
        let parsed: SearchResponse = resp.json().await?;
        Ok(parsed.results)
    }
}

/// Knobs for [`RagAssembler::query_relevant_sources`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalOptions {
    pub max_text_results: usize,
    pub max_csv_results: usize,
    pub include_text: bool,
    pub include_csv: bool,
    /// Column-scoped query (`"<column> contains <value>"`) merged with the
    /// keyword results. When unset, the query itself is used if it parses
    /// as one.
    pub csv_query: Option<String>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_text_results: 5,
            max_csv_results: 3,
            include_text: true,
            include_csv: true,
            csv_query: None,
        }
    }
}

impl RetrievalOptions {
    pub fn from_config(config: &crate::config::RetrievalConfig) -> Self {
        Self {
            max_text_results: config.max_text_results,
            max_csv_results: config.max_csv_results,
            ..Self::default()
        }
    }
}

/// Merged retrieval output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub text_results: Vec<SearchHit>,
    pub csv_results: Vec<TabularMatch>,
    pub context: String,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.text_results.is_empty() && self.csv_results.is_empty()
    }
}

/// Render merged results into the prompt context.
pub fn format_context(text: &[SearchHit], csv: &[TabularMatch]) -> String {
    if text.is_empty() && csv.is_empty() {
        return NO_SOURCES_CONTEXT.to_string();
    }

    let mut out = String::new();
    let mut n = 1;
    for hit in text {
        out.push_str(&format!(
            "Source {} - {} ({}):\n{}\n\n",
            n, hit.metadata.title, hit.metadata.source_type, hit.content
        ));
        n += 1;
    }
    for m in csv {
        out.push_str(&format!("Source {} - {} (csv):\n", n, m.title));
        out.push_str(&summarize_csv_match(m));
        out.push_str("\n\n");
        n += 1;
    }
    out
}

/// `"Found {n} relevant rows:"` plus up to two example rows and a remainder.
pub fn summarize_csv_match(m: &TabularMatch) -> String {
    let mut out = format!("Found {} relevant rows:", m.match_count);
    for row in m.rows.iter().take(CSV_EXAMPLE_ROWS) {
        out.push_str("\n• ");
        out.push_str(&format_row(&m.headers, row));
    }
    if m.match_count > CSV_EXAMPLE_ROWS {
        out.push_str(&format!(
            "\n... and {} more rows",
            m.match_count - CSV_EXAMPLE_ROWS
        ));
    }
    out
}

/// System prompt, optional note scope and the user's query.
pub fn build_messages(query: &str, context: &str, note_scope: Option<&str>) -> Vec<ChatMessage> {
    let mut system = String::from(SYSTEM_PROMPT);
    if let Some(scope) = note_scope.map(str::trim).filter(|s| !s.is_empty()) {
        system.push_str("\n\nThe user is working in this note:\n");
        system.push_str(scope);
    }
    system.push_str("\n\nRelevant sources:\n");
    system.push_str(context);

    vec![ChatMessage::system(system), ChatMessage::user(query)]
}

pub struct RagAssembler {
    text: Option<Arc<dyn TextSearch>>,
    tabular: Arc<TabularIndex>,
    chat: Option<Arc<dyn ChatProvider>>,
    defaults: RetrievalOptions,
}

impl RagAssembler {
    pub fn new(text: Option<Arc<dyn TextSearch>>, tabular: Arc<TabularIndex>) -> Self {
        Self {
            text,
            tabular,
            chat: None,
            defaults: RetrievalOptions::default(),
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatProvider>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_defaults(mut self, defaults: RetrievalOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &RetrievalOptions {
        &self.defaults
    }

    /// Run both backends concurrently and merge their results.
    pub async fn query_relevant_sources(
        &self,
        query: &str,
        options: &RetrievalOptions,
    ) -> RetrievalResult {
        let text_fut = async {
            let Some(text) = self.text.as_ref().filter(|_| options.include_text) else {
                return Vec::new();
            };
            match text.search(query, options.max_text_results).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "text search failed, continuing without it");
                    Vec::new()
                }
            }
        };

        let csv_fut = async {
            if !options.include_csv {
                return Vec::new();
            }
            let column_query = options.csv_query.as_deref().or_else(|| {
                ColumnQuery::parse(query).map(|_| query)
            });
            self.tabular
                .query(query, column_query, options.max_csv_results)
        };

        let (text_results, csv_results) = tokio::join!(text_fut, csv_fut);
        let context = format_context(&text_results, &csv_results);
        tracing::debug!(
            text = text_results.len(),
            csv = csv_results.len(),
            "merged retrieval results"
        );

        RetrievalResult {
            text_results,
            csv_results,
            context,
        }
    }

    async fn prepare(&self, query: &str, note_scope: Option<&str>) -> Vec<ChatMessage> {
        let retrieved = self.query_relevant_sources(query, &self.defaults).await;
        build_messages(query, &retrieved.context, note_scope)
    }

    fn chat(&self) -> Result<&Arc<dyn ChatProvider>> {
        self.chat
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no chat model configured"))
    }

    /// Answer `query` in one piece. Failures become the assistant's reply.
    pub async fn answer(&self, query: &str, note_scope: Option<&str>) -> String {
        let messages = self.prepare(query, note_scope).await;
        let result = match self.chat() {
            Ok(chat) => chat.complete(&messages).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "chat completion failed");
                format!("{}{:#}", ERROR_REPLY_PREFIX, e)
            }
        }
    }

    /// Answer `query` as a stream of text fragments. A failure ends the
    /// stream with an error fragment. Dropping the receiver cancels the
    /// upstream request.
    pub async fn answer_stream(
        &self,
        query: &str,
        note_scope: Option<&str>,
    ) -> mpsc::Receiver<String> {
        let messages = self.prepare(query, note_scope).await;
        let (tx, rx) = mpsc::channel(32);

        let upstream = match self.chat() {
            Ok(chat) => chat.stream(&messages).await,
            Err(e) => Err(e),
        };
        let mut upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "chat stream failed to start");
                let _ = tx.send(format!("{}{:#}", ERROR_REPLY_PREFIX, e)).await;
                return rx;
            }
        };

        tokio::spawn(async move {
            while let Some(item) = upstream.recv().await {
                let fragment = match item {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %format!("{:#}", e), "chat stream broke");
                        let _ = tx
                            .send(format!("\n\n{}{:#}", ERROR_REPLY_PREFIX, e))
                            .await;
                        return;
                    }
                };
                if tx.send(fragment).await.is_err() {
                    return;
                }
            }
        });

        rx
    }
}
