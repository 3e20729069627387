//! Core data models used throughout the indexing and retrieval pipeline.
//!
//! These types represent the sources a user attaches to a note, the
//! documents that back them in the shared store, and the chunks and
//! search hits that flow between the indexes and the RAG assembler.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of content a source carries.
///
/// Parsed from the document's `metadata.type` string. Unrecognized
/// values (including saved chat transcripts, `"ai"`) are kept as
/// [`SourceType::Unknown`] so routing stays an exhaustive match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceType {
    Text,
    Pdf,
    Web,
    Csv,
    Unknown(String),
}

impl SourceType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => SourceType::Text,
            "pdf" => SourceType::Pdf,
            "web" => SourceType::Web,
            "csv" => SourceType::Csv,
            other => SourceType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SourceType::Text => "text",
            SourceType::Pdf => "pdf",
            SourceType::Web => "web",
            SourceType::Csv => "csv",
            SourceType::Unknown(raw) => raw,
        }
    }

    /// Which index a source of this type is routed to.
    pub fn index_kind(&self) -> IndexKind {
        match self {
            SourceType::Csv => IndexKind::Tabular,
            SourceType::Text | SourceType::Pdf | SourceType::Web | SourceType::Unknown(_) => {
                IndexKind::Vector
            }
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two retrieval backends a source can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Vector,
    Tabular,
}

/// User-visible reference to ingestible content attached to a note.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub title: String,
    pub path: String,
    pub note_id: Option<String>,
    pub source_type: SourceType,
    pub created_at: Option<DateTime<Utc>>,
}

impl Source {
    /// Build the source reference for a document read from `path`.
    ///
    /// The id comes from `metadata.sourceId` and falls back to the last
    /// path segment.
    pub fn from_document(path: &str, doc: &SourceDocument) -> Self {
        let id = doc
            .metadata
            .source_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| path_leaf(path).to_string());

        Source {
            id,
            title: doc.title.clone(),
            path: path.to_string(),
            note_id: doc.metadata.note_id.clone(),
            source_type: SourceType::parse(&doc.metadata.source_type),
            created_at: doc.metadata.created_at,
        }
    }
}

/// Last segment of a `/`-separated store path.
pub fn path_leaf(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Content record persisted in the shared document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_csv_content: Option<String>,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl SourceDocument {
    /// True when the document carries anything an index could consume.
    pub fn has_content(&self) -> bool {
        let present = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.content) || present(&self.raw_csv_content)
    }
}

/// `metadata` block of a [`SourceDocument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(rename = "type", default = "default_type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Any additional fields written by the UI layer.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            source_type: default_type(),
            source_id: None,
            note_id: None,
            created_at: None,
            extra: BTreeMap::new(),
        }
    }
}

fn default_type() -> String {
    "text".to_string()
}

/// Metadata stored alongside every chunk in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub source_id: String,
    pub source_type: String,
    pub chunk_index: usize,
    pub title: String,
}

/// A retrieval unit derived from a source's text.
///
/// Ids have the form `{source_id}_chunk_{n}` so re-chunking identical
/// content yields the identical id sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// A ranked chunk returned from a vector similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Similarity in `[0, 1]` for cosine-style engines (`1 − distance`).
    pub score: f64,
}
