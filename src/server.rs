//! HTTP surface of `nrag serve`.
//!
//! Exposes indexing status, vector search, merged RAG context and chat as a
//! small JSON API. The watch loop runs in the same process; this module
//! only reads its state.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/status` | Progress snapshot, indexed ids and index stats |
//! | `POST` | `/search` | `{query, maxResults}` → ranked chunks |
//! | `POST` | `/context` | `{query, …options}` → merged retrieval context |
//! | `POST` | `/chat` | `{query, noteScope?, stream?}` → reply (JSON or chunked text) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser UI can
//! call the API directly.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::progress::ProgressSnapshot;
use crate::rag::{RagAssembler, RetrievalOptions, RetrievalResult, SearchRequest, SearchResponse};
use crate::vector::VectorStats;
use crate::watch::{IndexedIds, SourceWatcher};

/// Results returned by `/search` when the request names no limit.
const DEFAULT_SEARCH_RESULTS: usize = 5;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub watcher: Arc<SourceWatcher>,
    pub rag: Arc<RagAssembler>,
}

/// Build the router with all routes and CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/search", post(handle_search))
        .route("/context", post(handle_context))
        .route("/chat", post(handle_chat))
        .layer(cors)
        .with_state(state)
}

/// Bind `bind_addr` and serve until `shutdown` resolves.
pub async fn run_server(
    bind_addr: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");
    println!("nrag server listening on http://{}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 error from a backend failure.
fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

fn require_query(query: &str) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

#[derive(Debug, Serialize)]
pub struct TabularStats {
    pub sources: usize,
    pub rows: usize,
}

/// Body of `/status`, also printed by `nrag status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub progress: ProgressSnapshot,
    pub indexed: IndexedIds,
    /// `None` when the vector engine could not be reached.
    pub vector: Option<VectorStats>,
    pub tabular: TabularStats,
}

impl StatusReport {
    pub async fn collect(watcher: &SourceWatcher) -> Self {
        let vector = match watcher.vector_index().get_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "vector stats unavailable");
                None
            }
        };
        let tabular = watcher.tabular_index();

        Self {
            progress: watcher.progress(),
            indexed: watcher.indexed_ids(),
            vector,
            tabular: TabularStats {
                sources: tabular.get_all_sources().len(),
                rows: tabular.row_count(),
            },
        }
    }
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(StatusReport::collect(&state.watcher).await)
}

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    require_query(&req.query)?;
    let limit = req.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS);
    let results = state
        .watcher
        .vector_index()
        .search(&req.query, limit)
        .await
        .map_err(internal)?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /context ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextRequest {
    query: String,
    max_text_results: Option<usize>,
    max_csv_results: Option<usize>,
    include_text: Option<bool>,
    include_csv: Option<bool>,
    csv_query: Option<String>,
}

impl ContextRequest {
    fn options(&self, defaults: &RetrievalOptions) -> RetrievalOptions {
        RetrievalOptions {
            max_text_results: self.max_text_results.unwrap_or(defaults.max_text_results),
            max_csv_results: self.max_csv_results.unwrap_or(defaults.max_csv_results),
            include_text: self.include_text.unwrap_or(defaults.include_text),
            include_csv: self.include_csv.unwrap_or(defaults.include_csv),
            csv_query: self.csv_query.clone().or_else(|| defaults.csv_query.clone()),
        }
    }
}

async fn handle_context(
    State(state): State<AppState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<RetrievalResult>, AppError> {
    require_query(&req.query)?;
    let options = req.options(state.rag.defaults());
    Ok(Json(
        state.rag.query_relevant_sources(&req.query, &options).await,
    ))
}

// ============ POST /chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    query: String,
    #[serde(default)]
    note_scope: Option<String>,
    #[serde(default)]
    stream: bool,
}

#[derive(Serialize)]
struct ChatResponse {
    reply: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    require_query(&req.query)?;

    if !req.stream {
        let reply = state.rag.answer(&req.query, req.note_scope.as_deref()).await;
        return Ok(Json(ChatResponse { reply }).into_response());
    }

    let rx = state
        .rag
        .answer_stream(&req.query, req.note_scope.as_deref())
        .await;
    let body = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|fragment| (Ok::<_, std::convert::Infallible>(fragment), rx))
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
