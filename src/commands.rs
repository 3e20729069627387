//! Implementations of the `nrag` subcommands.
//!
//! Every one-shot command runs against a fresh [`Pipeline`]. Commands that
//! read the indexes ([`run_search`], [`run_context`], [`run_ask`],
//! [`run_status`]) first bring them up to date with a single pass over the
//! store via [`prepare`], since the in-memory engines start empty in each
//! process.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::models::{DocumentMetadata, SourceDocument, SourceType};
use crate::pipeline::Pipeline;
use crate::progress::format_number;
use crate::rag::RetrievalOptions;
use crate::server::{run_server, AppState, StatusReport};
use crate::store::join_path;
use crate::watch::ScanSummary;

/// Seed the indexed sets and run one discovery pass.
pub async fn prepare(pipeline: &Pipeline) -> Result<ScanSummary> {
    pipeline.watcher.initialize().await;
    pipeline.watcher.rescan().await
}

/// `nrag index`
pub async fn run_index(pipeline: &Pipeline) -> Result<()> {
    let summary = prepare(pipeline).await?;
    println!("Index pass complete.");
    println!("  discovered: {}", format_number(summary.discovered as u64));
    println!("  queued:     {}", format_number(summary.queued as u64));
    println!("  indexed:    {}", format_number(summary.indexed as u64));
    println!("  skipped:    {}", format_number(summary.skipped as u64));
    println!("  failed:     {}", format_number(summary.failed as u64));
    if summary.failed > 0 {
        for id in pipeline.watcher.progress().failed {
            println!("    failed source: {}", id);
        }
    }
    Ok(())
}

/// `nrag search <query>`
pub async fn run_search(pipeline: &Pipeline, query: &str, limit: usize) -> Result<()> {
    prepare(pipeline).await?;
    let hits = pipeline.vector.search(query, limit).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.score,
            hit.metadata.source_type,
            hit.metadata.title
        );
        println!("    source: {}", hit.metadata.source_id);
        println!("    chunk: {}", hit.metadata.chunk_index);
        println!("    excerpt: \"{}\"", excerpt(&hit.content, 200));
        println!();
    }
    Ok(())
}

/// `nrag context <query>`
pub async fn run_context(
    pipeline: &Pipeline,
    query: &str,
    options: &RetrievalOptions,
) -> Result<()> {
    prepare(pipeline).await?;
    let result = pipeline.rag.query_relevant_sources(query, options).await;
    println!("{}", result.context);
    Ok(())
}

/// `nrag ask <query>`
pub async fn run_ask(
    pipeline: &Pipeline,
    query: &str,
    note_scope: Option<&str>,
    stream: bool,
) -> Result<()> {
    prepare(pipeline).await?;

    if !stream {
        println!("{}", pipeline.rag.answer(query, note_scope).await);
        return Ok(());
    }

    let mut rx = pipeline.rag.answer_stream(query, note_scope).await;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = rx.recv().await {
        write!(stdout, "{}", fragment)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

/// `nrag add <title> --type <type> --file <path>`
///
/// Writes a new source document under the data path and returns its id.
/// CSV files are stored as `rawCsvContent`, everything else as `content`.
pub async fn run_add(
    pipeline: &Pipeline,
    data_path: &str,
    title: &str,
    source_type: &str,
    file: &Path,
    note_id: Option<String>,
) -> Result<String> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if text.trim().is_empty() {
        bail!("{} is empty", file.display());
    }

    let id = uuid::Uuid::new_v4().to_string();
    let is_csv = SourceType::parse(source_type) == SourceType::Csv;
    let doc = SourceDocument {
        title: title.to_string(),
        content: (!is_csv).then(|| text.clone()),
        raw_csv_content: is_csv.then_some(text),
        metadata: DocumentMetadata {
            source_type: source_type.trim().to_ascii_lowercase(),
            source_id: Some(id.clone()),
            note_id,
            created_at: Some(Utc::now()),
            ..DocumentMetadata::default()
        },
    };

    let path = join_path(data_path, &id);
    pipeline.store.write_doc(&path, &doc).await?;
    tracing::info!(source_id = %id, path = %path, "added source document");
    println!("{}", id);
    Ok(id)
}

/// `nrag remove <source-id>`
pub async fn run_remove(pipeline: &Pipeline, data_path: &str, source_id: &str) -> Result<()> {
    pipeline.watcher.initialize().await;
    let existed = pipeline
        .store
        .remove_doc(&join_path(data_path, source_id))
        .await?;
    pipeline.watcher.remove_source(source_id).await?;

    if existed {
        println!("Removed {}", source_id);
    } else {
        println!("No document for {}; cleared it from the indexes.", source_id);
    }
    Ok(())
}

/// `nrag status`
pub async fn run_status(pipeline: &Pipeline) -> Result<()> {
    prepare(pipeline).await?;
    let report = StatusReport::collect(&pipeline.watcher).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// `nrag serve`: watch loop and HTTP server until Ctrl-C.
pub async fn run_serve(pipeline: &Pipeline, bind: &str) -> Result<()> {
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

    let watcher = pipeline.watcher.clone();
    let watch_task = tokio::spawn(watcher.run(async move {
        let _ = stop_rx.changed().await;
    }));

    let state = AppState {
        watcher: pipeline.watcher.clone(),
        rag: pipeline.rag.clone(),
    };
    let served = run_server(bind, state, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);
    })
    .await;

    // A server that failed to bind has dropped the sender, which stops the loop too.
    watch_task.await?;
    served
}

/// Retrieval options for `nrag context` overrides.
pub fn context_options(
    defaults: &RetrievalOptions,
    text_only: bool,
    csv_only: bool,
) -> RetrievalOptions {
    RetrievalOptions {
        include_text: defaults.include_text && !csv_only,
        include_csv: defaults.include_csv && !text_only,
        ..defaults.clone()
    }
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat.to_string(),
    }
}
