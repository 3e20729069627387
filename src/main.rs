//! # Notes RAG CLI (`nrag`)
//!
//! The `nrag` binary adds sources to the document store, runs indexing
//! passes, queries both indexes and serves the HTTP API with the watch
//! loop running alongside it.
//!
//! ## Usage
//!
//! ```bash
//! nrag --config ./config/nrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nrag add <title> --type <t> --file <path>` | Store a new source document |
//! | `nrag remove <source-id>` | Delete a source document and drop it from the indexes |
//! | `nrag index` | Run one indexing pass over the store |
//! | `nrag search "<query>"` | Semantic search over text sources |
//! | `nrag context "<query>"` | Print the merged text + CSV retrieval context |
//! | `nrag ask "<query>"` | Answer a question with retrieved context |
//! | `nrag status` | Print progress, indexed ids and index stats as JSON |
//! | `nrag serve` | Run the watch loop and the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Attach a CSV table and a text note
//! nrag add "Soil survey" --type csv --file survey.csv
//! nrag add "Field notes" --type text --file notes.txt --note lab-week-3
//!
//! # Column-scoped CSV lookup merged with semantic text hits
//! nrag context "site contains north"
//!
//! # Streamed answer with a note named in the system prompt
//! nrag ask "summarize the pH readings" --note-scope lab-week-3 --stream
//!
//! # Long-running service with JSON progress on stderr
//! nrag serve --progress json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use notes_rag::commands;
use notes_rag::config;
use notes_rag::pipeline::Pipeline;
use notes_rag::progress::ProgressMode;
use tracing_subscriber::EnvFilter;

/// Notes RAG CLI: source indexing and retrieval-augmented chat for
/// research notes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/nrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "nrag",
    about = "Notes RAG: source indexing and retrieval-augmented chat for research notes",
    version,
    long_about = "Notes RAG keeps a vector index and a CSV index in step with the sources \
    stored for your research notes, and answers questions with context merged from both."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/nrag.toml`. Store, chunking, vector, embedding,
    /// watch, retrieval, LLM and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/nrag.toml")]
    config: PathBuf,

    /// Indexing progress on stderr: `auto`, `human`, `json` or `off`.
    ///
    /// `auto` shows human-readable progress when stderr is a terminal.
    #[arg(long, global = true, default_value = "auto", value_parser = parse_progress)]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Store a new source document.
    ///
    /// Reads the file, assigns a fresh source id and writes the document
    /// under the configured data path. CSV files are stored as raw CSV for
    /// the tabular index; every other type is stored as text content.
    Add {
        /// Display title of the source.
        title: String,

        /// Source type: `text`, `pdf`, `web` or `csv`.
        #[arg(long = "type", default_value = "text")]
        source_type: String,

        /// File holding the source's text or CSV.
        #[arg(long)]
        file: PathBuf,

        /// Note the source belongs to.
        #[arg(long)]
        note: Option<String>,
    },

    /// Delete a source document and remove it from both indexes.
    Remove {
        /// Source id as printed by `nrag add`.
        source_id: String,
    },

    /// Run one indexing pass over the store and print a summary.
    ///
    /// Sources already present in their index are skipped, so this is
    /// cheap to repeat against a persistent vector engine.
    Index,

    /// Semantic search over indexed text sources.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Print the merged retrieval context for a query.
    ///
    /// Text hits come from the vector index, CSV matches from the tabular
    /// index. A query of the form `<column> contains <value>` is also run
    /// as a column query.
    Context {
        /// The query string.
        query: String,

        /// Only consult the vector index.
        #[arg(long, conflicts_with = "csv_only")]
        text_only: bool,

        /// Only consult the tabular index.
        #[arg(long)]
        csv_only: bool,
    },

    /// Answer a question using retrieved context and the configured chat model.
    Ask {
        /// The question.
        query: String,

        /// Note context added to the system prompt.
        #[arg(long)]
        note_scope: Option<String>,

        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Print progress, indexed source ids and index statistics as JSON.
    Status,

    /// Run the watch loop and the HTTP server until Ctrl-C.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

fn parse_progress(value: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(value)
        .ok_or_else(|| format!("invalid progress mode '{}': use auto, human, json or off", value))
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // One-shot commands keep stderr quiet unless RUST_LOG says otherwise.
    init_tracing(match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    });

    let cfg = config::load_config(&cli.config)?;
    let pipeline = Pipeline::from_config(&cfg, cli.progress.reporter())?;
    let data_path = cfg.store.data_path.as_str();

    match cli.command {
        Commands::Add {
            title,
            source_type,
            file,
            note,
        } => {
            commands::run_add(&pipeline, data_path, &title, &source_type, &file, note).await?;
        }
        Commands::Remove { source_id } => {
            commands::run_remove(&pipeline, data_path, &source_id).await?;
        }
        Commands::Index => {
            commands::run_index(&pipeline).await?;
        }
        Commands::Search { query, limit } => {
            commands::run_search(&pipeline, &query, limit).await?;
        }
        Commands::Context {
            query,
            text_only,
            csv_only,
        } => {
            let options = commands::context_options(pipeline.rag.defaults(), text_only, csv_only);
            commands::run_context(&pipeline, &query, &options).await?;
        }
        Commands::Ask {
            query,
            note_scope,
            stream,
        } => {
            commands::run_ask(&pipeline, &query, note_scope.as_deref(), stream).await?;
        }
        Commands::Status => {
            commands::run_status(&pipeline).await?;
        }
        Commands::Serve => {
            commands::run_serve(&pipeline, &cfg.server.bind).await?;
        }
    }

    Ok(())
}
