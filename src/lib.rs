//! # Notes RAG
//!
//! Source indexing and retrieval-augmented chat for research notes.
//!
//! Sources attached to a note (pasted text, extracted PDFs, web pages and
//! CSV files) live as JSON documents in a shared store. A watch loop keeps
//! two indexes in step with that store: prose is chunked and embedded into
//! a vector collection, CSV tables are parsed into an in-memory tabular
//! index. Queries fan out to both and the merged context is handed to a
//! chat model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Document     │──▶│ Watch loop   │──▶│ Vector index │ text/pdf/web
//! │ store        │   │ + progress   │   └──────┬───────┘
//! │ (fs/memory)  │   │              │──▶┌──────┴───────┐
//! └──────────────┘   └──────────────┘   │ Tabular index│ csv
//!                                       └──────┬───────┘
//!                       ┌──────────────────────┤
//!                       ▼                      ▼
//!                  ┌──────────┐          ┌──────────┐
//!                  │   CLI    │          │   HTTP   │
//!                  │  (nrag)  │          │  server  │
//!                  └──────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! nrag add "Field notes" --type text --file notes.txt
//! nrag add "Survey" --type csv --file survey.csv
//! nrag index                            # one indexing pass
//! nrag search "soil moisture"
//! nrag ask "what did the survey find?" --stream
//! nrag serve                            # watch loop + HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Vector index adapter and engines |
//! | [`tabular`] | In-memory CSV index and queries |
//! | [`store`] | Document store abstraction (filesystem, memory) |
//! | [`progress`] | Indexing progress tracking and reporting |
//! | [`watch`] | Source watch loop |
//! | [`llm`] | Chat-completion client |
//! | [`rag`] | Retrieval merger and answer assembly |
//! | [`pipeline`] | Component wiring from config |
//! | [`server`] | HTTP server |
//! | [`commands`] | `nrag` subcommand implementations |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod rag;
pub mod server;
pub mod store;
pub mod tabular;
pub mod vector;
pub mod watch;
