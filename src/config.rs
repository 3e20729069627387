use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory of the file-backed document store. `None` keeps documents
    /// in memory for the lifetime of the process.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_data_path")]
    pub data_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            data_path: default_data_path(),
        }
    }
}

fn default_data_path() -> String {
    "data".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    crate::chunk::DEFAULT_MAX_CHARS
}
fn default_overlap_chars() -> usize {
    crate::chunk::DEFAULT_OVERLAP_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            url: None,
            collection: default_collection(),
            tenant: default_tenant(),
            database: default_database(),
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_engine() -> String {
    "memory".to_string()
}
fn default_collection() -> String {
    "research_sources".to_string()
}
fn default_tenant() -> String {
    "default_tenant".to_string()
}
fn default_database() -> String {
    "default_database".to_string()
}
fn default_batch_size() -> usize {
    crate::vector::DEFAULT_BATCH_SIZE
}
fn default_batch_delay_ms() -> u64 {
    crate::vector::DEFAULT_BATCH_DELAY.as_millis() as u64
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_openai_base_url(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: default_rescan_interval_secs(),
            activity_window_secs: default_activity_window_secs(),
        }
    }
}

fn default_rescan_interval_secs() -> u64 {
    30
}
fn default_activity_window_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_text_results")]
    pub max_text_results: usize,
    #[serde(default = "default_max_csv_results")]
    pub max_csv_results: usize,
    /// Base URL of a running `nrag serve`; when set, text search goes over
    /// HTTP instead of the local vector index.
    #[serde(default)]
    pub search_url: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_text_results: default_max_text_results(),
            max_csv_results: default_max_csv_results(),
            search_url: None,
        }
    }
}

fn default_max_text_results() -> usize {
    5
}
fn default_max_csv_results() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// In-memory configuration: memory store, memory vector engine,
    /// hashing embedder and no inter-batch delay.
    pub fn minimal() -> Self {
        Self {
            store: StoreConfig::default(),
            chunking: ChunkingConfig::default(),
            vector: VectorConfig {
                batch_delay_ms: 0,
                ..VectorConfig::default()
            },
            embedding: EmbeddingConfig::default(),
            watch: WatchConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn chunk_params(&self) -> crate::chunk::ChunkParams {
        crate::chunk::ChunkParams {
            max_chars: self.chunking.max_chars,
            overlap_chars: self.chunking.overlap_chars,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    // Validate vector
    if config.vector.batch_size == 0 {
        anyhow::bail!("vector.batch_size must be > 0");
    }
    match config.vector.engine.as_str() {
        "memory" => {}
        "chroma" => {
            if config.vector.url.is_none() {
                anyhow::bail!("vector.url must be specified when engine is 'chroma'");
            }
        }
        other => anyhow::bail!(
            "Unknown vector engine: '{}'. Must be memory or chroma.",
            other
        ),
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" => {
            if config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0");
            }
        }
        "openai" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing or openai.",
            other
        ),
    }

    // Validate watch
    if config.watch.rescan_interval_secs == 0 {
        anyhow::bail!("watch.rescan_interval_secs must be > 0");
    }

    // Validate llm
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
