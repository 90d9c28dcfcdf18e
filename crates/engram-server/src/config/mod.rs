// crates/engram-server/src/config/mod.rs
// Configuration - assembled from environment with CLI overrides

mod env;

pub use env::{parse_bool_env, read_env, scan_api_keys};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Which provider implementation each registry resolves at startup.
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub store: String,
    pub cache: String,
    pub vector: String,
    pub embed: String,
    /// Ordered CSV chain; the first entry encrypts, the rest decrypt.
    pub encrypt: Vec<String>,
    pub attach: String,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self {
            store: "sqlite".to_string(),
            cache: "moka".to_string(),
            vector: "sqlite-vec".to_string(),
            embed: "auto".to_string(),
            encrypt: vec!["plain".to_string()],
            attach: "fs".to_string(),
        }
    }
}

/// Key material configuration for the encryption providers.
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// CSV of 32-byte keys (hex or base64) for the `dek` provider; first
    /// is primary, the rest are legacy decrypt-only.
    pub dek_keys: Option<String>,
    /// Passphrase for the local KEK wrapper backing the `wrapped` provider.
    pub kek_passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResumeConfig {
    /// Directory holding per-conversation recording files.
    pub dir: PathBuf,
    /// How long completed recordings stay replayable.
    pub retention: Duration,
    /// Locator row TTL in the shared store.
    pub locator_ttl: Duration,
    /// Owner refresh cadence (must be < locator_ttl).
    pub refresh_interval: Duration,
    /// Tail-reader poll interval.
    pub poll_interval: Duration,
    /// Recording size cap; exceeding it truncates with a recorded error.
    pub max_recording_bytes: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir(),
            retention: Duration::from_secs(30 * 60),
            locator_ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            max_recording_bytes: 25 * 1024 * 1024 * 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    /// TTL granted at creation, before the upload completes.
    pub initial_ttl: Duration,
    /// Ceiling for TTL refreshes while still unlinked.
    pub max_ttl: Duration,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("attachments"),
            max_bytes: 25 * 1024 * 1024,
            initial_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodicConfig {
    pub max_namespace_depth: usize,
    /// Custom rhai policy bundle; None uses the built-in default bundle.
    pub policy_script: Option<PathBuf>,
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self { max_namespace_depth: 16, policy_script: None }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub tick: Duration,
    pub batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { tick: Duration::from_secs(10), batch_size: 32 }
    }
}

/// What ChatMemory `clear()` maps to (open question surfaced as config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryClearMode {
    /// A sync with zero entries allocates a new empty epoch.
    #[default]
    EmptyEpoch,
    /// A single zero-block MEMORY entry marks the cleared epoch.
    Tombstone,
}

/// Whether streaming partials hit the store before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialPersistence {
    /// Only the final materialized entry is persisted.
    #[default]
    FinalOnly,
    /// The running buffer is also flushed into the entry row as it grows.
    Always,
}

/// Relationship between semantic and full-text search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMergeMode {
    /// Semantic first; full-text only when semantic yields nothing.
    #[default]
    Fallback,
    /// Interleave both result sets by normalized score.
    RankMerge,
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: String,
    /// Externally advertised `host:port`, written into stream locators.
    pub advertised_address: String,
    pub providers: ProviderSelection,
    pub encryption: EncryptionConfig,
    pub resume: ResumeConfig,
    pub attachments: AttachmentConfig,
    pub episodic: EpisodicConfig,
    pub indexer: IndexerConfig,
    pub memory_clear_mode: MemoryClearMode,
    pub partial_persistence: PartialPersistence,
    pub search_merge_mode: SearchMergeMode,
    /// Static allow-lists mapping principals to the admin role.
    pub admin_users: Vec<String>,
    pub admin_clients: Vec<String>,
    /// client_id -> accepted API keys, from ENGRAM_API_KEYS_{CLIENT_ID}.
    pub api_keys: HashMap<String, Vec<String>>,
    /// Embedding provider credentials.
    pub openai_api_key: Option<String>,
    pub ollama_host: Option<String>,
    pub embed_dimensions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("engram.db"),
            bind: "127.0.0.1:8080".to_string(),
            advertised_address: "127.0.0.1:8080".to_string(),
            providers: ProviderSelection::default(),
            encryption: EncryptionConfig::default(),
            resume: ResumeConfig::default(),
            attachments: AttachmentConfig::default(),
            episodic: EpisodicConfig::default(),
            indexer: IndexerConfig::default(),
            memory_clear_mode: MemoryClearMode::default(),
            partial_persistence: PartialPersistence::default(),
            search_merge_mode: SearchMergeMode::default(),
            admin_users: Vec::new(),
            admin_clients: Vec::new(),
            api_keys: HashMap::new(),
            openai_api_key: None,
            ollama_host: None,
            embed_dimensions: 1536,
        }
    }
}

impl Config {
    /// Load configuration from the environment (single source of truth).
    pub fn from_env() -> Self {
        env::load()
    }

    /// Split an advertised `host:port` into its parts.
    pub fn advertised_host_port(&self) -> (String, u16) {
        split_host_port(&self.advertised_address)
    }
}

/// Parse `host:port`, defaulting the port to 8080 when absent.
pub fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (addr.to_string(), 8080),
        },
        None => (addr.to_string(), 8080),
    }
}
