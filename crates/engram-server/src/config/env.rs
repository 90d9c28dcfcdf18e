// crates/engram-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use super::{
    AttachmentConfig, Config, EncryptionConfig, EpisodicConfig, IndexerConfig, MemoryClearMode,
    PartialPersistence, ProviderSelection, ResumeConfig, SearchMergeMode,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Read an env var, filtering empty values.
pub fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a boolean env var ("1", "true", "yes" are truthy).
pub fn parse_bool_env(name: &str) -> Option<bool> {
    read_env(name).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn read_secs(name: &str) -> Option<Duration> {
    read_env(name)?.parse::<u64>().ok().map(Duration::from_secs)
}

fn read_usize(name: &str) -> Option<usize> {
    read_env(name)?.parse::<usize>().ok()
}

fn read_u64(name: &str) -> Option<u64> {
    read_env(name)?.parse::<u64>().ok()
}

fn read_csv(name: &str) -> Vec<String> {
    read_env(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Collect per-client API keys from `ENGRAM_API_KEYS_{CLIENT_ID}=csv`.
///
/// The client id portion of the variable name is lowercased, matching how
/// clients present themselves on the wire.
pub fn scan_api_keys() -> HashMap<String, Vec<String>> {
    const PREFIX: &str = "ENGRAM_API_KEYS_";
    let mut keys = HashMap::new();
    for (name, value) in std::env::vars() {
        if let Some(client) = name.strip_prefix(PREFIX) {
            let parsed: Vec<String> = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if parsed.is_empty() {
                warn!(client = %client, "API key variable present but empty, ignoring");
                continue;
            }
            keys.insert(client.to_lowercase(), parsed);
        }
    }
    if keys.is_empty() {
        debug!("no per-client API keys configured");
    } else {
        debug!(clients = keys.len(), "loaded per-client API keys");
    }
    keys
}

/// Assemble the full configuration from the environment.
pub fn load() -> Config {
    let defaults = Config::default();

    let providers = ProviderSelection {
        store: read_env("ENGRAM_STORE").unwrap_or(defaults.providers.store),
        cache: read_env("ENGRAM_CACHE").unwrap_or(defaults.providers.cache),
        vector: read_env("ENGRAM_VECTOR").unwrap_or(defaults.providers.vector),
        embed: read_env("ENGRAM_EMBED").unwrap_or(defaults.providers.embed),
        encrypt: {
            let chain = read_csv("ENGRAM_ENCRYPT");
            if chain.is_empty() { defaults.providers.encrypt } else { chain }
        },
        attach: read_env("ENGRAM_ATTACH").unwrap_or(defaults.providers.attach),
    };

    let memory_clear_mode = match read_env("ENGRAM_MEMORY_CLEAR_MODE").as_deref() {
        Some("tombstone") => MemoryClearMode::Tombstone,
        Some("empty-epoch") | None => MemoryClearMode::EmptyEpoch,
        Some(other) => {
            warn!("unknown ENGRAM_MEMORY_CLEAR_MODE={other:?}, using empty-epoch");
            MemoryClearMode::EmptyEpoch
        }
    };

    let partial_persistence = match read_env("ENGRAM_PERSIST_PARTIALS").as_deref() {
        Some("always") => PartialPersistence::Always,
        Some("final-only") | None => PartialPersistence::FinalOnly,
        Some(other) => {
            warn!("unknown ENGRAM_PERSIST_PARTIALS={other:?}, using final-only");
            PartialPersistence::FinalOnly
        }
    };

    let search_merge_mode = match read_env("ENGRAM_SEARCH_MERGE_MODE").as_deref() {
        Some("rank-merge") => SearchMergeMode::RankMerge,
        Some("fallback") | None => SearchMergeMode::Fallback,
        Some(other) => {
            warn!("unknown ENGRAM_SEARCH_MERGE_MODE={other:?}, using fallback");
            SearchMergeMode::Fallback
        }
    };

    let attachments_defaults = AttachmentConfig::default();
    let attachments = AttachmentConfig {
        dir: read_env("ENGRAM_ATTACHMENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(attachments_defaults.dir),
        max_bytes: read_u64("ENGRAM_ATTACHMENT_MAX_BYTES").unwrap_or(attachments_defaults.max_bytes),
        initial_ttl: read_secs("ENGRAM_ATTACHMENT_TTL_SECS")
            .unwrap_or(attachments_defaults.initial_ttl),
        max_ttl: read_secs("ENGRAM_ATTACHMENT_MAX_TTL_SECS")
            .unwrap_or(attachments_defaults.max_ttl),
    };

    let resume_defaults = ResumeConfig::default();
    let resume = ResumeConfig {
        dir: read_env("ENGRAM_RESUME_DIR").map(PathBuf::from).unwrap_or(resume_defaults.dir),
        retention: read_secs("ENGRAM_RESUME_RETENTION_SECS").unwrap_or(resume_defaults.retention),
        locator_ttl: read_secs("ENGRAM_LOCATOR_TTL_SECS").unwrap_or(resume_defaults.locator_ttl),
        refresh_interval: read_secs("ENGRAM_LOCATOR_REFRESH_SECS")
            .unwrap_or(resume_defaults.refresh_interval),
        poll_interval: resume_defaults.poll_interval,
        // Cap derived from the attachment maximum unless set explicitly
        max_recording_bytes: read_u64("ENGRAM_RECORDING_MAX_BYTES")
            .unwrap_or(attachments.max_bytes.saturating_mul(100)),
    };

    let episodic_defaults = EpisodicConfig::default();
    let episodic = EpisodicConfig {
        max_namespace_depth: read_usize("ENGRAM_NAMESPACE_MAX_DEPTH")
            .unwrap_or(episodic_defaults.max_namespace_depth),
        policy_script: read_env("ENGRAM_POLICY_SCRIPT").map(PathBuf::from),
    };

    let indexer_defaults = IndexerConfig::default();
    let indexer = IndexerConfig {
        tick: read_secs("ENGRAM_INDEXER_TICK_SECS").unwrap_or(indexer_defaults.tick),
        batch_size: read_usize("ENGRAM_INDEXER_BATCH_SIZE").unwrap_or(indexer_defaults.batch_size),
    };

    Config {
        db_path: read_env("ENGRAM_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
        bind: read_env("ENGRAM_BIND").unwrap_or(defaults.bind),
        advertised_address: read_env("ENGRAM_ADVERTISED_ADDRESS")
            .or_else(|| read_env("ENGRAM_BIND"))
            .unwrap_or(defaults.advertised_address),
        providers,
        encryption: EncryptionConfig {
            dek_keys: read_env("ENGRAM_DEK_KEYS"),
            kek_passphrase: read_env("ENGRAM_KEK_PASSPHRASE"),
        },
        resume,
        attachments,
        episodic,
        indexer,
        memory_clear_mode,
        partial_persistence,
        search_merge_mode,
        admin_users: read_csv("ENGRAM_ADMIN_USERS"),
        admin_clients: read_csv("ENGRAM_ADMIN_CLIENTS"),
        api_keys: scan_api_keys(),
        openai_api_key: read_env("ENGRAM_OPENAI_API_KEY").or_else(|| read_env("OPENAI_API_KEY")),
        ollama_host: read_env("ENGRAM_OLLAMA_HOST").or_else(|| read_env("OLLAMA_HOST")),
        embed_dimensions: read_usize("ENGRAM_EMBED_DIMENSIONS").unwrap_or(defaults.embed_dimensions),
    }
}
