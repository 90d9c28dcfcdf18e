// crates/engram-server/src/registry/mod.rs
// Name-keyed provider registries resolved once at startup
//
// Each backend kind (store, cache, vector, embed, encrypt, attach) has a
// registry of string-keyed loaders. Startup reads the configured name per
// registry and invokes the loader; an unknown name is a startup failure
// whose message lists the registered names. Providers needing async
// initialization (the wrapped encryption provider, the vector index's
// table setup) return a spec that startup finishes wiring.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{ByteCache, MokaCache, NoCache};
use crate::config::Config;
use crate::crypto::{DekProvider, PlainProvider, Provider};
use crate::error::{EngramError, Result};

type Loader<T> = Box<dyn Fn(&Config) -> Result<T> + Send + Sync>;

/// A registry for one backend kind. BTreeMap keeps `names()` stable for
/// help output.
pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<&'static str, Loader<T>>,
}

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, entries: BTreeMap::new() }
    }

    pub fn register<F>(&mut self, name: &'static str, loader: F)
    where
        F: Fn(&Config) -> Result<T> + Send + Sync + 'static,
    {
        self.entries.insert(name, Box::new(loader));
    }

    /// Registered provider names, for help and error output.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Resolve and invoke the loader for `name`.
    pub fn load(&self, name: &str, config: &Config) -> Result<T> {
        match self.entries.get(name) {
            Some(loader) => loader(config),
            None => Err(EngramError::Config(format!(
                "unknown {} provider {name:?}; registered: {}",
                self.kind,
                self.names().join(", ")
            ))),
        }
    }
}

/// How the store backend opens (finished asynchronously at startup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    SqliteFile,
    SqliteMemory,
}

/// How the vector index is built once the pool and embedder exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorSpec {
    SqliteVec,
    None,
}

/// Which embedding backend to construct (credentials checked at build).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedSpec {
    Auto,
    OpenAi,
    Ollama,
    None,
}

/// One link of the encryption chain. `Wrapped` finishes loading its DEKs
/// from the store asynchronously.
pub enum EncryptSpec {
    Ready(Arc<dyn Provider>),
    Wrapped,
}

impl std::fmt::Debug for EncryptSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptSpec::Ready(p) => f.debug_tuple("Ready").field(&p.id()).finish(),
            EncryptSpec::Wrapped => write!(f, "Wrapped"),
        }
    }
}

/// How attachment bytes are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachSpec {
    Fs,
}

pub fn store_registry() -> Registry<StoreSpec> {
    let mut registry = Registry::new("store");
    registry.register("sqlite", |_| Ok(StoreSpec::SqliteFile));
    registry.register("sqlite-memory", |_| Ok(StoreSpec::SqliteMemory));
    registry
}

pub fn cache_registry() -> Registry<Arc<dyn ByteCache>> {
    let mut registry = Registry::new("cache");
    registry.register("moka", |_| Ok(Arc::new(MokaCache::new(10_000)) as Arc<dyn ByteCache>));
    registry.register("none", |_| Ok(Arc::new(NoCache) as Arc<dyn ByteCache>));
    registry
}

pub fn vector_registry() -> Registry<VectorSpec> {
    let mut registry = Registry::new("vector");
    registry.register("sqlite-vec", |_| Ok(VectorSpec::SqliteVec));
    registry.register("none", |_| Ok(VectorSpec::None));
    registry
}

pub fn embed_registry() -> Registry<EmbedSpec> {
    let mut registry = Registry::new("embed");
    registry.register("auto", |_| Ok(EmbedSpec::Auto));
    registry.register("openai", |config| {
        if config.openai_api_key.is_none() {
            return Err(EngramError::Config(
                "embed provider 'openai' requires ENGRAM_OPENAI_API_KEY".to_string(),
            ));
        }
        Ok(EmbedSpec::OpenAi)
    });
    registry.register("ollama", |config| {
        if config.ollama_host.is_none() {
            return Err(EngramError::Config(
                "embed provider 'ollama' requires ENGRAM_OLLAMA_HOST".to_string(),
            ));
        }
        Ok(EmbedSpec::Ollama)
    });
    registry.register("none", |_| Ok(EmbedSpec::None));
    registry
}

pub fn encrypt_registry() -> Registry<EncryptSpec> {
    let mut registry = Registry::new("encrypt");
    registry.register("plain", |_| Ok(EncryptSpec::Ready(Arc::new(PlainProvider))));
    registry.register("dek", |config| {
        let csv = config.encryption.dek_keys.as_deref().ok_or_else(|| {
            EngramError::Config("encrypt provider 'dek' requires ENGRAM_DEK_KEYS".to_string())
        })?;
        Ok(EncryptSpec::Ready(Arc::new(DekProvider::from_csv(csv)?)))
    });
    registry.register("wrapped", |config| {
        if config.encryption.kek_passphrase.is_none() {
            return Err(EngramError::Config(
                "encrypt provider 'wrapped' requires ENGRAM_KEK_PASSPHRASE".to_string(),
            ));
        }
        Ok(EncryptSpec::Wrapped)
    });
    registry
}

pub fn attach_registry() -> Registry<AttachSpec> {
    let mut registry = Registry::new("attach");
    registry.register("fs", |_| Ok(AttachSpec::Fs));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_lists_registered() {
        let registry = store_registry();
        let err = registry.load("postgres", &Config::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("postgres"));
        assert!(message.contains("sqlite"));
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(cache_registry().names(), vec!["moka", "none"]);
        assert_eq!(encrypt_registry().names(), vec!["dek", "plain", "wrapped"]);
    }

    #[test]
    fn test_dek_loader_requires_keys() {
        let registry = encrypt_registry();
        let err = registry.load("dek", &Config::default()).unwrap_err();
        assert!(matches!(err, EngramError::Config(_)));

        let mut config = Config::default();
        config.encryption.dek_keys = Some(hex::encode([1u8; 32]));
        assert!(registry.load("dek", &config).is_ok());
    }
}
