// crates/engram-server/src/cli/mod.rs
// Command-line interface: serve and migrate

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use engram::background;
use engram::authz::policy::PolicyBundle;
use engram::cache::ByteCache;
use engram::config::Config;
use engram::convo::{AttachmentService, ConversationService, FsAttachmentSink};
use engram::crypto::{LocalKeyWrapper, Provider, ProviderChain, WrappedDekProvider};
use engram::db::pool::DatabasePool;
use engram::embeddings::EmbeddingClient;
use engram::episodic::EpisodicEngine;
use engram::registry::{self, AttachSpec, EncryptSpec, StoreSpec, VectorSpec};
use engram::resume::Resumer;
use engram::search::{FullTextIndex, SqliteVectorIndex};
use engram::web::state::{AppState, ProviderInfo};

#[derive(Parser)]
#[command(name = "engram", about = "Persistent conversation memory for AI agents", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server
    Serve(ServeArgs),
    /// Run store migrations and exit
    Migrate(MigrateArgs),
}

#[derive(Args, Default)]
pub struct ServeArgs {
    /// SQLite database path
    #[arg(long, env = "ENGRAM_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(long, env = "ENGRAM_BIND")]
    pub bind: Option<String>,

    /// Externally advertised address written into stream locators
    #[arg(long, env = "ENGRAM_ADVERTISED_ADDRESS")]
    pub advertised_address: Option<String>,

    /// Store provider
    #[arg(long, env = "ENGRAM_STORE")]
    pub store: Option<String>,

    /// Cache provider
    #[arg(long, env = "ENGRAM_CACHE")]
    pub cache: Option<String>,

    /// Vector index provider
    #[arg(long, env = "ENGRAM_VECTOR")]
    pub vector: Option<String>,

    /// Embedding provider
    #[arg(long, env = "ENGRAM_EMBED")]
    pub embed: Option<String>,

    /// Encryption chain, CSV ordered primary-first
    #[arg(long, env = "ENGRAM_ENCRYPT")]
    pub encrypt: Option<String>,

    /// Attachment sink provider
    #[arg(long, env = "ENGRAM_ATTACH")]
    pub attach: Option<String>,

    /// Custom rhai policy bundle path
    #[arg(long, env = "ENGRAM_POLICY_SCRIPT")]
    pub policy_script: Option<PathBuf>,

    /// List registered providers per registry and exit
    #[arg(long)]
    pub list_providers: bool,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.db_path {
            config.db_path = path.clone();
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(address) = &self.advertised_address {
            config.advertised_address = address.clone();
        }
        if let Some(store) = &self.store {
            config.providers.store = store.clone();
        }
        if let Some(cache) = &self.cache {
            config.providers.cache = cache.clone();
        }
        if let Some(vector) = &self.vector {
            config.providers.vector = vector.clone();
        }
        if let Some(embed) = &self.embed {
            config.providers.embed = embed.clone();
        }
        if let Some(encrypt) = &self.encrypt {
            config.providers.encrypt = encrypt
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(attach) = &self.attach {
            config.providers.attach = attach.clone();
        }
        if let Some(script) = &self.policy_script {
            config.episodic.policy_script = Some(script.clone());
        }
    }
}

#[derive(Args)]
pub struct MigrateArgs {
    /// SQLite database path
    #[arg(long, env = "ENGRAM_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

fn print_providers() {
    println!("store:   {}", registry::store_registry().names().join(", "));
    println!("cache:   {}", registry::cache_registry().names().join(", "));
    println!("vector:  {}", registry::vector_registry().names().join(", "));
    println!("embed:   {}", registry::embed_registry().names().join(", "));
    println!("encrypt: {}", registry::encrypt_registry().names().join(", "));
    println!("attach:  {}", registry::attach_registry().names().join(", "));
}

/// Build every provider from configuration and run the server until
/// shutdown.
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    if args.list_providers {
        print_providers();
        return Ok(());
    }

    let mut config = Config::from_env();
    args.apply(&mut config);
    let config = Arc::new(config);

    // Store
    let store_spec = registry::store_registry().load(&config.providers.store, &config)?;
    let pool = Arc::new(match store_spec {
        StoreSpec::SqliteFile => DatabasePool::open(&config.db_path).await?,
        StoreSpec::SqliteMemory => DatabasePool::open_in_memory().await?,
    });

    // Cache
    let cache: Arc<dyn ByteCache> =
        registry::cache_registry().load(&config.providers.cache, &config)?;

    // Encryption chain, primary first
    let mut chain_providers: Vec<Arc<dyn Provider>> = Vec::new();
    let encrypt_registry = registry::encrypt_registry();
    for name in &config.providers.encrypt {
        match encrypt_registry.load(name, &config)? {
            EncryptSpec::Ready(provider) => chain_providers.push(provider),
            EncryptSpec::Wrapped => {
                let passphrase = config
                    .encryption
                    .kek_passphrase
                    .as_deref()
                    .unwrap_or_default();
                let wrapper = Arc::new(LocalKeyWrapper::from_passphrase(passphrase));
                chain_providers
                    .push(Arc::new(WrappedDekProvider::load(&pool, wrapper).await?));
            }
        }
    }
    let chain = Arc::new(ProviderChain::new(chain_providers)?);
    tracing::info!(primary = chain.primary_id(), "encryption chain ready");

    // Embeddings and indices (registry validates the name and its
    // credentials; the client constructor does the wiring)
    registry::embed_registry().load(&config.providers.embed, &config)?;
    let embedder = EmbeddingClient::from_config(&config)?.map(Arc::new);
    let vector = match registry::vector_registry().load(&config.providers.vector, &config)? {
        VectorSpec::SqliteVec => {
            let dimensions = embedder
                .as_ref()
                .map(|e| e.dimensions())
                .unwrap_or(config.embed_dimensions);
            let model = embedder
                .as_ref()
                .map(|e| e.model_name())
                .unwrap_or_else(|| "unconfigured".to_string());
            Some(Arc::new(
                SqliteVectorIndex::new(pool.clone(), dimensions, model).await?,
            ))
        }
        VectorSpec::None => None,
    };
    let fulltext = Some(Arc::new(FullTextIndex::new(pool.clone())));

    // Attachments
    let sink = match registry::attach_registry().load(&config.providers.attach, &config)? {
        AttachSpec::Fs => Arc::new(FsAttachmentSink::new(config.attachments.dir.clone())?),
    };
    let attachments = Arc::new(AttachmentService::new(
        pool.clone(),
        sink,
        chain.clone(),
        config.attachments.clone(),
    ));

    // Resumer and policy
    let resumer = Resumer::new(pool.clone(), config.resume.clone()).await?;
    let policy = Arc::new(PolicyBundle::load(config.episodic.policy_script.as_deref())?);

    let conversations = ConversationService::new(
        pool.clone(),
        cache.clone(),
        chain.clone(),
        vector.clone(),
        fulltext,
        embedder.clone(),
        resumer.clone(),
        config.clone(),
    );
    let episodic = Arc::new(EpisodicEngine::new(
        pool.clone(),
        chain.clone(),
        policy,
        vector.clone(),
        embedder.clone(),
        config.episodic.max_namespace_depth,
    ));

    let shutdown_tx = background::spawn(
        pool.clone(),
        conversations.clone(),
        episodic.clone(),
        attachments.clone(),
        resumer.clone(),
        config.indexer.clone(),
    );

    let providers = Arc::new(ProviderInfo {
        store: config.providers.store.clone(),
        cache: cache.id().to_string(),
        vector: config.providers.vector.clone(),
        embed: embedder
            .as_ref()
            .map(|e| e.provider_id().to_string())
            .unwrap_or_else(|| "none".to_string()),
        encrypt: config.providers.encrypt.clone(),
        attach: config.providers.attach.clone(),
    });

    let state = AppState {
        conversations,
        episodic,
        attachments,
        resumer,
        config: config.clone(),
        providers,
    };
    let router = engram::web::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, advertised = %config.advertised_address, "engram listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    tracing::info!("engram stopped");
    Ok(())
}

/// Run migrations against the configured store and exit.
pub async fn run_migrate(args: MigrateArgs) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(path) = args.db_path {
        config.db_path = path;
    }
    // Opening the pool runs all migrations
    let pool = DatabasePool::open(&config.db_path).await?;
    pool.run_migrations().await?;
    println!("migrations complete: {}", config.db_path.display());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
    }
}
