//! Test utilities for Engram integration tests

use std::sync::Arc;

use engram::authz::Principal;
use engram::authz::policy::PolicyBundle;
use engram::cache::MokaCache;
use engram::config::Config;
use engram::convo::{AttachmentService, ConversationService, FsAttachmentSink};
use engram::crypto::{DekProvider, Provider, ProviderChain};
use engram::db::pool::DatabasePool;
use engram::episodic::EpisodicEngine;
use engram::resume::Resumer;
use engram::search::FullTextIndex;

/// Full service wiring over a shared in-memory database. Encryption runs
/// a real AES-GCM chain; embeddings are unconfigured so search exercises
/// the attribute/full-text paths.
pub struct TestContext {
    pub pool: Arc<DatabasePool>,
    pub conversations: Arc<ConversationService>,
    pub episodic: Arc<EpisodicEngine>,
    pub attachments: Arc<AttachmentService>,
    pub resumer: Arc<Resumer>,
    pub config: Arc<Config>,
    _resume_dir: tempfile::TempDir,
    _attach_dir: tempfile::TempDir,
}

pub const TEST_KEY: [u8; 32] = [42u8; 32];

pub fn test_chain(keys: Vec<[u8; 32]>) -> Arc<ProviderChain> {
    let provider: Arc<dyn Provider> =
        Arc::new(DekProvider::from_keys(keys).expect("test keys are valid"));
    Arc::new(ProviderChain::new(vec![provider]).expect("chain builds"))
}

impl TestContext {
    pub async fn new() -> Self {
        let pool = Arc::new(
            DatabasePool::open_in_memory()
                .await
                .expect("Failed to create in-memory pool"),
        );
        Self::with_pool_and_chain(pool, test_chain(vec![TEST_KEY])).await
    }

    /// Rewire services over an existing pool (key-rotation tests swap the
    /// chain while keeping the data).
    pub async fn with_pool_and_chain(
        pool: Arc<DatabasePool>,
        chain: Arc<ProviderChain>,
    ) -> Self {
        let resume_dir = tempfile::tempdir().expect("tempdir");
        let attach_dir = tempfile::tempdir().expect("tempdir");

        let mut config = Config::default();
        config.advertised_address = "node1:8080".to_string();
        config.resume.dir = resume_dir.path().to_path_buf();
        config.resume.poll_interval = std::time::Duration::from_millis(5);
        config.attachments.dir = attach_dir.path().to_path_buf();
        let config = Arc::new(config);

        let cache = Arc::new(MokaCache::new(1000));
        let fulltext = Some(Arc::new(FullTextIndex::new(pool.clone())));
        let resumer = Resumer::new(pool.clone(), config.resume.clone())
            .await
            .expect("resumer");
        let policy = Arc::new(PolicyBundle::default_bundle().expect("default policy"));

        let conversations = ConversationService::new(
            pool.clone(),
            cache,
            chain.clone(),
            None,
            fulltext,
            None,
            resumer.clone(),
            config.clone(),
        );
        let episodic = Arc::new(EpisodicEngine::new(
            pool.clone(),
            chain.clone(),
            policy,
            None,
            None,
            config.episodic.max_namespace_depth,
        ));
        let sink = Arc::new(
            FsAttachmentSink::new(attach_dir.path().to_path_buf()).expect("attachment sink"),
        );
        let attachments = Arc::new(AttachmentService::new(
            pool.clone(),
            sink,
            chain,
            config.attachments.clone(),
        ));

        Self {
            pool,
            conversations,
            episodic,
            attachments,
            resumer,
            config,
            _resume_dir: resume_dir,
            _attach_dir: attach_dir,
        }
    }
}

pub fn user(name: &str) -> Principal {
    Principal::user(name)
}

pub fn admin(name: &str) -> Principal {
    let mut principal = Principal::user(name);
    principal.admin = true;
    principal
}

pub fn text_blocks(text: &str) -> Vec<serde_json::Value> {
    vec![serde_json::json!({ "type": "text", "text": text })]
}
