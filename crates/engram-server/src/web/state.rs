// crates/engram-server/src/web/state.rs
// Web server state

use std::sync::Arc;

use crate::config::Config;
use crate::convo::{AttachmentService, ConversationService};
use crate::episodic::EpisodicEngine;
use crate::resume::Resumer;

/// Names of the providers resolved at startup, surfaced by /q/health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderInfo {
    pub store: String,
    pub cache: String,
    pub vector: String,
    pub embed: String,
    pub encrypt: Vec<String>,
    pub attach: String,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub conversations: Arc<ConversationService>,
    pub episodic: Arc<EpisodicEngine>,
    pub attachments: Arc<AttachmentService>,
    pub resumer: Arc<Resumer>,
    pub config: Arc<Config>,
    pub providers: Arc<ProviderInfo>,
}
