// crates/engram-server/src/background/mod.rs
// Background worker: task queue draining and periodic sweeps

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::IndexerConfig;
use crate::convo::{AttachmentService, ConversationService, TASK_DELETE_GROUP_INDEX, TASK_INDEX_ENTRY};
use crate::db::pool::DatabasePool;
use crate::db::types::TaskRow;
use crate::db::{claim_due_tasks_sync, complete_task_sync, fail_task_sync};
use crate::episodic::{EpisodicEngine, TASK_DELETE_MEMORY_VECTORS, TASK_INDEX_MEMORY};
use crate::resume::Resumer;

/// Background worker configuration
pub struct BackgroundWorker {
    pool: Arc<DatabasePool>,
    conversations: Arc<ConversationService>,
    episodic: Arc<EpisodicEngine>,
    attachments: Arc<AttachmentService>,
    resumer: Arc<Resumer>,
    indexer: IndexerConfig,
    shutdown: watch::Receiver<bool>,
    cycle_count: u64,
}

impl BackgroundWorker {
    pub fn new(
        pool: Arc<DatabasePool>,
        conversations: Arc<ConversationService>,
        episodic: Arc<EpisodicEngine>,
        attachments: Arc<AttachmentService>,
        resumer: Arc<Resumer>,
        indexer: IndexerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            conversations,
            episodic,
            attachments,
            resumer,
            indexer,
            shutdown,
            cycle_count: 0,
        }
    }

    /// Start the background worker loop
    pub async fn run(mut self) {
        tracing::info!("Background worker started");

        loop {
            if *self.shutdown.borrow() {
                tracing::info!("Background worker shutting down");
                break;
            }

            match self.process_batch().await {
                Ok(processed) if processed > 0 => {
                    tracing::debug!("Background worker processed {} items", processed);
                    // Short delay between batches when there's work
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(_) => {
                    tokio::time::sleep(self.indexer.tick).await;
                }
                Err(e) => {
                    tracing::warn!("Background worker error: {}", e);
                    // Back off on errors
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            }

            if self.shutdown.has_changed().unwrap_or(false) && *self.shutdown.borrow() {
                break;
            }
        }
    }

    /// Process one batch: due queue tasks first, then the periodic sweeps
    /// on a slower cadence.
    async fn process_batch(&mut self) -> Result<usize, String> {
        let mut processed = 0;
        self.cycle_count += 1;

        let batch = self.indexer.batch_size;
        let tasks = self
            .pool
            .run(move |conn| claim_due_tasks_sync(conn, batch))
            .await
            .map_err(|e| e.to_string())?;
        for task in tasks {
            processed += 1;
            match self.dispatch(&task).await {
                Ok(()) => {
                    let id = task.id;
                    self.pool
                        .best_effort("task completion", move |conn| complete_task_sync(conn, id))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(task_type = %task.task_type, "task failed: {e}");
                    let error = e.to_string();
                    self.pool
                        .best_effort("task failure bookkeeping", move |conn| {
                            fail_task_sync(conn, &task, &error)
                        })
                        .await;
                }
            }
        }

        // Indexer scan: items whose content moved past their last indexing
        let indexed = self
            .episodic
            .index_pending(self.indexer.batch_size)
            .await
            .map_err(|e| e.to_string())?;
        processed += indexed;

        // Slower housekeeping every 6th cycle
        if self.cycle_count % 6 == 1 {
            let expired = self.episodic.expire_due(256).await.map_err(|e| e.to_string())?;
            if expired > 0 {
                tracing::info!("Background: expired {} memories", expired);
            }
            processed += expired;

            let swept = self
                .attachments
                .sweep_expired(256)
                .await
                .map_err(|e| e.to_string())?;
            if swept > 0 {
                tracing::info!("Background: removed {} expired attachments", swept);
            }
            processed += swept;

            let evicted = self.resumer.sweep_retention().await.map_err(|e| e.to_string())?;
            if evicted > 0 {
                tracing::debug!("Background: evicted {} retained recordings", evicted);
            }
        }

        Ok(processed)
    }

    async fn dispatch(&self, task: &TaskRow) -> crate::Result<()> {
        let body: serde_json::Value = serde_json::from_str(&task.task_body)?;
        match task.task_type.as_str() {
            TASK_INDEX_ENTRY => {
                let entry_id = body
                    .get("entry_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                self.conversations.index_entry(entry_id).await
            }
            TASK_DELETE_GROUP_INDEX => {
                let group_id = body
                    .get("group_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                self.conversations.delete_group_index(group_id).await
            }
            TASK_INDEX_MEMORY => {
                let memory_id = body
                    .get("memory_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                self.episodic.index_memory(memory_id).await.map(|_| ())
            }
            TASK_DELETE_MEMORY_VECTORS => {
                let memory_id = body
                    .get("memory_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                self.episodic.delete_memory_vectors(memory_id).await
            }
            other => {
                tracing::warn!("unknown task type {other:?}, dropping");
                Ok(())
            }
        }
    }
}

/// Spawn the background worker; the returned sender signals shutdown.
pub fn spawn(
    pool: Arc<DatabasePool>,
    conversations: Arc<ConversationService>,
    episodic: Arc<EpisodicEngine>,
    attachments: Arc<AttachmentService>,
    resumer: Arc<Resumer>,
    indexer: IndexerConfig,
) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = BackgroundWorker::new(
        pool,
        conversations,
        episodic,
        attachments,
        resumer,
        indexer,
        shutdown_rx,
    );
    tokio::spawn(async move {
        worker.run().await;
    });
    shutdown_tx
}
