// crates/engram-server/src/resume/mod.rs
// Response resumption: single-writer recordings, locators, replay streams
//
// Exactly one live recording exists per conversation. The owning node
// appends tokens to a local file and keeps a short-TTL locator row in the
// shared store; any node can answer a resume by either tailing its own
// file or redirecting the client to the owner. Completed recordings stay
// replayable locally until the retention window lapses.

mod locator;
mod recorder;

pub use locator::Locator;
pub use recorder::{RECORDING_PREFIX, Recording};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::RwLock;

use crate::config::{ResumeConfig, split_host_port};
use crate::db::pool::DatabasePool;
use crate::db::{
    delete_expired_locators_sync, delete_locator_sync, get_locator_sync, put_locator_sync,
    refresh_locator_sync,
};
use crate::error::{EngramError, Result};
use crate::utils::{to_storage_ts, utf8_prefix_len};

/// Outcome of a replay request.
pub enum Replay {
    /// Tokens observed so far, then live tokens until completion.
    Stream(Pin<Box<dyn Stream<Item = String> + Send>>),
    /// The recording lives on another node.
    Redirect(String),
    /// Nothing is streaming for this conversation.
    Empty,
}

pub struct Resumer {
    pool: Arc<DatabasePool>,
    cfg: ResumeConfig,
    recordings: RwLock<HashMap<String, Arc<Recording>>>,
}

impl Resumer {
    /// Build the resumer and sweep recording files left over from before
    /// the last shutdown.
    pub async fn new(pool: Arc<DatabasePool>, cfg: ResumeConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.dir)?;
        let swept = sweep_dir(&cfg.dir, cfg.retention)?;
        if swept > 0 {
            tracing::info!(swept, "removed stale recording files at startup");
        }
        Ok(Arc::new(Self { pool, cfg, recordings: RwLock::new(HashMap::new()) }))
    }

    /// Open a recording for a conversation, advertising `address` as the
    /// owner. An older live recording for the same conversation on this
    /// node completes first; a stale locator from another node is simply
    /// overwritten (opening a new recorder wins).
    pub async fn recorder_with_address(
        &self,
        conversation_id: &str,
        address: &str,
    ) -> Result<Arc<Recording>> {
        let mut recordings = self.recordings.write().await;
        if let Some(existing) = recordings.get(conversation_id) {
            if !existing.is_complete() {
                tracing::debug!(
                    conversation_id,
                    "completing superseded recording before opening a new one"
                );
                existing.complete().await;
            }
        }

        let (host, port) = split_host_port(address);
        let file_name = format!(
            "{RECORDING_PREFIX}{}-{}.log",
            conversation_id,
            uuid::Uuid::new_v4().simple()
        );
        let recording = Arc::new(Recording::create(
            conversation_id,
            &self.cfg.dir,
            file_name.clone(),
            self.cfg.max_recording_bytes,
        )?);
        let locator = Locator::new(host, port, file_name);

        let encoded = locator.encode();
        let conversation = conversation_id.to_string();
        let expires = self.locator_expiry();
        self.pool
            .run(move |conn| put_locator_sync(conn, &conversation, &encoded, &expires))
            .await?;

        self.spawn_refresh(recording.clone(), locator);
        recordings.insert(conversation_id.to_string(), recording.clone());
        Ok(recording)
    }

    /// Answer a resume arriving at this node (`self_address` is its own
    /// externally advertised address).
    pub async fn replay_with_address(
        &self,
        conversation_id: &str,
        self_address: &str,
    ) -> Result<Replay> {
        // A local recording (live or retained) answers directly.
        if let Some(recording) = self.recordings.read().await.get(conversation_id) {
            return Ok(Replay::Stream(Box::pin(tail_recording(
                recording.clone(),
                self.cfg.poll_interval,
            ))));
        }

        let conversation = conversation_id.to_string();
        let row = self
            .pool
            .run(move |conn| get_locator_sync(conn, &conversation))
            .await?;
        let Some(encoded) = row else {
            return Ok(Replay::Empty);
        };
        let locator = Locator::parse(&encoded)?;

        if locator.address() != self_address {
            return Ok(Replay::Redirect(locator.address()));
        }

        // The locator names this node but the recording is not in memory
        // (restart). Serve the file if it survived, following the locator
        // for liveness.
        let path = self.cfg.dir.join(&locator.file_name);
        if !path.exists() {
            return Ok(Replay::Empty);
        }
        Ok(Replay::Stream(Box::pin(tail_orphan_file(
            self.pool.clone(),
            conversation_id.to_string(),
            encoded,
            path,
            self.cfg.poll_interval,
        ))))
    }

    /// Route a client cancel to the recording's owner. Local recordings
    /// get the signal directly; foreign ones surface a redirect.
    pub async fn request_cancel(&self, conversation_id: &str) -> Result<()> {
        if let Some(recording) = self.recordings.read().await.get(conversation_id) {
            if !recording.is_complete() {
                recording.cancel();
                return Ok(());
            }
        }

        let conversation = conversation_id.to_string();
        let row = self
            .pool
            .run(move |conn| get_locator_sync(conn, &conversation))
            .await?;
        match row {
            Some(encoded) => {
                let locator = Locator::parse(&encoded)?;
                Err(EngramError::Redirect(locator.address()))
            }
            None => Err(EngramError::NotFound(format!(
                "conversation {conversation_id} has no live stream"
            ))),
        }
    }

    /// Retention sweep: evict completed recordings past the window, remove
    /// their files and any orphaned recording files, and drop expired
    /// locator rows.
    pub async fn sweep_retention(&self) -> Result<usize> {
        let mut evicted = 0;
        {
            let mut recordings = self.recordings.write().await;
            let mut expired_keys = Vec::new();
            for (key, recording) in recordings.iter() {
                if let Some(age) = recording.completed_since().await {
                    if age >= self.cfg.retention {
                        expired_keys.push(key.clone());
                    }
                }
            }
            for key in expired_keys {
                if let Some(recording) = recordings.remove(&key) {
                    if let Err(e) = std::fs::remove_file(recording.path()) {
                        tracing::debug!("recording file already gone: {e}");
                    }
                    evicted += 1;
                }
            }
        }

        evicted += sweep_dir(&self.cfg.dir, self.cfg.retention)?;

        self.pool
            .best_effort("expired locator sweep", delete_expired_locators_sync)
            .await;

        Ok(evicted)
    }

    fn locator_expiry(&self) -> String {
        locator_expiry(self.cfg.locator_ttl)
    }

    /// Keep the locator fresh while the recording is live; remove it the
    /// moment the recording completes. The spawned task captures only the
    /// pool and the timing knobs, not the resumer itself.
    fn spawn_refresh(&self, recording: Arc<Recording>, locator: Locator) {
        let pool = self.pool.clone();
        let refresh_interval = self.cfg.refresh_interval;
        let locator_ttl = self.cfg.locator_ttl;
        tokio::spawn(async move {
            let mut complete = recording.subscribe_complete();
            let encoded = locator.encode();
            loop {
                tokio::select! {
                    changed = complete.changed() => {
                        if changed.is_err() || *complete.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(refresh_interval) => {
                        let conversation = recording.conversation_id().to_string();
                        let value = encoded.clone();
                        let expires = locator_expiry(locator_ttl);
                        pool.best_effort("locator refresh", move |conn| {
                            // A takeover by another node leaves our row
                            // gone; re-asserting it would fight the new
                            // owner, so a miss just stops refreshing.
                            refresh_locator_sync(conn, &conversation, &value, &expires)
                        })
                        .await;
                    }
                }
            }
            let conversation = recording.conversation_id().to_string();
            pool.best_effort("locator removal", move |conn| {
                delete_locator_sync(conn, &conversation, &encoded)
            })
            .await;
        });
    }
}

fn locator_expiry(ttl: Duration) -> String {
    to_storage_ts(
        chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(10)),
    )
}

/// Delete recording files older than the retention window. Returns how
/// many were removed.
fn sweep_dir(dir: &std::path::Path, retention: Duration) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(RECORDING_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if modified.elapsed().map(|age| age >= retention).unwrap_or(false) {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Read any bytes at `offset` and beyond.
async fn read_from(path: &std::path::Path, offset: u64) -> Vec<u8> {
    match tokio::fs::read(path).await {
        Ok(bytes) if (bytes.len() as u64) > offset => bytes[offset as usize..].to_vec(),
        _ => Vec::new(),
    }
}

/// Tail a recording owned by this process: everything written so far,
/// then new appends until completion. Bytes split mid-codepoint carry
/// into the next chunk.
fn tail_recording(
    recording: Arc<Recording>,
    poll: Duration,
) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        let path = recording.path().to_path_buf();
        let mut offset: u64 = 0;
        let mut carry: Vec<u8> = Vec::new();
        loop {
            let complete = recording.is_complete();
            let chunk = read_from(&path, offset).await;
            if !chunk.is_empty() {
                offset += chunk.len() as u64;
                carry.extend_from_slice(&chunk);
                let valid = utf8_prefix_len(&carry);
                if valid > 0 {
                    yield String::from_utf8_lossy(&carry[..valid]).into_owned();
                    carry.drain(..valid);
                }
                continue;
            }
            if complete {
                if !carry.is_empty() {
                    yield String::from_utf8_lossy(&carry).into_owned();
                }
                break;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// Tail a recording file whose in-memory state did not survive a restart.
/// Liveness follows the locator row: once it is gone or renamed, the
/// recording is over.
fn tail_orphan_file(
    pool: Arc<DatabasePool>,
    conversation_id: String,
    expected_locator: String,
    path: std::path::PathBuf,
    poll: Duration,
) -> impl Stream<Item = String> + Send {
    async_stream::stream! {
        let mut offset: u64 = 0;
        let mut carry: Vec<u8> = Vec::new();
        let mut ticks_since_check: u32 = 0;
        let mut live = true;
        loop {
            let chunk = read_from(&path, offset).await;
            if !chunk.is_empty() {
                offset += chunk.len() as u64;
                carry.extend_from_slice(&chunk);
                let valid = utf8_prefix_len(&carry);
                if valid > 0 {
                    yield String::from_utf8_lossy(&carry[..valid]).into_owned();
                    carry.drain(..valid);
                }
                continue;
            }
            if !live {
                if !carry.is_empty() {
                    yield String::from_utf8_lossy(&carry).into_owned();
                }
                break;
            }
            ticks_since_check += 1;
            if ticks_since_check >= 25 {
                ticks_since_check = 0;
                let conversation = conversation_id.clone();
                let current = pool
                    .best_effort("orphan tail locator check", move |conn| {
                        get_locator_sync(conn, &conversation)
                    })
                    .await
                    .flatten();
                live = current.as_deref() == Some(expected_locator.as_str());
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_cfg(dir: &std::path::Path) -> ResumeConfig {
        ResumeConfig {
            dir: dir.to_path_buf(),
            retention: Duration::from_secs(60),
            locator_ttl: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            max_recording_bytes: 1024 * 1024,
        }
    }

    async fn resumer(dir: &std::path::Path, pool: Arc<DatabasePool>) -> Arc<Resumer> {
        Resumer::new(pool, test_cfg(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn test_replay_without_stream_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let resumer = resumer(dir.path(), pool).await;
        match resumer.replay_with_address("c1", "node1:8080").await.unwrap() {
            Replay::Empty => {}
            _ => panic!("expected empty replay"),
        }
    }

    #[tokio::test]
    async fn test_local_replay_sees_prefix_then_live_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let resumer = resumer(dir.path(), pool).await;

        let recording = resumer.recorder_with_address("c1", "node1:8080").await.unwrap();
        recording.record("Hel").await.unwrap();
        recording.record("lo ").await.unwrap();

        let replay = resumer.replay_with_address("c1", "node1:8080").await.unwrap();
        let Replay::Stream(stream) = replay else { panic!("expected stream") };

        let collector = tokio::spawn(async move {
            let chunks: Vec<String> = stream.collect().await;
            chunks.join("")
        });

        recording.record("wor").await.unwrap();
        recording.record("ld").await.unwrap();
        recording.complete().await;

        let text = collector.await.unwrap();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_foreign_recording_redirects() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());

        // Node 1 owns the recording; node 2 shares the locator store.
        let node1 = resumer(dir1.path(), pool.clone()).await;
        let node2 = resumer(dir2.path(), pool).await;

        let recording = node1.recorder_with_address("c1", "node1:8080").await.unwrap();
        recording.record("Hel").await.unwrap();

        match node2.replay_with_address("c1", "node2:8080").await.unwrap() {
            Replay::Redirect(address) => assert_eq!(address, "node1:8080"),
            _ => panic!("expected redirect to the owning node"),
        }

        // Cancel from the wrong node redirects too
        match node2.request_cancel("c1").await {
            Err(EngramError::Redirect(address)) => assert_eq!(address, "node1:8080"),
            other => panic!("expected redirect, got {other:?}"),
        }
        recording.complete().await;
    }

    #[tokio::test]
    async fn test_completed_recording_replays_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let resumer = resumer(dir.path(), pool).await;

        let recording = resumer.recorder_with_address("c1", "node1:8080").await.unwrap();
        recording.record("Hello world").await.unwrap();
        recording.complete().await;

        let Replay::Stream(stream) = resumer.replay_with_address("c1", "node1:8080").await.unwrap()
        else {
            panic!("expected stream")
        };
        let text: String = stream.collect::<Vec<_>>().await.join("");
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_new_recorder_supersedes_old() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let resumer = resumer(dir.path(), pool).await;

        let first = resumer.recorder_with_address("c1", "node1:8080").await.unwrap();
        first.record("old").await.unwrap();
        assert!(!first.is_complete());

        let second = resumer.recorder_with_address("c1", "node1:8080").await.unwrap();
        assert!(first.is_complete(), "opening a new recorder completes the old one");
        assert!(!second.is_complete());
        second.complete().await;
    }

    #[tokio::test]
    async fn test_cancel_reaches_local_recording() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let resumer = resumer(dir.path(), pool).await;

        let recording = resumer.recorder_with_address("c1", "node1:8080").await.unwrap();
        let mut cancel = recording.cancel_stream();
        resumer.request_cancel("c1").await.unwrap();
        cancel.changed().await.unwrap();
        assert!(recording.is_cancelled());
        recording.complete().await;
    }
}
