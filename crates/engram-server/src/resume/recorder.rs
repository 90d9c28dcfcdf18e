// crates/engram-server/src/resume/recorder.rs
// A single live recording: server-local append-only token capture

use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{Mutex, watch};

use crate::error::{EngramError, Result};

/// Recording file prefix; the retention sweep matches on it.
pub const RECORDING_PREFIX: &str = "engram-rec-";

struct RecordingState {
    file: Option<std::fs::File>,
    written: u64,
    /// Set when the size cap truncated the recording.
    truncated: bool,
    /// When the recording completed (drives retention eviction).
    completed_at: Option<std::time::Instant>,
}

/// One conversation's live recording. Single-writer: `record` and
/// `complete` serialize on the internal lock; any number of tail-reading
/// replays may run concurrently against the file.
pub struct Recording {
    conversation_id: String,
    file_name: String,
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<RecordingState>,
    complete_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl Recording {
    pub fn create(
        conversation_id: &str,
        dir: &std::path::Path,
        file_name: String,
        max_bytes: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&file_name);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let (complete_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Ok(Self {
            conversation_id: conversation_id.to_string(),
            file_name,
            path,
            max_bytes,
            state: Mutex::new(RecordingState {
                file: Some(file),
                written: 0,
                truncated: false,
                completed_at: None,
            }),
            complete_tx,
            cancel_tx,
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one token. Writes past the size cap truncate the recording:
    /// the error is recorded, later tokens drop, and replay readers see a
    /// clean prefix.
    pub async fn record(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.completed_at.is_some() {
            return Err(EngramError::Conflict(format!(
                "recording for conversation {} already completed",
                self.conversation_id
            )));
        }
        if state.truncated {
            return Ok(());
        }
        if state.written + token.len() as u64 > self.max_bytes {
            state.truncated = true;
            tracing::warn!(
                conversation_id = %self.conversation_id,
                cap = self.max_bytes,
                "recording truncated at size cap"
            );
            return Ok(());
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(token.as_bytes())?;
            file.flush()?;
            state.written += token.len() as u64;
        }
        Ok(())
    }

    /// Finish the recording: flush, release the file handle, and wake
    /// every tail reader. Idempotent.
    pub async fn complete(&self) {
        let mut state = self.state.lock().await;
        if state.completed_at.is_some() {
            return;
        }
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "flush on completion failed: {e}"
                );
            }
        }
        state.completed_at = Some(std::time::Instant::now());
        drop(state);
        let _ = self.complete_tx.send(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.complete_tx.borrow()
    }

    /// Whether the size cap cut this recording short.
    pub async fn is_truncated(&self) -> bool {
        self.state.lock().await.truncated
    }

    /// How long ago the recording completed, if it has.
    pub async fn completed_since(&self) -> Option<std::time::Duration> {
        self.state.lock().await.completed_at.map(|at| at.elapsed())
    }

    pub fn subscribe_complete(&self) -> watch::Receiver<bool> {
        self.complete_tx.subscribe()
    }

    /// Deliver the client's cancel signal to the token producer.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// The stream adapter selects on this alongside the upstream tokens.
    pub fn cancel_stream(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}
