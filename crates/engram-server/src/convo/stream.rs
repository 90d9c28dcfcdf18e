// crates/engram-server/src/convo/stream.rs
// Stream adapter: fan tokens out to the client, the buffer, the recorder
//
// Two cooperating channels drive the adapter: the upstream token producer
// and the recorder's cancel signal, consumed together in one select loop.
// Whatever ends the stream (completion, failure, cancel), the buffered
// text persists as a single materialized entry and the recording
// completes.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::resume::Recording;

/// How a streamed response ended.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Everything the upstream produced before the end condition.
    pub text: String,
    pub cancelled: bool,
    /// The upstream or recorder error that cut the stream short.
    pub failed: Option<String>,
}

/// Pump the upstream into (client sink, buffer, recorder) until it
/// completes, fails, or the recorder surfaces a cancel.
///
/// The client sink never backpressures the recorder: a full client
/// channel drops the live feed (the client re-syncs through replay) while
/// recording continues.
pub async fn pump<S>(
    mut upstream: S,
    recording: Arc<Recording>,
    sink: mpsc::Sender<String>,
    mut on_progress: Option<Box<dyn FnMut(&str) + Send>>,
) -> StreamOutcome
where
    S: Stream<Item = Result<String>> + Unpin,
{
    let mut cancel = recording.cancel_stream();
    let mut sink = Some(sink);
    let mut text = String::new();
    let mut cancelled = false;
    let mut failed = None;

    loop {
        tokio::select! {
            maybe = upstream.next() => match maybe {
                Some(Ok(token)) => {
                    if let Some(tx) = &sink {
                        match tx.try_send(token.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::debug!(
                                    conversation_id = %recording.conversation_id(),
                                    "client sink lagging, dropping live feed"
                                );
                                sink = None;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                sink = None;
                            }
                        }
                    }
                    text.push_str(&token);
                    if let Err(e) = recording.record(&token).await {
                        failed = Some(e.to_string());
                        break;
                    }
                    if let Some(callback) = on_progress.as_mut() {
                        callback(&text);
                    }
                }
                Some(Err(e)) => {
                    failed = Some(e.to_string());
                    break;
                }
                None => break,
            },
            changed = cancel.changed() => {
                if changed.is_err() {
                    break;
                }
                if *cancel.borrow() {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    recording.complete().await;
    StreamOutcome { text, cancelled, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::RECORDING_PREFIX;

    fn recording(dir: &std::path::Path) -> Arc<Recording> {
        Arc::new(
            Recording::create("c1", dir, format!("{RECORDING_PREFIX}c1.log"), 1024 * 1024)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_pump_forwards_buffers_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let recording = recording(dir.path());
        let upstream = futures::stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo ".to_string()),
            Ok("world".to_string()),
        ]);
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = pump(Box::pin(upstream), recording.clone(), tx, None).await;
        assert_eq!(outcome.text, "Hello world");
        assert!(!outcome.cancelled);
        assert!(outcome.failed.is_none());
        assert!(recording.is_complete());

        let mut forwarded = String::new();
        while let Ok(token) = rx.try_recv() {
            forwarded.push_str(&token);
        }
        assert_eq!(forwarded, "Hello world");
        assert_eq!(std::fs::read(recording.path()).unwrap(), b"Hello world");
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel_and_keeps_partial() {
        let dir = tempfile::tempdir().unwrap();
        let recording = recording(dir.path());

        // An endless upstream: only the cancel signal ends it
        let cancel_source = recording.clone();
        let upstream = Box::pin(async_stream::stream! {
            yield Ok("partial ".to_string());
            cancel_source.cancel();
            // Give the select loop a chance to observe the signal
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                yield Ok("never-ending".to_string());
            }
        });
        let (tx, _rx) = mpsc::channel(16);

        let outcome = pump(upstream, recording.clone(), tx, None).await;
        assert!(outcome.cancelled);
        assert!(outcome.text.starts_with("partial "));
        assert!(recording.is_complete());
    }

    #[tokio::test]
    async fn test_pump_persists_buffer_on_upstream_failure() {
        let dir = tempfile::tempdir().unwrap();
        let recording = recording(dir.path());
        let upstream = futures::stream::iter(vec![
            Ok("kept ".to_string()),
            Err(crate::error::EngramError::Other("upstream died".to_string())),
        ]);
        let (tx, _rx) = mpsc::channel(16);

        let outcome = pump(Box::pin(upstream), recording.clone(), tx, None).await;
        assert_eq!(outcome.text, "kept ");
        assert_eq!(outcome.failed.as_deref(), Some("unknown error: upstream died"));
        assert!(recording.is_complete());
    }

    #[tokio::test]
    async fn test_full_client_sink_does_not_stall_recording() {
        let dir = tempfile::tempdir().unwrap();
        let recording = recording(dir.path());
        let tokens: Vec<Result<String>> = (0..64).map(|i| Ok(format!("t{i} "))).collect();
        let upstream = futures::stream::iter(tokens);
        // Capacity 1 and nobody reading: the sink fills immediately
        let (tx, _rx) = mpsc::channel(1);

        let outcome = pump(Box::pin(upstream), recording.clone(), tx, None).await;
        assert!(outcome.failed.is_none());
        assert!(outcome.text.contains("t63"));
        // The recording captured everything even though the client lagged
        let recorded = std::fs::read_to_string(recording.path()).unwrap();
        assert!(recorded.contains("t63"));
    }
}
