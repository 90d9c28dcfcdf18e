// crates/engram-server/src/utils.rs
// Small shared helpers

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::path::Path;
use std::sync::Mutex;

/// Render a timestamp in the canonical storage form: RFC 3339 UTC with
/// microsecond precision. Lexicographic order equals chronological order,
/// which the `(created_at, id)` ordering key relies on.
pub fn to_storage_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage form.
pub fn now_ts() -> String {
    to_storage_ts(Utc::now())
}

static LAST_STAMP: Mutex<i64> = Mutex::new(0);

/// Monotonic insert timestamp: never goes backwards within this process,
/// even if the wall clock does. Ties advance by one microsecond so two
/// entries stamped back-to-back still order deterministically before the
/// UUID tie-break.
pub fn monotonic_now() -> DateTime<Utc> {
    let now_micros = Utc::now().timestamp_micros();
    let mut last = LAST_STAMP.lock().unwrap_or_else(|e| e.into_inner());
    let stamped = if now_micros > *last { now_micros } else { *last + 1 };
    *last = stamped;
    Utc.timestamp_micros(stamped)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Monotonic insert timestamp in storage form.
pub fn monotonic_now_ts() -> String {
    to_storage_ts(monotonic_now())
}

/// Convert a path to a String for SQLite connection strings and logging.
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Length of the longest prefix of `bytes` that is valid UTF-8.
///
/// Tail-reading replay streams chunk a file at arbitrary byte offsets; a
/// chunk may end mid-codepoint. The remainder is carried into the next
/// chunk rather than lossily replaced.
pub fn utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => e.valid_up_to(),
    }
}
