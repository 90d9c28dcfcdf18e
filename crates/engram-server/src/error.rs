// crates/engram-server/src/error.rs
// Standardized error types for Engram

use thiserror::Error;

/// Main error type for the Engram library.
///
/// The first block mirrors the client-facing error taxonomy; the second
/// wraps infrastructure failures that surface as Internal.
#[derive(Error, Debug)]
pub enum EngramError {
    #[error("invalid input: {0}")]
    BadRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The live recording is owned by another node; the payload is the
    /// externally advertised address of the owner.
    #[error("stream owned by {0}")]
    Redirect(String),

    /// Requested search type is not configured; payload lists what is.
    #[error("search unavailable, configured types: {}", .0.join(", "))]
    SearchUnavailable(Vec<String>),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("policy error: {0}")]
    Policy(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using EngramError
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Whether this is SQLite lock contention: SQLITE_BUSY (file-backed
    /// databases under write pressure) or SQLITE_LOCKED (shared-cache
    /// in-memory databases, i.e. the test pools). This is the one failure
    /// class the write path retries instead of surfacing; classification
    /// looks at the SQLite result code, never at message text.
    pub fn is_contention(&self) -> bool {
        match self {
            EngramError::Db(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the error carries a message safe to surface verbatim.
    ///
    /// Validation and authorization errors are client errors; everything
    /// else is logged server-side and collapsed to "internal error".
    pub fn is_client_facing(&self) -> bool {
        matches!(
            self,
            EngramError::BadRequest(_)
                | EngramError::Unauthenticated(_)
                | EngramError::Forbidden(_)
                | EngramError::NotFound(_)
                | EngramError::Conflict(_)
                | EngramError::Redirect(_)
                | EngramError::SearchUnavailable(_)
        )
    }

    /// HTTP status for the REST surface.
    pub fn http_status(&self) -> u16 {
        match self {
            EngramError::BadRequest(_) => 400,
            EngramError::Unauthenticated(_) => 401,
            EngramError::Forbidden(_) => 403,
            EngramError::NotFound(_) => 404,
            EngramError::Conflict(_) => 409,
            EngramError::Redirect(_) => 307,
            EngramError::SearchUnavailable(_) => 503,
            _ => 500,
        }
    }
}

impl From<String> for EngramError {
    fn from(s: String) -> Self {
        EngramError::Other(s)
    }
}

impl From<tokio::task::JoinError> for EngramError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            EngramError::Cancelled
        } else {
            EngramError::Other(err.to_string())
        }
    }
}

impl From<EngramError> for String {
    fn from(err: EngramError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(EngramError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(EngramError::Unauthenticated("x".into()).http_status(), 401);
        assert_eq!(EngramError::Forbidden("x".into()).http_status(), 403);
        assert_eq!(EngramError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngramError::Conflict("x".into()).http_status(), 409);
        assert_eq!(EngramError::Redirect("node1:8080".into()).http_status(), 307);
        assert_eq!(
            EngramError::SearchUnavailable(vec!["fulltext".into()]).http_status(),
            503
        );
        assert_eq!(EngramError::DecryptionFailed("x".into()).http_status(), 500);
        assert_eq!(EngramError::Other("x".into()).http_status(), 500);
    }

    #[test]
    fn test_client_facing() {
        assert!(EngramError::Forbidden("no".into()).is_client_facing());
        assert!(!EngramError::DecryptionFailed("no".into()).is_client_facing());
        assert!(!EngramError::Other("boom".into()).is_client_facing());
    }

    fn sqlite_failure(code: rusqlite::ffi::ErrorCode, extended_code: i32) -> EngramError {
        EngramError::Db(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code, extended_code },
            None,
        ))
    }

    #[test]
    fn test_contention_covers_busy_and_locked() {
        assert!(sqlite_failure(rusqlite::ffi::ErrorCode::DatabaseBusy, 5).is_contention());
        assert!(sqlite_failure(rusqlite::ffi::ErrorCode::DatabaseLocked, 6).is_contention());
    }

    #[test]
    fn test_contention_excludes_other_failures() {
        // Constraint violations are real errors, not lock pressure
        assert!(
            !sqlite_failure(rusqlite::ffi::ErrorCode::ConstraintViolation, 19).is_contention()
        );
        assert!(!EngramError::Cancelled.is_contention());
        // Message text that merely mentions locking never classifies
        assert!(!EngramError::Other("database is locked".into()).is_contention());
        assert!(!EngramError::Conflict("database is locked".into()).is_contention());
    }
}
