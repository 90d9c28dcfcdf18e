// crates/engram-server/src/db/pool.rs
// Async SQLite access for the store
//
// One deadpool of rusqlite connections backs every store operation, and
// the pool exposes exactly three calls:
//
//   run            the single entry point; moves a closure onto a
//                  blocking thread and converts every failure into
//                  `EngramError`
//   run_with_retry `run` looped while `EngramError::is_contention`
//                  holds, for writes that must not be lost (entry
//                  appends, epoch sync, transfer acceptance)
//   best_effort    `run` with failures downgraded to a debug log, for
//                  upkeep that must never take its caller down
//                  (locator refreshes, task bookkeeping)
//
// In-memory pools use a shared-cache URI so every pooled connection sees
// the same database; that is what makes the test pools work.

use deadpool_sqlite::{Config, Hook, HookError, Pool, Runtime};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{EngramError, Result};
use crate::utils::path_to_string;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Pooled connections. WAL lets readers proceed beside the one writer.
const POOL_CONNECTIONS: usize = 8;

/// Contention retry schedule: first wait, growth per attempt, attempt cap.
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_GROWTH: u32 = 4;
const WRITE_ATTEMPTS: u32 = 4;

static VECTOR_EXT: OnceLock<()> = OnceLock::new();

/// Register sqlite-vec as an auto-extension so every connection the pool
/// opens can create and query vec0 tables. Process-global; must run
/// before the first connection opens.
#[allow(clippy::missing_transmute_annotations)]
fn register_vector_extension() {
    VECTOR_EXT.get_or_init(|| {
        // SAFETY: sqlite3_vec_init has the entry-point signature
        // sqlite3_auto_extension expects, and points at a statically
        // linked symbol that outlives every connection.
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite3_vec_init as *const (),
            )));
        }
    });
}

/// Where a pool's database lives.
enum Backing {
    File(std::path::PathBuf),
    /// Shared-cache URI; all pooled connections address one database.
    Memory(String),
}

pub struct DatabasePool {
    pool: Pool,
}

impl DatabasePool {
    /// Open a pooled database at the given path, running migrations and
    /// restricting file permissions to the service user.
    pub async fn open(path: &Path) -> Result<Self> {
        register_vector_extension();
        secure_parent_dir(path)?;
        let db = Self { pool: build_pool(Backing::File(path.to_path_buf()))? };
        db.run_migrations().await?;
        // After migrations the database and its WAL/SHM siblings exist
        harden_db_files(path);
        Ok(db)
    }

    /// Open a pooled in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self> {
        register_vector_extension();
        let uri = format!(
            "file:engram-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let db = Self { pool: build_pool(Backing::Memory(uri))? };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run a closure against a pooled connection on a blocking thread.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<EngramError> + Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| EngramError::Other(format!("connection checkout failed: {e}")))?;
        conn.interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| EngramError::Other(format!("pooled call aborted: {e}")))?
    }

    /// [`run`](Self::run), retried while the failure classifies as
    /// SQLite contention. Any other error surfaces on the first attempt.
    /// The closure must be `Clone` so it can re-run.
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<EngramError> + Send + 'static,
    {
        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            match self.run(f.clone()).await {
                Err(e) if e.is_contention() && attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(
                        attempt,
                        "SQLite contention on write, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= RETRY_GROWTH;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// [`run`](Self::run) for upkeep work: failures log at debug under
    /// `label` and come back as `None` instead of propagating.
    pub async fn best_effort<F, R, E>(&self, label: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<EngramError> + Send + 'static,
    {
        match self.run(f).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("{label}: {e}");
                None
            }
        }
    }

    /// Bring the schema up to date. Runs at open and behind the
    /// `migrate` subcommand.
    pub async fn run_migrations(&self) -> Result<()> {
        self.run(|conn| {
            super::schema::run_all_migrations(conn).map_err(EngramError::from)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {e}");
            }
            Ok::<_, EngramError>(())
        })
        .await
    }
}

fn build_pool(backing: Backing) -> Result<Pool> {
    let (conn_str, durable) = match &backing {
        Backing::File(path) => (path_to_string(path), true),
        Backing::Memory(uri) => (uri.clone(), false),
    };
    Config::new(&conn_str)
        .builder(Runtime::Tokio1)
        .map_err(|e| EngramError::Config(format!("pool builder: {e}")))?
        .max_size(POOL_CONNECTIONS)
        .post_create(session_init_hook(durable))
        .build()
        .map_err(|e| EngramError::Config(format!("pool build: {e}")))
}

/// Session settings for each connection the pool creates. WAL and the
/// relaxed fsync level only apply to file-backed databases; shared-cache
/// in-memory connections reject journal-mode changes.
fn session_settings(durable: bool) -> String {
    let mut pragmas = vec!["PRAGMA foreign_keys=ON", "PRAGMA busy_timeout=10000"];
    if durable {
        pragmas.push("PRAGMA journal_mode=WAL");
        pragmas.push("PRAGMA synchronous=NORMAL");
    }
    let mut sql = pragmas.join(";\n");
    sql.push(';');
    sql
}

fn session_init_hook(durable: bool) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            let sql = session_settings(durable);
            conn.interact(move |conn| conn.execute_batch(&sql))
                .await
                .map_err(|e| HookError::Message(format!("session init aborted: {e}").into()))?
                .map_err(|e| HookError::Message(format!("session settings failed: {e}").into()))
        })
    })
}

/// Keep the database directory private to the service user (0o700).
fn secure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Restrict the database file and its WAL/SHM siblings to the service
/// user (0o600). Best-effort: the data is already down when this runs,
/// and the SHM file may not exist yet.
#[cfg(unix)]
fn harden_db_files(path: &Path) {
    let base = path_to_string(path);
    for candidate in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
        let target = Path::new(&candidate);
        if !target.exists() {
            continue;
        }
        if let Err(e) = std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!("could not restrict permissions on {candidate}: {e}");
        }
    }
}

#[cfg(not(unix))]
fn harden_db_files(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        get_locator_sync, list_memberships_sync, membership_level_sync, put_locator_sync,
        request_transfer_sync, upsert_membership_sync,
    };

    #[tokio::test]
    async fn test_pooled_connections_share_one_database() {
        let pool = DatabasePool::open_in_memory().await.expect("pool");

        // Write through one pooled connection, read through another
        pool.run(|conn| {
            put_locator_sync(conn, "c1", "node1|8080|rec.log", "2999-01-01T00:00:00Z")
        })
        .await
        .expect("locator write");

        let locator = pool
            .run(|conn| get_locator_sync(conn, "c1"))
            .await
            .expect("locator read");
        assert_eq!(locator.as_deref(), Some("node1|8080|rec.log"));
    }

    #[tokio::test]
    async fn test_file_pool_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engram.db");
        {
            let pool = DatabasePool::open(&path).await.expect("open");
            pool.run(|conn| upsert_membership_sync(conn, "g1", "alice", 4))
                .await
                .expect("write");
        }

        let reopened = DatabasePool::open(&path).await.expect("reopen");
        let level = reopened
            .run(|conn| membership_level_sync(conn, "g1", "alice"))
            .await
            .expect("read");
        assert_eq!(level, Some(4));
    }

    #[tokio::test]
    async fn test_concurrent_retried_writes_all_land() {
        let pool = std::sync::Arc::new(DatabasePool::open_in_memory().await.expect("pool"));

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.run_with_retry(move |conn| {
                    upsert_membership_sync(conn, "g1", &format!("user-{i}"), 2)
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("membership write");
        }

        let members = pool
            .run(|conn| list_memberships_sync(conn, "g1"))
            .await
            .expect("listing");
        assert_eq!(members.len(), 10);
    }

    #[tokio::test]
    async fn test_retry_passes_real_errors_through() {
        let pool = DatabasePool::open_in_memory().await.expect("pool");
        pool.run(|conn| request_transfer_sync(conn, "t1", "c1", "alice", "bob"))
            .await
            .expect("first transfer");

        // A second PENDING transfer violates the partial unique index;
        // that is a real error, not lock pressure, so it must surface on
        // the first attempt rather than burn the retry schedule.
        let err = pool
            .run_with_retry(|conn| {
                conn.execute(
                    "INSERT INTO ownership_transfers
                        (id, conversation_id, from_user_id, to_user_id, status, created_at)
                     VALUES ('t2', 'c1', 'alice', 'carol', 'PENDING', '2026-01-01T00:00:00Z')",
                    [],
                )
                .map(|_| ())
                .map_err(EngramError::from)
            })
            .await
            .expect_err("duplicate pending transfer must fail");
        assert!(!err.is_contention());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        let pool = DatabasePool::open_in_memory().await.expect("pool");

        let missing = pool
            .best_effort("poke missing table", |conn| {
                conn.query_row("SELECT 1 FROM no_such_table", [], |row| row.get::<_, i64>(0))
                    .map_err(EngramError::from)
            })
            .await;
        assert!(missing.is_none());

        let present = pool
            .best_effort("count groups", |conn| {
                conn.query_row("SELECT COUNT(*) FROM conversation_groups", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(EngramError::from)
            })
            .await;
        assert_eq!(present, Some(0));
    }

    #[test]
    fn test_session_settings_shape() {
        let durable = session_settings(true);
        assert!(durable.contains("journal_mode=WAL"));
        assert!(durable.ends_with(';'));

        // In-memory connections must not ask for WAL
        let memory = session_settings(false);
        assert!(!memory.contains("journal_mode"));
        assert!(memory.contains("foreign_keys=ON"));
    }
}
