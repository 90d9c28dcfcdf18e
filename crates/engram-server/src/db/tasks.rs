// crates/engram-server/src/db/tasks.rs
// Background task queue operations

use rusqlite::{Connection, params};

use super::types::TaskRow;
use crate::error::Result;
use crate::utils::{now_ts, to_storage_ts};
use chrono::{Duration, Utc};

/// How long a claimed task stays invisible to other workers. A worker
/// that crashes mid-task simply lets the claim lapse.
const CLAIM_LEASE_SECS: i64 = 120;

/// Backoff ceiling between retries.
const MAX_BACKOFF_SECS: i64 = 3600;

/// Retries before a task is dropped with its last error logged.
pub const MAX_RETRIES: i64 = 10;

pub fn parse_task_row(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        task_body: row.get(2)?,
        retry_at: row.get(3)?,
        retry_count: row.get(4)?,
        last_error: row.get(5)?,
    })
}

/// Enqueue a task, deduplicating on (task_type, task_body): re-enqueueing
/// pulls the retry time forward instead of inserting a twin.
pub fn enqueue_task_sync(conn: &Connection, task_type: &str, task_body: &str) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO tasks (task_type, task_body, retry_at, created_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(task_type, task_body) DO UPDATE SET retry_at = MIN(retry_at, excluded.retry_at)",
        params![task_type, task_body, now],
    )?;
    Ok(())
}

/// Claim up to `limit` due tasks. Claimed rows get their retry_at pushed
/// out by the lease so concurrent workers skip them; completion deletes
/// the row, failure reschedules it.
pub fn claim_due_tasks_sync(conn: &Connection, limit: usize) -> Result<Vec<TaskRow>> {
    let now = now_ts();
    let lease_until = to_storage_ts(Utc::now() + Duration::seconds(CLAIM_LEASE_SECS));

    let tx = conn.unchecked_transaction()?;
    let mut claimed = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT id, task_type, task_body, retry_at, retry_count, last_error
             FROM tasks WHERE retry_at <= ?1
             ORDER BY retry_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit as i64], parse_task_row)?;
        for row in rows {
            claimed.push(row?);
        }
    }
    for task in &claimed {
        tx.execute(
            "UPDATE tasks SET retry_at = ?2 WHERE id = ?1",
            params![task.id, lease_until],
        )?;
    }
    tx.commit()?;
    Ok(claimed)
}

pub fn complete_task_sync(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
    Ok(())
}

/// Reschedule a failed task with exponential backoff, or drop it once the
/// retry budget is spent.
pub fn fail_task_sync(conn: &Connection, task: &TaskRow, error: &str) -> Result<()> {
    let next_count = task.retry_count + 1;
    if next_count >= MAX_RETRIES {
        tracing::warn!(
            task_type = %task.task_type,
            retries = next_count,
            "dropping task after retry budget exhausted: {}",
            error
        );
        conn.execute("DELETE FROM tasks WHERE id = ?1", [task.id])?;
        return Ok(());
    }
    let backoff = (30i64 << next_count.min(7)).min(MAX_BACKOFF_SECS);
    let retry_at = to_storage_ts(Utc::now() + Duration::seconds(backoff));
    conn.execute(
        "UPDATE tasks SET retry_at = ?2, retry_count = ?3, last_error = ?4 WHERE id = ?1",
        params![task.id, retry_at, next_count, error],
    )?;
    Ok(())
}

/// Pending tasks of a type (admin observability: index lag).
pub fn count_pending_tasks_sync(conn: &Connection, task_type_prefix: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE task_type LIKE ?1 || '%'",
        [task_type_prefix],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_enqueue_dedupes() {
        let conn = test_conn();
        enqueue_task_sync(&conn, "index-entry", r#"{"entry_id":"e1"}"#).unwrap();
        enqueue_task_sync(&conn, "index-entry", r#"{"entry_id":"e1"}"#).unwrap();
        enqueue_task_sync(&conn, "index-entry", r#"{"entry_id":"e2"}"#).unwrap();
        assert_eq!(count_pending_tasks_sync(&conn, "index-").unwrap(), 2);
    }

    #[test]
    fn test_claim_leases_out_rows() {
        let conn = test_conn();
        enqueue_task_sync(&conn, "index-entry", r#"{"entry_id":"e1"}"#).unwrap();

        let first = claim_due_tasks_sync(&conn, 10).unwrap();
        assert_eq!(first.len(), 1);

        // Still leased: a second claim sees nothing
        let second = claim_due_tasks_sync(&conn, 10).unwrap();
        assert!(second.is_empty());

        complete_task_sync(&conn, first[0].id).unwrap();
        assert_eq!(count_pending_tasks_sync(&conn, "index-").unwrap(), 0);
    }

    #[test]
    fn test_fail_drops_after_budget() {
        let conn = test_conn();
        enqueue_task_sync(&conn, "index-entry", r#"{"entry_id":"e1"}"#).unwrap();
        let mut task = claim_due_tasks_sync(&conn, 1).unwrap().remove(0);
        for _ in 0..MAX_RETRIES {
            fail_task_sync(&conn, &task, "embedder offline").unwrap();
            task.retry_count += 1;
        }
        assert_eq!(count_pending_tasks_sync(&conn, "index-").unwrap(), 0);
    }
}
