// crates/engram-server/src/db/events.rs
// Episodic memory event log (immutable, append-only)

use rusqlite::{Connection, params};

use super::types::MemoryEventRow;
use crate::error::Result;

pub fn parse_event_row(row: &rusqlite::Row) -> rusqlite::Result<MemoryEventRow> {
    Ok(MemoryEventRow {
        id: row.get(0)?,
        encoded_namespace: row.get(1)?,
        key: row.get(2)?,
        kind: row.get(3)?,
        occurred_at: row.get(4)?,
        value_snapshot: row.get(5)?,
        attributes_snapshot: row.get(6)?,
    })
}

const EVENT_COLS: &str =
    "id, encoded_namespace, key, kind, occurred_at, value_snapshot, attributes_snapshot";

pub fn append_event_sync(conn: &Connection, event: &MemoryEventRow) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_events (id, encoded_namespace, key, kind, occurred_at,
            value_snapshot, attributes_snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.id,
            event.encoded_namespace,
            event.key,
            event.kind,
            event.occurred_at,
            event.value_snapshot,
            event.attributes_snapshot,
        ],
    )?;
    Ok(())
}

/// Filters for the event log listing. The cursor is the (occurred_at, id)
/// pair of the last event already seen.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub encoded_prefix: Option<String>,
    pub kinds: Option<Vec<String>>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub after_cursor: Option<(String, String)>,
    pub limit: usize,
}

pub fn list_events_sync(conn: &Connection, filter: &EventFilter) -> Result<Vec<MemoryEventRow>> {
    // Kinds become a dynamic IN list; everything else binds positionally
    // after it.
    let kinds = filter.kinds.clone().unwrap_or_default();
    let kind_clause = if kinds.is_empty() {
        String::new()
    } else {
        let placeholders = (0..kinds.len())
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        format!("AND kind IN ({placeholders})")
    };
    let base = kinds.len();
    let sql = format!(
        "SELECT {EVENT_COLS} FROM memory_events
         WHERE 1=1
           {kind_clause}
           AND (?{p1} IS NULL OR encoded_namespace = ?{p1} OR encoded_namespace LIKE ?{p1} || ?{p2} || '%')
           AND (?{p3} IS NULL OR occurred_at < ?{p3})
           AND (?{p4} IS NULL OR occurred_at > ?{p4})
           AND (?{p5} IS NULL OR (occurred_at, id) > (?{p5}, ?{p6}))
         ORDER BY occurred_at, id
         LIMIT ?{p7}",
        p1 = base + 1,
        p2 = base + 2,
        p3 = base + 3,
        p4 = base + 4,
        p5 = base + 5,
        p6 = base + 6,
        p7 = base + 7,
    );

    let (cursor_ts, cursor_id) = match &filter.after_cursor {
        Some((ts, id)) => (Some(ts.clone()), Some(id.clone())),
        None => (None, None),
    };

    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    for kind in &kinds {
        values.push(Box::new(kind.clone()));
    }
    values.push(Box::new(filter.encoded_prefix.clone()));
    values.push(Box::new("\u{1e}".to_string()));
    values.push(Box::new(filter.before.clone()));
    values.push(Box::new(filter.after.clone()));
    values.push(Box::new(cursor_ts));
    values.push(Box::new(cursor_id));
    values.push(Box::new(filter.limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let rows = stmt.query_map(params_ref.as_slice(), parse_event_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::run_all_migrations(&conn).unwrap();
        conn
    }

    fn event(id: &str, ns: &str, kind: &str, ts: &str) -> MemoryEventRow {
        MemoryEventRow {
            id: id.to_string(),
            encoded_namespace: ns.to_string(),
            key: "k".to_string(),
            kind: kind.to_string(),
            occurred_at: ts.to_string(),
            value_snapshot: None,
            attributes_snapshot: None,
        }
    }

    #[test]
    fn test_list_with_kinds_and_cursor() {
        let conn = test_conn();
        append_event_sync(&conn, &event("e1", "ns", "add", "2026-01-01T00:00:01Z")).unwrap();
        append_event_sync(&conn, &event("e2", "ns", "update", "2026-01-01T00:00:02Z")).unwrap();
        append_event_sync(&conn, &event("e3", "ns", "delete", "2026-01-01T00:00:03Z")).unwrap();

        let filter = EventFilter {
            kinds: Some(vec!["add".into(), "update".into()]),
            limit: 10,
            ..Default::default()
        };
        let rows = list_events_sync(&conn, &filter).unwrap();
        assert_eq!(rows.len(), 2);

        let filter = EventFilter {
            after_cursor: Some(("2026-01-01T00:00:01Z".into(), "e1".into())),
            limit: 10,
            ..Default::default()
        };
        let rows = list_events_sync(&conn, &filter).unwrap();
        let ids: Vec<&str> = rows.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3"]);
    }

    #[test]
    fn test_prefix_filter_separator_safe() {
        let conn = test_conn();
        append_event_sync(&conn, &event("e1", "user\u{1e}alice", "add", "2026-01-01T00:00:01Z"))
            .unwrap();
        append_event_sync(&conn, &event("e2", "user\u{1e}aliced", "add", "2026-01-01T00:00:02Z"))
            .unwrap();

        let filter = EventFilter {
            encoded_prefix: Some("user\u{1e}alice".into()),
            limit: 10,
            ..Default::default()
        };
        let rows = list_events_sync(&conn, &filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "e1");
    }
}
