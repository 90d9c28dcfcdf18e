// crates/engram-server/src/authz/mod.rs
// Access resolution over the (membership, org, team) graph

pub mod policy;

use rusqlite::Connection;

use engram_types::AccessLevel;

use crate::db::{group_scope_sync, is_team_member_sync, membership_level_sync, org_role_sync};
use crate::error::{EngramError, Result};

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub client_id: Option<String>,
    /// Orthogonal admin role from the static allow-lists; bypasses group
    /// levels on admin-routed endpoints only.
    pub admin: bool,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), client_id: None, admin: false }
    }
}

/// Effective access level of a user on a group: the maximum of the
/// explicit membership, MANAGER via org owner/admin, and WRITER via team
/// membership. None means no access at all.
pub fn effective_level_sync(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> Result<Option<AccessLevel>> {
    let mut best: Option<AccessLevel> = membership_level_sync(conn, group_id, user_id)?
        .and_then(AccessLevel::from_rank);

    if let Some((org_id, team_id)) = group_scope_sync(conn, group_id)? {
        if let Some(org_id) = org_id {
            if let Some(role) = org_role_sync(conn, &org_id, user_id)? {
                if role == "owner" || role == "admin" {
                    best = max_level(best, AccessLevel::Manager);
                }
            }
        }
        if let Some(team_id) = team_id {
            if is_team_member_sync(conn, &team_id, user_id)? {
                best = max_level(best, AccessLevel::Writer);
            }
        }
    }

    Ok(best)
}

fn max_level(current: Option<AccessLevel>, candidate: AccessLevel) -> Option<AccessLevel> {
    match current {
        Some(level) if level >= candidate => Some(level),
        _ => Some(candidate),
    }
}

/// Demand at least `needed`, surfacing Forbidden otherwise.
pub fn require_level(
    found: Option<AccessLevel>,
    needed: AccessLevel,
    what: &str,
) -> Result<AccessLevel> {
    match found {
        Some(level) if level >= needed => Ok(level),
        Some(_) => Err(EngramError::Forbidden(format!(
            "{needed:?} access required to {what}"
        ))),
        None => Err(EngramError::NotFound(format!(
            "no such resource (or no access) for {what}"
        ))),
    }
}

/// Best-effort mirror of membership mutations into an external
/// authorization engine. The experimental backend is dual-write,
/// best-effort; the default mirror does nothing.
pub trait AuthzMirror: Send + Sync {
    fn membership_changed(&self, group_id: &str, user_id: &str, level: Option<AccessLevel>);
}

pub struct NoopMirror;

impl AuthzMirror for NoopMirror {
    fn membership_changed(&self, _group_id: &str, _user_id: &str, _level: Option<AccessLevel>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        add_org_member_sync, add_team_member_sync, create_organization_sync, create_team_sync,
        upsert_membership_sync,
    };

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::run_all_migrations(&conn).unwrap();
        conn
    }

    fn group_scoped(conn: &Connection, group: &str, org: Option<&str>, team: Option<&str>) {
        conn.execute(
            "INSERT INTO conversation_groups (id, organization_id, team_id, created_at)
             VALUES (?1, ?2, ?3, '2026-01-01T00:00:00Z')",
            rusqlite::params![group, org, team],
        )
        .unwrap();
    }

    #[test]
    fn test_explicit_membership_wins_when_higher() {
        let conn = test_conn();
        group_scoped(&conn, "g1", None, None);
        upsert_membership_sync(&conn, "g1", "alice", 4).unwrap();
        assert_eq!(
            effective_level_sync(&conn, "g1", "alice").unwrap(),
            Some(AccessLevel::Owner)
        );
        assert_eq!(effective_level_sync(&conn, "g1", "bob").unwrap(), None);
    }

    #[test]
    fn test_org_admin_derives_manager() {
        let conn = test_conn();
        create_organization_sync(&conn, "org1", Some("acme")).unwrap();
        add_org_member_sync(&conn, "org1", "bob", "admin").unwrap();
        add_org_member_sync(&conn, "org1", "carol", "member").unwrap();
        group_scoped(&conn, "g1", Some("org1"), None);

        assert_eq!(
            effective_level_sync(&conn, "g1", "bob").unwrap(),
            Some(AccessLevel::Manager)
        );
        // Plain org members derive nothing
        assert_eq!(effective_level_sync(&conn, "g1", "carol").unwrap(), None);
    }

    #[test]
    fn test_team_member_derives_writer_and_max_wins() {
        let conn = test_conn();
        create_team_sync(&conn, "team1", None, Some("search")).unwrap();
        add_team_member_sync(&conn, "team1", "dave").unwrap();
        group_scoped(&conn, "g1", None, Some("team1"));

        assert_eq!(
            effective_level_sync(&conn, "g1", "dave").unwrap(),
            Some(AccessLevel::Writer)
        );

        // An explicit READER membership does not drag a derived WRITER down
        upsert_membership_sync(&conn, "g1", "dave", 1).unwrap();
        assert_eq!(
            effective_level_sync(&conn, "g1", "dave").unwrap(),
            Some(AccessLevel::Writer)
        );
    }

    #[test]
    fn test_require_level() {
        assert!(require_level(Some(AccessLevel::Writer), AccessLevel::Writer, "append").is_ok());
        assert!(matches!(
            require_level(Some(AccessLevel::Reader), AccessLevel::Writer, "append"),
            Err(EngramError::Forbidden(_))
        ));
        // No visibility at all reads as NotFound, not Forbidden
        assert!(matches!(
            require_level(None, AccessLevel::Reader, "read"),
            Err(EngramError::NotFound(_))
        ));
    }
}
