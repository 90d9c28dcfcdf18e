// crates/engram-server/src/db/orgs.rs
// Organization and team operations (derived-access graph)

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::utils::now_ts;

pub fn create_organization_sync(conn: &Connection, id: &str, name: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![id, name, now_ts()],
    )?;
    Ok(())
}

pub fn create_team_sync(
    conn: &Connection,
    id: &str,
    organization_id: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO teams (id, organization_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, organization_id, name, now_ts()],
    )?;
    Ok(())
}

pub fn add_org_member_sync(
    conn: &Connection,
    organization_id: &str,
    user_id: &str,
    role: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO org_members (organization_id, user_id, role) VALUES (?1, ?2, ?3)
         ON CONFLICT(organization_id, user_id) DO UPDATE SET role = excluded.role",
        params![organization_id, user_id, role],
    )?;
    Ok(())
}

pub fn add_team_member_sync(conn: &Connection, team_id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?1, ?2)",
        params![team_id, user_id],
    )?;
    Ok(())
}

/// The user's role in an organization, if any.
pub fn org_role_sync(
    conn: &Connection,
    organization_id: &str,
    user_id: &str,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT role FROM org_members WHERE organization_id = ?1 AND user_id = ?2",
        params![organization_id, user_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn is_team_member_sync(conn: &Connection, team_id: &str, user_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM team_members WHERE team_id = ?1 AND user_id = ?2",
            params![team_id, user_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// The (organization_id, team_id) scope of a group.
pub fn group_scope_sync(
    conn: &Connection,
    group_id: &str,
) -> Result<Option<(Option<String>, Option<String>)>> {
    conn.query_row(
        "SELECT organization_id, team_id FROM conversation_groups WHERE id = ?1",
        [group_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}
