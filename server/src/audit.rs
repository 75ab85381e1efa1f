//! Append-only audit trail for control-plane mutations.
//!
//! Actor and object identifiers are redacted with a stable hash before they
//! touch storage, so the table can be shipped to external sinks without
//! carrying raw ids.

use crate::ServerError;
use rusqlite::{params, Connection};
use std::fmt::Display;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS audit_events (
      id         INTEGER PRIMARY KEY,
      kind       TEXT NOT NULL,   /* One of the event-kind constants.            */
      actor      TEXT NOT NULL,   /* Redacted id of the acting user.             */
      object     TEXT NOT NULL,   /* Redacted id of the acted-on entity.         */
      attributes TEXT NOT NULL,   /* JSON map of event-specific attributes.      */
      created_at INTEGER NOT NULL
    )";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditKind {
    IpAllocated,
    IpReleased,
    MembershipApproved,
    MembershipDenied,
    MemberKicked,
    MemberBanned,
    MemberUnbanned,
    InviteCreated,
    InviteRedeemed,
    InviteRevoked,
    ProfileRendered,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IpAllocated => "IP_ALLOCATED",
            Self::IpReleased => "IP_RELEASED",
            Self::MembershipApproved => "MEMBERSHIP_APPROVED",
            Self::MembershipDenied => "MEMBERSHIP_DENIED",
            Self::MemberKicked => "MEMBER_KICKED",
            Self::MemberBanned => "MEMBER_BANNED",
            Self::MemberUnbanned => "MEMBER_UNBANNED",
            Self::InviteCreated => "INVITE_CREATED",
            Self::InviteRedeemed => "INVITE_REDEEMED",
            Self::InviteRevoked => "INVITE_REVOKED",
            Self::ProfileRendered => "PROFILE_RENDERED",
        }
    }
}

/// Stable FNV-1a redaction of an identifier. One-way, but consistent across
/// restarts so events about the same entity remain correlatable.
pub fn redact(id: impl Display) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in id.to_string().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

pub fn record(
    conn: &Connection,
    kind: AuditKind,
    actor: impl Display,
    object: impl Display,
    attributes: &[(&str, String)],
) -> Result<(), ServerError> {
    let attributes: serde_json::Map<String, serde_json::Value> = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
        .collect();

    conn.execute(
        "INSERT INTO audit_events (kind, actor, object, attributes, created_at)
          VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            kind.as_str(),
            redact(actor),
            redact(object),
            serde_json::Value::Object(attributes).to_string(),
            goconnect_shared::unix_now(),
        ],
    )?;
    Ok(())
}

/// Number of recorded events of a given kind.
pub fn count(conn: &Connection, kind: AuditKind) -> Result<u32, ServerError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM audit_events WHERE kind = ?1",
        params![kind.as_str()],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_is_stable_and_opaque() {
        assert_eq!(redact(42), redact(42));
        assert_ne!(redact(42), redact(43));
        assert!(!redact("user-42").contains("user-42"));
        assert_eq!(redact("x").len(), 16);
    }

    #[test]
    fn test_record_and_count() -> Result<(), ServerError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute(CREATE_TABLE_SQL, [])?;

        record(
            &conn,
            AuditKind::IpAllocated,
            1,
            "net-1",
            &[("ip", "10.0.0.1".to_string())],
        )?;
        assert_eq!(count(&conn, AuditKind::IpAllocated)?, 1);
        assert_eq!(count(&conn, AuditKind::IpReleased)?, 0);

        // The raw actor id never lands in the table.
        let stored: String =
            conn.query_row("SELECT actor FROM audit_events", [], |row| row.get(0))?;
        assert_eq!(stored, redact(1));
        Ok(())
    }
}
