use crate::ServerError;
use goconnect_shared::{Invite, InviteContents, NetworkId};
use rusqlite::{params, Connection, OptionalExtension};
use subtle::ConstantTimeEq;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS invites (
      id         INTEGER PRIMARY KEY,
      network_id INTEGER NOT NULL,            /* The network the token grants entry to.            */
      token      TEXT NOT NULL UNIQUE,        /* Opaque URL-safe token string.                     */
      created_by INTEGER NOT NULL,
      expires_at INTEGER NOT NULL,            /* UNIX time after which the token is dead.          */
      uses_max   INTEGER NOT NULL,
      uses_left  INTEGER NOT NULL,
      revoked    INTEGER DEFAULT 0 NOT NULL,
      FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE,
      FOREIGN KEY (created_by) REFERENCES users (id) ON DELETE RESTRICT
    )";

pub struct DatabaseInvite;

impl DatabaseInvite {
    const COLUMNS: &'static str =
        "id, network_id, token, created_by, expires_at, uses_max, uses_left, revoked";

    pub fn create(conn: &Connection, contents: InviteContents) -> Result<Invite, ServerError> {
        conn.execute(
            "INSERT INTO invites (network_id, token, created_by, expires_at, uses_max, uses_left, revoked)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contents.network_id,
                contents.token,
                contents.created_by,
                contents.expires_at,
                contents.uses_max,
                contents.uses_left,
                contents.revoked,
            ],
        )?;
        Ok(Invite {
            id: conn.last_insert_rowid(),
            contents,
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Invite, rusqlite::Error> {
        Ok(Invite {
            id: row.get(0)?,
            contents: InviteContents {
                network_id: row.get(1)?,
                token: row.get(2)?,
                created_by: row.get(3)?,
                expires_at: row.get(4)?,
                uses_max: row.get(5)?,
                uses_left: row.get(6)?,
                revoked: row.get(7)?,
            },
        })
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Invite, ServerError> {
        conn.query_row(
            &format!("SELECT {} FROM invites WHERE id = ?1", Self::COLUMNS),
            params![id],
            Self::from_row,
        )
        .optional()?
        .ok_or(ServerError::NotFound)
    }

    /// Look up a token by value. The comparison walks every candidate row and
    /// compares in constant time, so lookups don't leak which prefixes exist.
    pub fn find_by_token(conn: &Connection, token: &str) -> Result<Option<Invite>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!("SELECT {} FROM invites", Self::COLUMNS))?;
        let invites = stmt
            .query_map(params![], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(invites.into_iter().find(|invite| {
            bool::from(invite.token.as_bytes().ct_eq(token.as_bytes()))
        }))
    }

    /// Burn one use. Returns false if the token was already exhausted,
    /// revoked, or expired; the decrement and the check are a single
    /// statement so concurrent redemptions cannot over-spend.
    pub fn decrement_uses(conn: &Connection, id: i64, now: u64) -> Result<bool, ServerError> {
        let updated = conn.execute(
            "UPDATE invites SET uses_left = uses_left - 1
            WHERE id = ?1 AND uses_left > 0 AND revoked = 0 AND expires_at > ?2",
            params![id, now],
        )?;
        Ok(updated > 0)
    }

    pub fn revoke(conn: &Connection, id: i64) -> Result<(), ServerError> {
        match conn.execute(
            "UPDATE invites SET uses_left = 0, revoked = 1 WHERE id = ?1",
            params![id],
        )? {
            0 => Err(ServerError::NotFound),
            _ => Ok(()),
        }
    }

    /// Live tokens for a network: not revoked, not expired, with uses left.
    pub fn list_for_network(
        conn: &Connection,
        network_id: NetworkId,
        now: u64,
    ) -> Result<Vec<Invite>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM invites
            WHERE network_id = ?1 AND revoked = 0 AND uses_left > 0 AND expires_at > ?2",
            Self::COLUMNS
        ))?;
        let invites = stmt
            .query_map(params![network_id, now], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(invites)
    }

    pub fn delete_expired(conn: &Connection, now: u64) -> Result<usize, ServerError> {
        Ok(conn.execute(
            "DELETE FROM invites WHERE expires_at < ?1 OR uses_left = 0",
            params![now],
        )?)
    }

    pub fn delete_for_network(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        conn.execute(
            "DELETE FROM invites WHERE network_id = ?1",
            params![network_id],
        )?;
        Ok(())
    }
}
