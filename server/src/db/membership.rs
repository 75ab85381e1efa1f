use crate::ServerError;
use goconnect_shared::{
    JoinRequest, Membership, MembershipContents, MembershipRole, MembershipStatus, NetworkId,
    UserId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::{Deref, DerefMut};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS memberships (
      id         INTEGER PRIMARY KEY,
      network_id INTEGER NOT NULL,   /* The network this membership belongs to.         */
      user_id    INTEGER NOT NULL,   /* The member.                                     */
      role       TEXT NOT NULL,      /* owner | admin | member                          */
      status     TEXT NOT NULL,      /* pending | approved | banned                     */
      joined_at  INTEGER NOT NULL,
      banned_at  INTEGER,            /* Set only while status is banned.                */
      ban_reason TEXT,
      UNIQUE(network_id, user_id),
      FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE,
      FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE RESTRICT
    )";

pub static CREATE_JOIN_REQUESTS_SQL: &str = "CREATE TABLE IF NOT EXISTS join_requests (
      id          INTEGER PRIMARY KEY,
      network_id  INTEGER NOT NULL,
      user_id     INTEGER NOT NULL,
      created_at  INTEGER NOT NULL,
      fingerprint TEXT NOT NULL,     /* Idempotency fingerprint of the originating join. */
      UNIQUE(network_id, user_id),
      FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE,
      FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE RESTRICT
    )";

#[derive(Debug)]
pub struct DatabaseMembership {
    pub inner: Membership,
}

impl From<Membership> for DatabaseMembership {
    fn from(inner: Membership) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseMembership {
    type Target = Membership;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseMembership {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseMembership {
    const COLUMNS: &'static str =
        "id, network_id, user_id, role, status, joined_at, banned_at, ban_reason";

    pub fn create(conn: &Connection, contents: MembershipContents) -> Result<Self, ServerError> {
        log::debug!("creating membership {:?}", contents);
        conn.execute(
            "INSERT INTO memberships (network_id, user_id, role, status, joined_at, banned_at, ban_reason)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contents.network_id,
                contents.user_id,
                contents.role.as_str(),
                contents.status.as_str(),
                contents.joined_at,
                contents.banned_at,
                contents.ban_reason,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Membership { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let id = row.get(0)?;
        let network_id = row.get(1)?;
        let user_id = row.get(2)?;
        let role: MembershipRole = row
            .get::<_, String>(3)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let status: MembershipStatus = row
            .get::<_, String>(4)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let joined_at = row.get(5)?;
        let banned_at = row.get(6)?;
        let ban_reason = row.get(7)?;

        Ok(Membership {
            id,
            contents: MembershipContents {
                network_id,
                user_id,
                role,
                status,
                joined_at,
                banned_at,
                ban_reason,
            },
        }
        .into())
    }

    pub fn find(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<Option<Self>, ServerError> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM memberships WHERE network_id = ?1 AND user_id = ?2",
                    Self::COLUMNS
                ),
                params![network_id, user_id],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn get(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<Self, ServerError> {
        Self::find(conn, network_id, user_id)?.ok_or(ServerError::NotFound)
    }

    pub fn set_status(&mut self, conn: &Connection, status: MembershipStatus) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE memberships SET status = ?1, banned_at = NULL, ban_reason = NULL WHERE id = ?2",
            params![status.as_str(), self.id],
        )?;
        self.inner.contents.status = status;
        self.inner.contents.banned_at = None;
        self.inner.contents.ban_reason = None;
        Ok(())
    }

    pub fn ban(
        &mut self,
        conn: &Connection,
        reason: Option<String>,
        now: u64,
    ) -> Result<(), ServerError> {
        conn.execute(
            "UPDATE memberships SET status = 'banned', banned_at = ?1, ban_reason = ?2 WHERE id = ?3",
            params![now, reason, self.id],
        )?;
        self.inner.contents.status = MembershipStatus::Banned;
        self.inner.contents.banned_at = Some(now);
        self.inner.contents.ban_reason = reason;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), ServerError> {
        conn.execute("DELETE FROM memberships WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn list_for_network(
        conn: &Connection,
        network_id: NetworkId,
    ) -> Result<Vec<Membership>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM memberships WHERE network_id = ?1 ORDER BY joined_at",
            Self::COLUMNS
        ))?;
        let memberships = stmt
            .query_map(params![network_id], |row| {
                Self::from_row(row).map(|m| m.inner)
            })?
            .collect::<Result<_, _>>()?;
        Ok(memberships)
    }

    /// Number of approved owners. Every live network must keep this >= 1.
    pub fn count_owners(conn: &Connection, network_id: NetworkId) -> Result<u32, ServerError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM memberships
            WHERE network_id = ?1 AND role = 'owner' AND status = 'approved'",
            params![network_id],
            |row| row.get(0),
        )?)
    }

    pub fn delete_for_network(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        conn.execute(
            "DELETE FROM memberships WHERE network_id = ?1",
            params![network_id],
        )?;
        Ok(())
    }
}

pub struct DatabaseJoinRequest;

impl DatabaseJoinRequest {
    pub fn create(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
        created_at: u64,
        fingerprint: &str,
    ) -> Result<JoinRequest, ServerError> {
        conn.execute(
            "INSERT INTO join_requests (network_id, user_id, created_at, fingerprint)
              VALUES (?1, ?2, ?3, ?4)",
            params![network_id, user_id, created_at, fingerprint],
        )?;
        Ok(JoinRequest {
            id: conn.last_insert_rowid(),
            network_id,
            user_id,
            created_at,
            fingerprint: fingerprint.to_string(),
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<JoinRequest, rusqlite::Error> {
        Ok(JoinRequest {
            id: row.get(0)?,
            network_id: row.get(1)?,
            user_id: row.get(2)?,
            created_at: row.get(3)?,
            fingerprint: row.get(4)?,
        })
    }

    pub fn delete(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<bool, ServerError> {
        let deleted = conn.execute(
            "DELETE FROM join_requests WHERE network_id = ?1 AND user_id = ?2",
            params![network_id, user_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_for_network(
        conn: &Connection,
        network_id: NetworkId,
    ) -> Result<Vec<JoinRequest>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, user_id, created_at, fingerprint
            FROM join_requests WHERE network_id = ?1 ORDER BY created_at",
        )?;
        let requests = stmt
            .query_map(params![network_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(requests)
    }
}
