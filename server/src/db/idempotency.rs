use crate::ServerError;
use rusqlite::{params, Connection, OptionalExtension};

/// How long a recorded outcome stays replayable.
pub const RETENTION_SECS: u64 = 24 * 60 * 60;

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS idempotency (
      component  TEXT NOT NULL,   /* Mutation-bearing component that owns the key.      */
      key        TEXT NOT NULL,   /* Caller-provided idempotency key.                   */
      response   TEXT NOT NULL,   /* JSON of the first successful outcome.              */
      created_at INTEGER NOT NULL,
      PRIMARY KEY (component, key)
    )";

/// Recorded outcomes of mutating calls, replayed verbatim when the same key
/// is presented again. Keys are scoped per component so a membership key can
/// never collide with an invite-redemption key.
pub struct DatabaseIdempotency;

impl DatabaseIdempotency {
    pub fn fetch(
        conn: &Connection,
        component: &str,
        key: &str,
        now: u64,
    ) -> Result<Option<String>, ServerError> {
        Ok(conn
            .query_row(
                "SELECT response FROM idempotency
                WHERE component = ?1 AND key = ?2 AND created_at > ?3",
                params![component, key, now.saturating_sub(RETENTION_SECS)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn store(
        conn: &Connection,
        component: &str,
        key: &str,
        response: &str,
        now: u64,
    ) -> Result<(), ServerError> {
        // First outcome wins; replays of an in-flight race keep the original.
        conn.execute(
            "INSERT OR IGNORE INTO idempotency (component, key, response, created_at)
              VALUES (?1, ?2, ?3, ?4)",
            params![component, key, response, now],
        )?;
        Ok(())
    }

    pub fn sweep(conn: &Connection, now: u64) -> Result<usize, ServerError> {
        Ok(conn.execute(
            "DELETE FROM idempotency WHERE created_at <= ?1",
            params![now.saturating_sub(RETENTION_SECS)],
        )?)
    }
}
