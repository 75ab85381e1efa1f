use crate::ServerError;
use goconnect_shared::{User, UserId};
use rusqlite::{params, Connection, OptionalExtension};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
      id     INTEGER PRIMARY KEY,
      tenant TEXT NOT NULL,  /* The tenant this user belongs to.            */
      name   TEXT NOT NULL,  /* Display name, unique within the tenant.    */
      UNIQUE(tenant, name)
    )";

pub struct DatabaseUser;

impl DatabaseUser {
    pub fn create(conn: &Connection, tenant: &str, name: &str) -> Result<User, ServerError> {
        conn.execute(
            "INSERT INTO users (tenant, name) VALUES (?1, ?2)",
            params![tenant, name],
        )?;
        Ok(User {
            id: conn.last_insert_rowid(),
            tenant: tenant.to_string(),
            name: name.to_string(),
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<User, rusqlite::Error> {
        Ok(User {
            id: row.get(0)?,
            tenant: row.get(1)?,
            name: row.get(2)?,
        })
    }

    pub fn get(conn: &Connection, id: UserId) -> Result<User, ServerError> {
        conn.query_row(
            "SELECT id, tenant, name FROM users WHERE id = ?1",
            params![id],
            Self::from_row,
        )
        .optional()?
        .ok_or(ServerError::NotFound)
    }
}
