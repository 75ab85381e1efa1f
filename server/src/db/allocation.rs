use crate::ServerError;
use goconnect_shared::{Allocation, AllocationContents, NetworkId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS allocations (
      id         INTEGER PRIMARY KEY,
      network_id INTEGER NOT NULL,   /* The network the address lives in.               */
      user_id    INTEGER NOT NULL,   /* The user the address is bound to.               */
      offset     INTEGER NOT NULL,   /* Host offset within the network range.           */
      ip         TEXT NOT NULL,      /* Materialized IPv4, base + offset + 1.           */
      UNIQUE(network_id, user_id),
      UNIQUE(network_id, offset),
      FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE
    )";

pub static CREATE_ALLOCATORS_SQL: &str = "CREATE TABLE IF NOT EXISTS allocators (
      network_id  INTEGER PRIMARY KEY,  /* One allocator per network.                   */
      next_offset INTEGER NOT NULL      /* Next monotonic offset to hand out.           */
    )";

pub static CREATE_FREED_OFFSETS_SQL: &str = "CREATE TABLE IF NOT EXISTS freed_offsets (
      id         INTEGER PRIMARY KEY AUTOINCREMENT,  /* Insertion order carries the LIFO discipline. */
      network_id INTEGER NOT NULL,
      offset     INTEGER NOT NULL,
      UNIQUE(network_id, offset)
    )";

pub struct DatabaseAllocation;

impl DatabaseAllocation {
    pub fn create(conn: &Connection, contents: AllocationContents) -> Result<Allocation, ServerError> {
        conn.execute(
            "INSERT INTO allocations (network_id, user_id, offset, ip) VALUES (?1, ?2, ?3, ?4)",
            params![
                contents.network_id,
                contents.user_id,
                contents.offset,
                contents.ip.to_string(),
            ],
        )?;
        Ok(Allocation {
            id: conn.last_insert_rowid(),
            contents,
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Allocation, rusqlite::Error> {
        let ip = row
            .get::<_, String>(4)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        Ok(Allocation {
            id: row.get(0)?,
            contents: AllocationContents {
                network_id: row.get(1)?,
                user_id: row.get(2)?,
                offset: row.get(3)?,
                ip,
            },
        })
    }

    pub fn find(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<Option<Allocation>, ServerError> {
        Ok(conn
            .query_row(
                "SELECT id, network_id, user_id, offset, ip FROM allocations
                WHERE network_id = ?1 AND user_id = ?2",
                params![network_id, user_id],
                Self::from_row,
            )
            .optional()?)
    }

    /// Remove the binding, returning the freed offset if one existed.
    pub fn delete(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<Option<u32>, ServerError> {
        let offset = conn
            .query_row(
                "SELECT offset FROM allocations WHERE network_id = ?1 AND user_id = ?2",
                params![network_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if offset.is_some() {
            conn.execute(
                "DELETE FROM allocations WHERE network_id = ?1 AND user_id = ?2",
                params![network_id, user_id],
            )?;
        }
        Ok(offset)
    }

    pub fn list_for_network(
        conn: &Connection,
        network_id: NetworkId,
    ) -> Result<Vec<Allocation>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, user_id, offset, ip FROM allocations
            WHERE network_id = ?1 ORDER BY offset",
        )?;
        let allocations = stmt
            .query_map(params![network_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(allocations)
    }

    pub fn clear_network(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        conn.execute(
            "DELETE FROM allocations WHERE network_id = ?1",
            params![network_id],
        )?;
        Ok(())
    }
}

/// Persistent allocator state: the monotonic next-offset and the LIFO stack
/// of released offsets.
pub struct DatabaseAllocator;

impl DatabaseAllocator {
    pub fn next_offset(conn: &Connection, network_id: NetworkId) -> Result<u32, ServerError> {
        Ok(conn
            .query_row(
                "SELECT next_offset FROM allocators WHERE network_id = ?1",
                params![network_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    pub fn set_next_offset(
        conn: &Connection,
        network_id: NetworkId,
        next_offset: u32,
    ) -> Result<(), ServerError> {
        conn.execute(
            "INSERT INTO allocators (network_id, next_offset) VALUES (?1, ?2)
              ON CONFLICT(network_id) DO UPDATE SET next_offset = ?2",
            params![network_id, next_offset],
        )?;
        Ok(())
    }

    /// Pop the most recently freed offset, if any.
    pub fn pop_freed(conn: &Connection, network_id: NetworkId) -> Result<Option<u32>, ServerError> {
        let row = conn
            .query_row(
                "SELECT id, offset FROM freed_offsets WHERE network_id = ?1
                ORDER BY id DESC LIMIT 1",
                params![network_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        if let Some((id, offset)) = row {
            conn.execute("DELETE FROM freed_offsets WHERE id = ?1", params![id])?;
            Ok(Some(offset))
        } else {
            Ok(None)
        }
    }

    pub fn push_freed(
        conn: &Connection,
        network_id: NetworkId,
        offset: u32,
    ) -> Result<(), ServerError> {
        conn.execute(
            "INSERT INTO freed_offsets (network_id, offset) VALUES (?1, ?2)",
            params![network_id, offset],
        )?;
        Ok(())
    }

    pub fn reset(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        conn.execute(
            "DELETE FROM allocators WHERE network_id = ?1",
            params![network_id],
        )?;
        conn.execute(
            "DELETE FROM freed_offsets WHERE network_id = ?1",
            params![network_id],
        )?;
        Ok(())
    }
}
