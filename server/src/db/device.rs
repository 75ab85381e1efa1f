use crate::ServerError;
use goconnect_shared::{Device, DeviceContents, DeviceId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS devices (
      id         INTEGER PRIMARY KEY,
      user_id    INTEGER NOT NULL,   /* The owning user.                                */
      tenant     TEXT NOT NULL,
      name       TEXT NOT NULL,      /* Display name in canonical hostname(7) format.   */
      public_key TEXT NOT NULL,      /* Server-visible half of the device key pair.     */
      created_at INTEGER NOT NULL,
      UNIQUE(tenant, public_key),
      FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE RESTRICT
    )";

pub struct DatabaseDevice;

impl DatabaseDevice {
    pub fn create(conn: &Connection, contents: DeviceContents) -> Result<Device, ServerError> {
        log::debug!("creating device {:?}", contents);
        conn.execute(
            "INSERT INTO devices (user_id, tenant, name, public_key, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                contents.user_id,
                contents.tenant,
                contents.name,
                contents.public_key,
                contents.created_at,
            ],
        )?;
        Ok(Device {
            id: conn.last_insert_rowid(),
            contents,
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Device, rusqlite::Error> {
        Ok(Device {
            id: row.get(0)?,
            contents: DeviceContents {
                user_id: row.get(1)?,
                tenant: row.get(2)?,
                name: row.get(3)?,
                public_key: row.get(4)?,
                created_at: row.get(5)?,
            },
        })
    }

    /// Fetch a device only if it belongs to the caller's tenant.
    pub fn get_scoped(
        conn: &Connection,
        id: DeviceId,
        tenant: &str,
    ) -> Result<Device, ServerError> {
        conn.query_row(
            "SELECT id, user_id, tenant, name, public_key, created_at
            FROM devices WHERE id = ?1 AND tenant = ?2",
            params![id, tenant],
            Self::from_row,
        )
        .optional()?
        .ok_or(ServerError::NotFound)
    }

    pub fn list_for_user(conn: &Connection, user_id: UserId) -> Result<Vec<Device>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, tenant, name, public_key, created_at
            FROM devices WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let devices = stmt
            .query_map(params![user_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(devices)
    }
}
