use crate::ServerError;
use goconnect_shared::{DeviceId, NetworkId, Peer, PeerContents, UserId};
use ipnet::Ipv4Net;
use rusqlite::{params, Connection, OptionalExtension};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS peers (
      id         INTEGER PRIMARY KEY,
      network_id INTEGER NOT NULL,            /* The network this peer participates in.            */
      device_id  INTEGER NOT NULL,            /* The backing device.                               */
      tenant     TEXT NOT NULL,
      public_key TEXT NOT NULL,               /* Copied from the device at registration.           */
      allowed_ip TEXT NOT NULL,               /* The /32 of the owning user's allocated address.   */
      endpoint   TEXT,                        /* The optional external endpoint ([ip]:[port]).     */
      is_active  INTEGER DEFAULT 1 NOT NULL,
      UNIQUE(network_id, device_id),
      FOREIGN KEY (network_id) REFERENCES networks (id) ON DELETE CASCADE,
      FOREIGN KEY (device_id) REFERENCES devices (id) ON DELETE CASCADE
    )";

pub struct DatabasePeer;

impl DatabasePeer {
    pub fn create(conn: &Connection, contents: PeerContents) -> Result<Peer, ServerError> {
        log::debug!("creating peer {:?}", contents);
        conn.execute(
            "INSERT INTO peers (network_id, device_id, tenant, public_key, allowed_ip, endpoint, is_active)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contents.network_id,
                contents.device_id,
                contents.tenant,
                contents.public_key,
                contents.allowed_ip.to_string(),
                contents.endpoint.as_ref().map(|endpoint| endpoint.to_string()),
                contents.is_active,
            ],
        )?;
        Ok(Peer {
            id: conn.last_insert_rowid(),
            contents,
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Peer, rusqlite::Error> {
        let allowed_ip: Ipv4Net = row
            .get::<_, String>(5)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let endpoint = row
            .get::<_, Option<String>>(6)?
            .and_then(|endpoint| endpoint.parse().ok());
        Ok(Peer {
            id: row.get(0)?,
            contents: PeerContents {
                network_id: row.get(1)?,
                device_id: row.get(2)?,
                tenant: row.get(3)?,
                public_key: row.get(4)?,
                allowed_ip,
                endpoint,
                is_active: row.get(7)?,
            },
        })
    }

    pub fn find(
        conn: &Connection,
        network_id: NetworkId,
        device_id: DeviceId,
    ) -> Result<Option<Peer>, ServerError> {
        Ok(conn
            .query_row(
                "SELECT id, network_id, device_id, tenant, public_key, allowed_ip, endpoint, is_active
                FROM peers WHERE network_id = ?1 AND device_id = ?2",
                params![network_id, device_id],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn list_active(conn: &Connection, network_id: NetworkId) -> Result<Vec<Peer>, ServerError> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, device_id, tenant, public_key, allowed_ip, endpoint, is_active
            FROM peers WHERE network_id = ?1 AND is_active = 1",
        )?;
        let peers = stmt
            .query_map(params![network_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(peers)
    }

    /// Deactivate every peer backed by one of `user_id`'s devices in the
    /// network, used when the user loses their membership.
    pub fn deactivate_for_user(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<usize, ServerError> {
        Ok(conn.execute(
            "UPDATE peers SET is_active = 0
            WHERE network_id = ?1
              AND device_id IN (SELECT id FROM devices WHERE user_id = ?2)",
            params![network_id, user_id],
        )?)
    }

    pub fn delete_for_network(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        conn.execute("DELETE FROM peers WHERE network_id = ?1", params![network_id])?;
        Ok(())
    }
}
