use crate::ServerError;
use goconnect_shared::{
    is_valid_name, JoinPolicy, Network, NetworkContents, NetworkId, UserId, Visibility,
};
use ipnet::Ipv4Net;
use rusqlite::{params, Connection, OptionalExtension};

pub static CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS networks (
      id          INTEGER PRIMARY KEY,
      tenant      TEXT NOT NULL,                /* The owning tenant.                                  */
      name        TEXT NOT NULL,                /* Canonical name, unique within the tenant.           */
      ip          TEXT NOT NULL,                /* Base address of the network CIDR.                   */
      prefix      INTEGER NOT NULL,             /* Prefix length of the network CIDR.                  */
      visibility  TEXT NOT NULL,                /* public | private                                    */
      join_policy TEXT NOT NULL,                /* open | approval | invite_only                       */
      dns         TEXT,                         /* Optional comma-separated resolver list.             */
      created_by  INTEGER NOT NULL,             /* The creating user, who becomes the first owner.     */
      created_at  INTEGER NOT NULL,
      UNIQUE(tenant, name),
      FOREIGN KEY (created_by)
         REFERENCES users (id)
            ON UPDATE RESTRICT
            ON DELETE RESTRICT
    )";

pub struct DatabaseNetwork;

impl DatabaseNetwork {
    pub fn create(conn: &Connection, contents: NetworkContents) -> Result<Network, ServerError> {
        log::debug!("creating network {:?}", contents);

        if !is_valid_name(&contents.name) {
            log::warn!("network name is invalid, must conform to hostname(7) requirements.");
            return Err(ServerError::Validation(
                "network name must be a valid hostname label".to_string(),
            ));
        }

        // A usable network needs at least 4 addresses: network, broadcast,
        // and two assignable hosts.
        if contents.cidr.prefix_len() > 30 {
            return Err(ServerError::Validation(
                "network CIDR must contain at least 4 addresses (/30 or wider)".to_string(),
            ));
        }

        if contents.cidr.addr() != contents.cidr.network() {
            return Err(ServerError::Validation(
                "network CIDR must start at its network address".to_string(),
            ));
        }

        conn.execute(
            "INSERT INTO networks (tenant, name, ip, prefix, visibility, join_policy, dns, created_by, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                contents.tenant,
                contents.name,
                contents.cidr.addr().to_string(),
                contents.cidr.prefix_len() as i32,
                contents.visibility.as_str(),
                contents.join_policy.as_str(),
                contents.dns,
                contents.created_by,
                contents.created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Network { id, contents })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Network, rusqlite::Error> {
        let id = row.get(0)?;
        let tenant = row.get(1)?;
        let name = row.get(2)?;
        let ip_str: String = row.get(3)?;
        let prefix = row.get(4)?;
        let ip = ip_str
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let cidr = Ipv4Net::new(ip, prefix).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let visibility: Visibility = row
            .get::<_, String>(5)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let join_policy: JoinPolicy = row
            .get::<_, String>(6)?
            .parse()
            .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let dns = row.get(7)?;
        let created_by = row.get(8)?;
        let created_at = row.get(9)?;

        Ok(Network {
            id,
            contents: NetworkContents {
                tenant,
                name,
                cidr,
                visibility,
                join_policy,
                dns,
                created_by,
                created_at,
            },
        })
    }

    const COLUMNS: &'static str =
        "id, tenant, name, ip, prefix, visibility, join_policy, dns, created_by, created_at";

    pub fn get(conn: &Connection, id: NetworkId) -> Result<Network, ServerError> {
        conn.query_row(
            &format!("SELECT {} FROM networks WHERE id = ?1", Self::COLUMNS),
            params![id],
            Self::from_row,
        )
        .optional()?
        .ok_or(ServerError::NotFound)
    }

    /// Fetch a network only if it belongs to the caller's tenant. Cross-tenant
    /// probes surface as `NotFound` to avoid existence leaks.
    pub fn get_scoped(
        conn: &Connection,
        id: NetworkId,
        tenant: &str,
    ) -> Result<Network, ServerError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM networks WHERE id = ?1 AND tenant = ?2",
                Self::COLUMNS
            ),
            params![id, tenant],
            Self::from_row,
        )
        .optional()?
        .ok_or(ServerError::NotFound)
    }

    /// All networks the given user may see: public ones in their tenant, plus
    /// private ones they hold a membership in.
    pub fn list_visible(
        conn: &Connection,
        tenant: &str,
        user_id: UserId,
    ) -> Result<Vec<Network>, ServerError> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM networks
            WHERE tenant = ?1
              AND (visibility = 'public'
                   OR EXISTS (SELECT 1 FROM memberships
                              WHERE memberships.network_id = networks.id
                                AND memberships.user_id = ?2))",
            Self::COLUMNS
        ))?;
        let networks = stmt
            .query_map(params![tenant, user_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(networks)
    }

    pub fn delete(conn: &Connection, id: NetworkId) -> Result<(), ServerError> {
        conn.execute("DELETE FROM networks WHERE id = ?1", params![id])?;
        Ok(())
    }
}
