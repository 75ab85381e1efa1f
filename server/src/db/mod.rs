use rusqlite::Connection;

pub mod allocation;
pub mod device;
pub mod idempotency;
pub mod invite;
pub mod membership;
pub mod network;
pub mod peer;
pub mod user;

pub use allocation::{DatabaseAllocation, DatabaseAllocator};
pub use device::DatabaseDevice;
pub use idempotency::DatabaseIdempotency;
pub use invite::DatabaseInvite;
pub use membership::{DatabaseJoinRequest, DatabaseMembership};
pub use network::DatabaseNetwork;
pub use peer::DatabasePeer;
pub use user::DatabaseUser;

pub fn init(conn: &Connection) -> Result<(), rusqlite::Error> {
    for sql in [
        user::CREATE_TABLE_SQL,
        network::CREATE_TABLE_SQL,
        membership::CREATE_TABLE_SQL,
        membership::CREATE_JOIN_REQUESTS_SQL,
        device::CREATE_TABLE_SQL,
        peer::CREATE_TABLE_SQL,
        invite::CREATE_TABLE_SQL,
        allocation::CREATE_TABLE_SQL,
        allocation::CREATE_ALLOCATORS_SQL,
        allocation::CREATE_FREED_OFFSETS_SQL,
        idempotency::CREATE_TABLE_SQL,
        crate::audit::CREATE_TABLE_SQL,
    ] {
        conn.execute(sql, [])?;
    }
    Ok(())
}
