//! Per-network IPv4 address allocation.
//!
//! Each network carries a monotonic `next_offset` plus a LIFO stack of
//! released offsets. Offsets materialize as `base + offset + 1`, skipping the
//! network address; the broadcast address falls outside the assignable range
//! by construction.

use crate::{
    audit::{self, AuditKind},
    db::{DatabaseAllocation, DatabaseAllocator, DatabaseNetwork},
    membership::MembershipObserver,
    Db, ServerError,
};
use goconnect_shared::{Allocation, AllocationContents, Network, NetworkId, UserId};
use rusqlite::Connection;
use std::net::Ipv4Addr;

pub struct Ipam {
    db: Db,
}

fn offset_to_ip(network: &Network, offset: u32) -> Ipv4Addr {
    let base = u32::from(network.cidr.network());
    Ipv4Addr::from(base + offset + 1)
}

impl Ipam {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Hand `user_id` an address in the network, or return the existing
    /// binding unchanged. Only a first-time allocation emits an audit event.
    pub fn allocate(&self, network_id: NetworkId, user_id: UserId) -> Result<Allocation, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get(&conn, network_id)?;
        Self::allocate_in(&conn, &network, user_id)
    }

    pub(crate) fn allocate_in(
        conn: &Connection,
        network: &Network,
        user_id: UserId,
    ) -> Result<Allocation, ServerError> {
        if let Some(existing) = DatabaseAllocation::find(conn, network.id, user_id)? {
            return Ok(existing);
        }

        let offset = match DatabaseAllocator::pop_freed(conn, network.id)? {
            Some(offset) => offset,
            None => {
                let next = DatabaseAllocator::next_offset(conn, network.id)?;
                if next >= network.host_capacity() {
                    log::warn!("network {} has no addresses left", network.id);
                    return Err(ServerError::IpExhausted);
                }
                DatabaseAllocator::set_next_offset(conn, network.id, next + 1)?;
                next
            },
        };

        let ip = offset_to_ip(network, offset);
        let allocation = DatabaseAllocation::create(
            conn,
            AllocationContents {
                network_id: network.id,
                user_id,
                offset,
                ip,
            },
        )?;
        log::info!("allocated {} (offset {}) in network {}", ip, offset, network.id);
        audit::record(
            conn,
            AuditKind::IpAllocated,
            user_id,
            network.id,
            &[("ip", ip.to_string()), ("offset", offset.to_string())],
        )?;

        Ok(allocation)
    }

    /// Release the caller's own binding. Succeeds as a no-op when nothing is
    /// allocated.
    pub fn release(&self, network_id: NetworkId, user_id: UserId) -> Result<(), ServerError> {
        let conn = self.db.lock();
        Self::release_in(&conn, network_id, user_id, user_id)
    }

    /// Release another user's binding on their behalf; the audit event then
    /// carries a `released_for` attribute naming the affected user.
    pub fn release_for(
        &self,
        actor: UserId,
        network_id: NetworkId,
        user_id: UserId,
    ) -> Result<(), ServerError> {
        let conn = self.db.lock();
        Self::release_in(&conn, network_id, user_id, actor)
    }

    pub(crate) fn release_in(
        conn: &Connection,
        network_id: NetworkId,
        user_id: UserId,
        actor: UserId,
    ) -> Result<(), ServerError> {
        let offset = match DatabaseAllocation::delete(conn, network_id, user_id)? {
            Some(offset) => offset,
            None => return Ok(()),
        };
        DatabaseAllocator::push_freed(conn, network_id, offset)?;
        log::info!("released offset {} in network {}", offset, network_id);

        let mut attributes = vec![("offset", offset.to_string())];
        if actor != user_id {
            attributes.push(("released_for", audit::redact(user_id)));
        }
        audit::record(conn, AuditKind::IpReleased, actor, network_id, &attributes)?;
        Ok(())
    }

    /// Drop every binding and reset allocator state, for network teardown.
    pub fn release_all(&self, network_id: NetworkId) -> Result<(), ServerError> {
        let conn = self.db.lock();
        Self::release_all_in(&conn, network_id)
    }

    pub(crate) fn release_all_in(conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        DatabaseAllocation::clear_network(conn, network_id)?;
        DatabaseAllocator::reset(conn, network_id)?;
        log::info!("cleared all allocations in network {}", network_id);
        Ok(())
    }

    pub fn get(&self, network_id: NetworkId, user_id: UserId) -> Result<Option<Allocation>, ServerError> {
        let conn = self.db.lock();
        DatabaseAllocation::find(&conn, network_id, user_id)
    }
}

impl MembershipObserver for Ipam {
    fn member_approved(
        &self,
        conn: &Connection,
        network: &Network,
        user_id: UserId,
    ) -> Result<(), ServerError> {
        Self::allocate_in(conn, network, user_id)?;
        Ok(())
    }

    fn member_removed(
        &self,
        conn: &Connection,
        network: &Network,
        user_id: UserId,
        actor: UserId,
    ) -> Result<(), ServerError> {
        Self::release_in(conn, network.id, user_id, actor)
    }

    fn network_torn_down(&self, conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        Self::release_all_in(conn, network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audit, test};
    use anyhow::Result;

    #[test]
    fn test_first_allocation_skips_network_address() -> Result<()> {
        let server = test::Server::new()?;

        let allocation = server.ctx.ipam.allocate(server.open_net.id, server.user1.id)?;
        assert_eq!(allocation.ip, "10.10.0.1".parse::<std::net::Ipv4Addr>()?);
        assert_eq!(allocation.offset, 0);
        Ok(())
    }

    #[test]
    fn test_allocate_is_idempotent_and_audits_once() -> Result<()> {
        let server = test::Server::new()?;
        let ipam = &server.ctx.ipam;

        let first = ipam.allocate(server.open_net.id, server.user1.id)?;
        let second = ipam.allocate(server.open_net.id, server.user1.id)?;
        assert_eq!(first, second);

        let conn = server.ctx.db.lock();
        assert_eq!(audit::count(&conn, audit::AuditKind::IpAllocated)?, 1);
        Ok(())
    }

    #[test]
    fn test_released_offset_is_reused_lifo() -> Result<()> {
        let server = test::Server::new()?;
        let ipam = &server.ctx.ipam;
        let net = server.open_net.id;

        assert_eq!(ipam.allocate(net, server.user1.id)?.ip.to_string(), "10.10.0.1");
        assert_eq!(ipam.allocate(net, server.user2.id)?.ip.to_string(), "10.10.0.2");
        assert_eq!(ipam.allocate(net, server.user3.id)?.ip.to_string(), "10.10.0.3");

        ipam.release(net, server.user2.id)?;

        // The freed offset comes back before the monotonic frontier moves.
        assert_eq!(ipam.allocate(net, server.user4.id)?.ip.to_string(), "10.10.0.2");
        assert_eq!(ipam.allocate(net, server.admin.id)?.ip.to_string(), "10.10.0.4");
        Ok(())
    }

    #[test]
    fn test_slash_30_admits_exactly_two_hosts() -> Result<()> {
        let server = test::Server::new()?;
        let network = server.create_network("tiny", "10.99.0.0/30", goconnect_shared::JoinPolicy::Open)?;
        let ipam = &server.ctx.ipam;

        assert_eq!(ipam.allocate(network.id, server.user1.id)?.ip.to_string(), "10.99.0.1");
        assert_eq!(ipam.allocate(network.id, server.user2.id)?.ip.to_string(), "10.99.0.2");
        assert!(matches!(
            ipam.allocate(network.id, server.user3.id),
            Err(ServerError::IpExhausted)
        ));
        Ok(())
    }

    #[test]
    fn test_release_is_idempotent() -> Result<()> {
        let server = test::Server::new()?;
        let ipam = &server.ctx.ipam;

        ipam.allocate(server.open_net.id, server.user1.id)?;
        ipam.release(server.open_net.id, server.user1.id)?;
        ipam.release(server.open_net.id, server.user1.id)?;

        let conn = server.ctx.db.lock();
        assert_eq!(audit::count(&conn, audit::AuditKind::IpReleased)?, 1);
        Ok(())
    }

    #[test]
    fn test_admin_release_records_released_for() -> Result<()> {
        let server = test::Server::new()?;
        let ipam = &server.ctx.ipam;

        ipam.allocate(server.open_net.id, server.user1.id)?;
        ipam.release_for(server.admin.id, server.open_net.id, server.user1.id)?;

        let conn = server.ctx.db.lock();
        let attributes: String = conn.query_row(
            "SELECT attributes FROM audit_events WHERE kind = 'IP_RELEASED'",
            [],
            |row| row.get(0),
        )?;
        assert!(attributes.contains("released_for"));
        assert!(attributes.contains(&audit::redact(server.user1.id)));
        Ok(())
    }

    #[test]
    fn test_release_all_resets_allocator_state() -> Result<()> {
        let server = test::Server::new()?;
        let ipam = &server.ctx.ipam;
        let net = server.open_net.id;

        ipam.allocate(net, server.user1.id)?;
        ipam.allocate(net, server.user2.id)?;
        ipam.release(net, server.user1.id)?;
        ipam.release_all(net)?;

        // A fresh allocator starts over from the base address.
        assert_eq!(ipam.allocate(net, server.user3.id)?.ip.to_string(), "10.10.0.1");
        Ok(())
    }
}
