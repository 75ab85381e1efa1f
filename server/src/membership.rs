//! The membership graph and its policy-gated transitions.
//!
//! Per (network, user) the lifecycle is:
//!
//! ```text
//! ∅ --join(open)--> approved
//! ∅ --join(approval)--> pending
//! ∅ --redeem_invite--> approved
//! pending --approve--> approved
//! pending --deny--> ∅
//! approved --kick--> ∅
//! approved --ban--> banned
//! pending --ban--> banned
//! banned --unban--> ∅
//! ```
//!
//! All mutations are atomic under the store lock; observers (notably the
//! address allocator) run inside the same critical section so approval and
//! allocation can never be observed apart.

use crate::{
    audit::{self, AuditKind},
    db::{
        DatabaseIdempotency, DatabaseInvite, DatabaseJoinRequest, DatabaseMembership,
        DatabaseNetwork, DatabasePeer,
    },
    Db, ServerError,
};
use goconnect_shared::{
    unix_now, JoinPolicy, JoinRequest, Membership, MembershipContents, MembershipRole,
    MembershipStatus, Network, NetworkContents, NetworkId, UserId, Visibility,
};
use ipnet::Ipv4Net;
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

const IDEMPOTENCY_COMPONENT: &str = "membership";

/// A pre-authenticated caller identity. Authentication itself happens at the
/// edge; the engine only ever sees a validated (user, tenant) pair.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user_id: UserId,
    pub tenant: String,
}

impl Caller {
    pub fn new(user_id: UserId, tenant: impl Into<String>) -> Self {
        Self {
            user_id,
            tenant: tenant.into(),
        }
    }
}

/// Hooks invoked inside membership transitions, while the store lock is still
/// held. The allocator registers itself here so that approval allocates and
/// removal releases without the engine depending on it directly.
pub trait MembershipObserver: Send + Sync {
    fn member_approved(
        &self,
        conn: &Connection,
        network: &Network,
        user_id: UserId,
    ) -> Result<(), ServerError>;

    fn member_removed(
        &self,
        conn: &Connection,
        network: &Network,
        user_id: UserId,
        actor: UserId,
    ) -> Result<(), ServerError>;

    fn network_torn_down(&self, conn: &Connection, network_id: NetworkId) -> Result<(), ServerError> {
        let _ = (conn, network_id);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: Ipv4Net,
    pub visibility: Visibility,
    pub join_policy: JoinPolicy,
    pub dns: Option<String>,
}

pub struct MembershipEngine {
    db: Db,
    observers: Vec<Arc<dyn MembershipObserver>>,
}

impl MembershipEngine {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            observers: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Arc<dyn MembershipObserver>) {
        self.observers.push(observer);
    }

    /// Create a network owned by the caller's tenant. The creator becomes the
    /// sole owner; their address is allocated lazily when their first device
    /// attaches.
    pub fn create_network(&self, caller: &Caller, spec: NetworkSpec) -> Result<Network, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::create(
            &conn,
            NetworkContents {
                tenant: caller.tenant.clone(),
                name: spec.name,
                cidr: spec.cidr,
                visibility: spec.visibility,
                join_policy: spec.join_policy,
                dns: spec.dns,
                created_by: caller.user_id,
                created_at: unix_now(),
            },
        )?;
        DatabaseMembership::create(
            &conn,
            MembershipContents {
                network_id: network.id,
                user_id: caller.user_id,
                role: MembershipRole::Owner,
                status: MembershipStatus::Approved,
                joined_at: unix_now(),
                banned_at: None,
                ban_reason: None,
            },
        )?;
        log::info!("network {} created by user {}", network.id, caller.user_id);
        Ok(network)
    }

    /// Tear a network down entirely. Owner only.
    pub fn delete_network(&self, caller: &Caller, network_id: NetworkId) -> Result<(), ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        let membership = DatabaseMembership::get(&conn, network.id, caller.user_id)
            .map_err(|_| ServerError::Forbidden)?;
        if membership.role != MembershipRole::Owner
            || membership.status != MembershipStatus::Approved
        {
            return Err(ServerError::Forbidden);
        }

        for observer in &self.observers {
            observer.network_torn_down(&conn, network.id)?;
        }
        DatabasePeer::delete_for_network(&conn, network.id)?;
        DatabaseInvite::delete_for_network(&conn, network.id)?;
        conn.execute(
            "DELETE FROM join_requests WHERE network_id = ?1",
            rusqlite::params![network.id],
        )?;
        DatabaseMembership::delete_for_network(&conn, network.id)?;
        DatabaseNetwork::delete(&conn, network.id)?;
        log::info!("network {} deleted by user {}", network.id, caller.user_id);
        Ok(())
    }

    pub fn list_networks(&self, caller: &Caller) -> Result<Vec<Network>, ServerError> {
        let conn = self.db.lock();
        DatabaseNetwork::list_visible(&conn, &caller.tenant, caller.user_id)
    }

    /// Join a network under its policy. Requires a non-empty idempotency key;
    /// replays of the same key return the first outcome verbatim.
    pub fn join(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        idempotency_key: &str,
    ) -> Result<Membership, ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if let Some(previous) = replay(&conn, idempotency_key)? {
            return Ok(previous);
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;

        if let Some(existing) = DatabaseMembership::find(&conn, network.id, caller.user_id)? {
            return match existing.status {
                MembershipStatus::Banned => Err(ServerError::PolicyDenied(
                    "user is banned from this network".to_string(),
                )),
                // Rejoining is a no-op for both approved and pending members.
                MembershipStatus::Approved | MembershipStatus::Pending => {
                    remember(&conn, idempotency_key, &existing.inner)?;
                    Ok(existing.inner)
                },
            };
        }

        let membership = match network.join_policy {
            JoinPolicy::Open => {
                let membership = DatabaseMembership::create(
                    &conn,
                    member_contents(network.id, caller.user_id, MembershipStatus::Approved),
                )?;
                self.notify_approved(&conn, &network, caller.user_id)?;
                audit::record(
                    &conn,
                    AuditKind::MembershipApproved,
                    caller.user_id,
                    caller.user_id,
                    &[("network", network.id.to_string())],
                )?;
                membership
            },
            JoinPolicy::Approval => {
                let membership = DatabaseMembership::create(
                    &conn,
                    member_contents(network.id, caller.user_id, MembershipStatus::Pending),
                )?;
                DatabaseJoinRequest::create(
                    &conn,
                    network.id,
                    caller.user_id,
                    unix_now(),
                    idempotency_key,
                )?;
                membership
            },
            JoinPolicy::InviteOnly => {
                return Err(ServerError::PolicyDenied(
                    "network join policy requires an invite".to_string(),
                ));
            },
        };

        remember(&conn, idempotency_key, &membership.inner)?;
        Ok(membership.inner)
    }

    /// Transition a pending member to approved. Owner/admin only. A no-op for
    /// already-approved members; fails for banned ones.
    pub fn approve(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<Membership, ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if let Some(previous) = replay(&conn, idempotency_key)? {
            return Ok(previous);
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        let mut target = DatabaseMembership::get(&conn, network.id, user_id)?;
        match target.status {
            MembershipStatus::Banned => {
                Err(ServerError::Conflict("member is banned".to_string()))
            },
            MembershipStatus::Approved => {
                remember(&conn, idempotency_key, &target.inner)?;
                Ok(target.inner)
            },
            MembershipStatus::Pending => {
                target.set_status(&conn, MembershipStatus::Approved)?;
                DatabaseJoinRequest::delete(&conn, network.id, user_id)?;
                self.notify_approved(&conn, &network, user_id)?;
                audit::record(
                    &conn,
                    AuditKind::MembershipApproved,
                    caller.user_id,
                    user_id,
                    &[("network", network.id.to_string())],
                )?;
                remember(&conn, idempotency_key, &target.inner)?;
                Ok(target.inner)
            },
        }
    }

    /// Refuse a pending join. Owner/admin only; a no-op when nothing is
    /// pending.
    pub fn deny(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<(), ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if replay::<()>(&conn, idempotency_key)?.is_some() {
            return Ok(());
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        let removed = DatabaseJoinRequest::delete(&conn, network.id, user_id)?;
        if let Some(target) = DatabaseMembership::find(&conn, network.id, user_id)? {
            if target.status == MembershipStatus::Pending {
                DatabaseMembership::delete(&conn, target.id)?;
            }
        }
        if removed {
            audit::record(
                &conn,
                AuditKind::MembershipDenied,
                caller.user_id,
                user_id,
                &[("network", network.id.to_string())],
            )?;
        }
        remember(&conn, idempotency_key, &())?;
        Ok(())
    }

    /// Remove an approved member and release their address. Owner/admin only;
    /// owners cannot be kicked.
    pub fn kick(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<(), ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if replay::<()>(&conn, idempotency_key)?.is_some() {
            return Ok(());
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        let target = DatabaseMembership::get(&conn, network.id, user_id)?;
        if target.role == MembershipRole::Owner {
            return Err(ServerError::Forbidden);
        }

        self.remove_member(&conn, &network, &target, caller.user_id)?;
        audit::record(
            &conn,
            AuditKind::MemberKicked,
            caller.user_id,
            user_id,
            &[("network", network.id.to_string())],
        )?;
        remember(&conn, idempotency_key, &())?;
        Ok(())
    }

    /// Self-removal. Refused for the last owner, which would orphan the
    /// network.
    pub fn leave(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        idempotency_key: &str,
    ) -> Result<(), ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if replay::<()>(&conn, idempotency_key)?.is_some() {
            return Ok(());
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        let target = DatabaseMembership::get(&conn, network.id, caller.user_id)?;
        if target.role == MembershipRole::Owner
            && DatabaseMembership::count_owners(&conn, network.id)? <= 1
        {
            return Err(ServerError::Conflict(
                "cannot remove the last owner of a network".to_string(),
            ));
        }

        self.remove_member(&conn, &network, &target, caller.user_id)?;
        audit::record(
            &conn,
            AuditKind::MemberKicked,
            caller.user_id,
            caller.user_id,
            &[
                ("network", network.id.to_string()),
                ("self", "true".to_string()),
            ],
        )?;
        remember(&conn, idempotency_key, &())?;
        Ok(())
    }

    /// Ban a member. The membership stays, marked banned, so the user cannot
    /// slip back in under an open join policy; their address is released.
    pub fn ban(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        user_id: UserId,
        reason: Option<String>,
        idempotency_key: &str,
    ) -> Result<Membership, ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if let Some(previous) = replay(&conn, idempotency_key)? {
            return Ok(previous);
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        let mut target = DatabaseMembership::get(&conn, network.id, user_id)?;
        if target.role == MembershipRole::Owner {
            return Err(ServerError::Forbidden);
        }
        if target.status == MembershipStatus::Banned {
            remember(&conn, idempotency_key, &target.inner)?;
            return Ok(target.inner);
        }

        target.ban(&conn, reason.clone(), unix_now())?;
        DatabaseJoinRequest::delete(&conn, network.id, user_id)?;
        DatabasePeer::deactivate_for_user(&conn, network.id, user_id)?;
        for observer in &self.observers {
            observer.member_removed(&conn, &network, user_id, caller.user_id)?;
        }
        audit::record(
            &conn,
            AuditKind::MemberBanned,
            caller.user_id,
            user_id,
            &[
                ("network", network.id.to_string()),
                ("reason", reason.unwrap_or_default()),
            ],
        )?;
        remember(&conn, idempotency_key, &target.inner)?;
        Ok(target.inner)
    }

    /// Lift a ban by deleting the membership outright; the user may rejoin
    /// under whatever policy the network runs.
    pub fn unban(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        user_id: UserId,
        idempotency_key: &str,
    ) -> Result<(), ServerError> {
        check_key(idempotency_key)?;
        let conn = self.db.lock();
        if replay::<()>(&conn, idempotency_key)?.is_some() {
            return Ok(());
        }

        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        match DatabaseMembership::find(&conn, network.id, user_id)? {
            None => {},
            Some(target) if target.status == MembershipStatus::Banned => {
                DatabaseMembership::delete(&conn, target.id)?;
                audit::record(
                    &conn,
                    AuditKind::MemberUnbanned,
                    caller.user_id,
                    user_id,
                    &[("network", network.id.to_string())],
                )?;
            },
            Some(_) => {
                return Err(ServerError::Conflict("member is not banned".to_string()));
            },
        }
        remember(&conn, idempotency_key, &())?;
        Ok(())
    }

    /// Members of a network, visible to any approved member.
    pub fn list_members(
        &self,
        caller: &Caller,
        network_id: NetworkId,
    ) -> Result<Vec<Membership>, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        let membership = DatabaseMembership::get(&conn, network.id, caller.user_id)
            .map_err(|_| ServerError::Forbidden)?;
        if membership.status != MembershipStatus::Approved {
            return Err(ServerError::Forbidden);
        }
        DatabaseMembership::list_for_network(&conn, network.id)
    }

    /// Pending join requests. Owner/admin only.
    pub fn list_join_requests(
        &self,
        caller: &Caller,
        network_id: NetworkId,
    ) -> Result<Vec<JoinRequest>, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;
        DatabaseJoinRequest::list_for_network(&conn, network.id)
    }

    fn remove_member(
        &self,
        conn: &Connection,
        network: &Network,
        target: &DatabaseMembership,
        actor: UserId,
    ) -> Result<(), ServerError> {
        DatabaseMembership::delete(conn, target.id)?;
        DatabaseJoinRequest::delete(conn, network.id, target.user_id)?;
        DatabasePeer::deactivate_for_user(conn, network.id, target.user_id)?;
        for observer in &self.observers {
            observer.member_removed(conn, network, target.user_id, actor)?;
        }
        Ok(())
    }

    fn notify_approved(
        &self,
        conn: &Connection,
        network: &Network,
        user_id: UserId,
    ) -> Result<(), ServerError> {
        for observer in &self.observers {
            observer.member_approved(conn, network, user_id)?;
        }
        Ok(())
    }
}

/// Shared role gate: the caller must hold an approved owner or admin
/// membership in the network.
pub(crate) fn admin_membership(
    conn: &Connection,
    network: &Network,
    user_id: UserId,
) -> Result<Membership, ServerError> {
    match DatabaseMembership::find(conn, network.id, user_id)? {
        Some(membership) if membership.is_admin_capable() => Ok(membership.inner),
        _ => Err(ServerError::Forbidden),
    }
}

fn member_contents(
    network_id: NetworkId,
    user_id: UserId,
    status: MembershipStatus,
) -> MembershipContents {
    MembershipContents {
        network_id,
        user_id,
        role: MembershipRole::Member,
        status,
        joined_at: unix_now(),
        banned_at: None,
        ban_reason: None,
    }
}

fn check_key(idempotency_key: &str) -> Result<(), ServerError> {
    if idempotency_key.is_empty() {
        return Err(ServerError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn replay<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, ServerError> {
    match DatabaseIdempotency::fetch(conn, IDEMPOTENCY_COMPONENT, key, unix_now())? {
        Some(response) => Ok(Some(serde_json::from_str(&response)?)),
        None => Ok(None),
    }
}

fn remember<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), ServerError> {
    DatabaseIdempotency::store(
        conn,
        IDEMPOTENCY_COMPONENT,
        key,
        &serde_json::to_string(value)?,
        unix_now(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use anyhow::Result;

    #[test]
    fn test_open_join_approves_and_allocates() -> Result<()> {
        let server = test::Server::new()?;
        let caller = server.caller(&server.user1);

        let membership = server.ctx.membership.join(&caller, server.open_net.id, "k1")?;
        assert_eq!(membership.status, MembershipStatus::Approved);
        assert_eq!(membership.role, MembershipRole::Member);

        let allocation = server
            .ctx
            .ipam
            .get(server.open_net.id, server.user1.id)?
            .expect("approved member must hold an allocation");
        assert_eq!(allocation.ip.to_string(), "10.10.0.1");

        // Allocation is idempotent once membership exists.
        let again = server.ctx.ipam.allocate(server.open_net.id, server.user1.id)?;
        assert_eq!(again.ip, allocation.ip);
        Ok(())
    }

    #[test]
    fn test_join_replays_same_idempotency_key() -> Result<()> {
        let server = test::Server::new()?;
        let caller = server.caller(&server.user1);

        let first = server.ctx.membership.join(&caller, server.open_net.id, "k1")?;
        let replayed = server.ctx.membership.join(&caller, server.open_net.id, "k1")?;
        assert_eq!(first, replayed);
        Ok(())
    }

    #[test]
    fn test_empty_idempotency_key_is_rejected() -> Result<()> {
        let server = test::Server::new()?;
        let caller = server.caller(&server.user1);

        assert!(matches!(
            server.ctx.membership.join(&caller, server.open_net.id, ""),
            Err(ServerError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_approval_flow_with_admin_gate() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let joiner = server.caller(&server.user1);

        let membership = engine.join(&joiner, server.approval_net.id, "k2")?;
        assert_eq!(membership.status, MembershipStatus::Pending);
        assert!(server.ctx.ipam.get(server.approval_net.id, server.user1.id)?.is_none());

        // The joiner cannot approve themselves.
        assert!(matches!(
            engine.approve(&joiner, server.approval_net.id, server.user1.id, "k3"),
            Err(ServerError::Forbidden)
        ));

        let owner = server.caller(&server.owner);
        let approved = engine.approve(&owner, server.approval_net.id, server.user1.id, "k4")?;
        assert_eq!(approved.status, MembershipStatus::Approved);

        // The join request is gone and the allocation exists.
        assert!(engine.list_join_requests(&owner, server.approval_net.id)?.is_empty());
        assert!(server.ctx.ipam.get(server.approval_net.id, server.user1.id)?.is_some());

        // Approving again is a no-op.
        let again = engine.approve(&owner, server.approval_net.id, server.user1.id, "k5")?;
        assert_eq!(again.status, MembershipStatus::Approved);
        Ok(())
    }

    #[test]
    fn test_pending_join_is_idempotent_across_keys() -> Result<()> {
        let server = test::Server::new()?;
        let caller = server.caller(&server.user1);

        let first = server.ctx.membership.join(&caller, server.approval_net.id, "k1")?;
        let second = server.ctx.membership.join(&caller, server.approval_net.id, "k2")?;
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, MembershipStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_invite_only_join_is_policy_denied() -> Result<()> {
        let server = test::Server::new()?;
        let caller = server.caller(&server.user1);

        assert!(matches!(
            server.ctx.membership.join(&caller, server.invite_net.id, "k1"),
            Err(ServerError::PolicyDenied(_))
        ));
        Ok(())
    }

    #[test]
    fn test_deny_removes_pending_and_is_noop_after() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let owner = server.caller(&server.owner);
        let joiner = server.caller(&server.user1);

        engine.join(&joiner, server.approval_net.id, "k1")?;
        engine.deny(&owner, server.approval_net.id, server.user1.id, "k2")?;

        let conn = server.ctx.db.lock();
        assert!(DatabaseMembership::find(&conn, server.approval_net.id, server.user1.id)?.is_none());
        drop(conn);

        // Denying again with a fresh key still succeeds as a no-op.
        engine.deny(&owner, server.approval_net.id, server.user1.id, "k3")?;
        Ok(())
    }

    #[test]
    fn test_kick_releases_address_for_lifo_reuse() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let owner = server.caller(&server.owner);

        engine.join(&server.caller(&server.user1), server.open_net.id, "k1")?;
        engine.join(&server.caller(&server.user2), server.open_net.id, "k2")?;
        engine.kick(&owner, server.open_net.id, server.user1.id, "k3")?;

        assert!(server.ctx.ipam.get(server.open_net.id, server.user1.id)?.is_none());

        // The kicked user's address is first in line for reuse.
        let allocation = server.ctx.ipam.allocate(server.open_net.id, server.user3.id)?;
        assert_eq!(allocation.ip.to_string(), "10.10.0.1");
        Ok(())
    }

    #[test]
    fn test_owner_cannot_be_kicked() -> Result<()> {
        let server = test::Server::new()?;
        let admin = server.caller(&server.admin);

        server.make_admin(server.open_net.id, server.admin.id)?;
        assert!(matches!(
            server
                .ctx
                .membership
                .kick(&admin, server.open_net.id, server.owner.id, "k1"),
            Err(ServerError::Forbidden)
        ));
        Ok(())
    }

    #[test]
    fn test_last_owner_cannot_leave() -> Result<()> {
        let server = test::Server::new()?;
        let owner = server.caller(&server.owner);

        assert!(matches!(
            server.ctx.membership.leave(&owner, server.open_net.id, "k1"),
            Err(ServerError::Conflict(_))
        ));

        // The membership graph is unchanged.
        let conn = server.ctx.db.lock();
        let membership =
            DatabaseMembership::get(&conn, server.open_net.id, server.owner.id)?;
        assert_eq!(membership.role, MembershipRole::Owner);
        Ok(())
    }

    #[test]
    fn test_member_can_leave() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let caller = server.caller(&server.user1);

        engine.join(&caller, server.open_net.id, "k1")?;
        engine.leave(&caller, server.open_net.id, "k2")?;

        let conn = server.ctx.db.lock();
        assert!(DatabaseMembership::find(&conn, server.open_net.id, server.user1.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_ban_blocks_rejoin_until_unban() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let owner = server.caller(&server.owner);
        let caller = server.caller(&server.user1);

        engine.join(&caller, server.open_net.id, "k1")?;
        let banned = engine.ban(
            &owner,
            server.open_net.id,
            server.user1.id,
            Some("spamming".to_string()),
            "k2",
        )?;
        assert_eq!(banned.status, MembershipStatus::Banned);
        assert_eq!(banned.ban_reason.as_deref(), Some("spamming"));
        assert!(banned.banned_at.is_some());

        // The banned user's address was released at ban time.
        assert!(server.ctx.ipam.get(server.open_net.id, server.user1.id)?.is_none());

        assert!(matches!(
            engine.join(&caller, server.open_net.id, "k3"),
            Err(ServerError::PolicyDenied(_))
        ));

        engine.unban(&owner, server.open_net.id, server.user1.id, "k4")?;
        let rejoined = engine.join(&caller, server.open_net.id, "k5")?;
        assert_eq!(rejoined.status, MembershipStatus::Approved);
        Ok(())
    }

    #[test]
    fn test_banned_member_cannot_be_approved() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let owner = server.caller(&server.owner);

        engine.join(&server.caller(&server.user1), server.approval_net.id, "k1")?;
        engine.ban(&owner, server.approval_net.id, server.user1.id, None, "k2")?;

        assert!(matches!(
            engine.approve(&owner, server.approval_net.id, server.user1.id, "k3"),
            Err(ServerError::Conflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cross_tenant_operations_surface_not_found() -> Result<()> {
        let server = test::Server::new()?;
        let outsider = server.caller(&server.outsider);

        assert!(matches!(
            server.ctx.membership.join(&outsider, server.open_net.id, "k1"),
            Err(ServerError::NotFound)
        ));
        assert!(matches!(
            server
                .ctx
                .membership
                .approve(&outsider, server.open_net.id, server.user1.id, "k2"),
            Err(ServerError::NotFound)
        ));
        Ok(())
    }

    #[test]
    fn test_list_members_requires_membership() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;

        assert!(matches!(
            engine.list_members(&server.caller(&server.user1), server.open_net.id),
            Err(ServerError::Forbidden)
        ));

        engine.join(&server.caller(&server.user1), server.open_net.id, "k1")?;
        let members = engine.list_members(&server.caller(&server.user1), server.open_net.id)?;
        assert_eq!(members.len(), 2); // owner + user1

        // Join-request listing stays admin-gated.
        assert!(matches!(
            engine.list_join_requests(&server.caller(&server.user1), server.open_net.id),
            Err(ServerError::Forbidden)
        ));
        Ok(())
    }

    #[test]
    fn test_delete_network_requires_owner_and_clears_state() -> Result<()> {
        let server = test::Server::new()?;
        let engine = &server.ctx.membership;
        let owner = server.caller(&server.owner);

        engine.join(&server.caller(&server.user1), server.open_net.id, "k1")?;

        assert!(matches!(
            engine.delete_network(&server.caller(&server.user1), server.open_net.id),
            Err(ServerError::Forbidden)
        ));

        engine.delete_network(&owner, server.open_net.id)?;
        assert!(matches!(
            engine.list_members(&owner, server.open_net.id),
            Err(ServerError::NotFound)
        ));
        assert!(server.ctx.ipam.get(server.open_net.id, server.user1.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_network_visibility_listing() -> Result<()> {
        let server = test::Server::new()?;

        // user1 sees the public networks but not the private invite-only one.
        let visible = server.ctx.membership.list_networks(&server.caller(&server.user1))?;
        let names: Vec<_> = visible.iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"ops"));
        assert!(!names.contains(&"vault"));

        // The outsider tenant sees nothing.
        assert!(server
            .ctx
            .membership
            .list_networks(&server.caller(&server.outsider))?
            .is_empty());
        Ok(())
    }
}
