//! Bounded-use invite tokens.
//!
//! A token bypasses the approval requirement for one specific network. The
//! usable window is `uses_left > 0 && now < expires_at && !revoked`; the
//! decrement and the membership write happen under the same store lock, so
//! concurrent redemptions can never over-spend a token.

use crate::{
    audit::{self, AuditKind},
    db::{
        DatabaseIdempotency, DatabaseInvite, DatabaseJoinRequest, DatabaseMembership,
        DatabaseNetwork,
    },
    membership::{admin_membership, Caller, MembershipObserver},
    Db, ServerError,
};
use goconnect_shared::{
    unix_now, Invite, InviteContents, Membership, MembershipContents, MembershipRole,
    MembershipStatus, NetworkId,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

const IDEMPOTENCY_COMPONENT: &str = "invite";

pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_EXPIRES_IN: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_USES_MAX: u32 = 1;

#[derive(Clone, Debug, Default)]
pub struct InviteOptions {
    pub expires_in: Option<Duration>,
    pub uses_max: Option<u32>,
}

/// The public answer to a token validity probe. Unknown and known-but-dead
/// tokens produce the identical `valid: false` shape, so probes learn nothing
/// about whether a token ever existed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InviteCheck {
    pub valid: bool,
    pub network_id: Option<NetworkId>,
    pub expires_at: Option<u64>,
}

impl InviteCheck {
    fn invalid() -> Self {
        Self {
            valid: false,
            network_id: None,
            expires_at: None,
        }
    }
}

pub struct InviteService {
    db: Db,
    observers: Vec<Arc<dyn MembershipObserver>>,
}

impl InviteService {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            observers: Vec::new(),
        }
    }

    pub fn register_observer(&mut self, observer: Arc<dyn MembershipObserver>) {
        self.observers.push(observer);
    }

    /// Mint a token for a network. Owner/admin only.
    pub fn create(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        options: InviteOptions,
    ) -> Result<Invite, ServerError> {
        let expires_in = options.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        if expires_in > MAX_EXPIRES_IN || expires_in.is_zero() {
            return Err(ServerError::Validation(format!(
                "invite expiry must be between 1 second and {} days",
                MAX_EXPIRES_IN.as_secs() / 86_400
            )));
        }
        let uses_max = options.uses_max.unwrap_or(DEFAULT_USES_MAX);
        if uses_max == 0 {
            return Err(ServerError::Validation(
                "invite must allow at least one use".to_string(),
            ));
        }

        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        let invite = DatabaseInvite::create(
            &conn,
            InviteContents {
                network_id: network.id,
                token: generate_token(),
                created_by: caller.user_id,
                expires_at: unix_now() + expires_in.as_secs(),
                uses_max,
                uses_left: uses_max,
                revoked: false,
            },
        )?;
        log::info!("invite {} created for network {}", invite.id, network.id);
        audit::record(
            &conn,
            AuditKind::InviteCreated,
            caller.user_id,
            invite.id,
            &[
                ("network", network.id.to_string()),
                ("uses_max", uses_max.to_string()),
            ],
        )?;
        Ok(invite)
    }

    /// Public validity probe; requires no caller identity.
    pub fn validate(&self, token: &str) -> Result<InviteCheck, ServerError> {
        let conn = self.db.lock();
        match DatabaseInvite::find_by_token(&conn, token)? {
            Some(invite) if invite.is_usable(unix_now()) => Ok(InviteCheck {
                valid: true,
                network_id: Some(invite.network_id),
                expires_at: Some(invite.expires_at),
            }),
            _ => Ok(InviteCheck::invalid()),
        }
    }

    /// Redeem a token into an approved membership. Atomic: the lookup, the
    /// usability check, the decrement, and the membership upsert all happen
    /// under one lock. Re-redemption by an existing member does not burn a
    /// use.
    pub fn redeem(
        &self,
        caller: &Caller,
        token: &str,
        idempotency_key: &str,
    ) -> Result<Membership, ServerError> {
        if idempotency_key.is_empty() {
            return Err(ServerError::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let conn = self.db.lock();
        if let Some(response) =
            DatabaseIdempotency::fetch(&conn, IDEMPOTENCY_COMPONENT, idempotency_key, unix_now())?
        {
            return Ok(serde_json::from_str(&response)?);
        }

        let invite = DatabaseInvite::find_by_token(&conn, token)?
            .ok_or_else(|| ServerError::PolicyDenied("invite is not valid".to_string()))?;
        let network = DatabaseNetwork::get_scoped(&conn, invite.network_id, &caller.tenant)?;

        let existing = DatabaseMembership::find(&conn, network.id, caller.user_id)?;
        if let Some(existing) = &existing {
            match existing.status {
                MembershipStatus::Banned => {
                    return Err(ServerError::PolicyDenied(
                        "user is banned from this network".to_string(),
                    ));
                },
                MembershipStatus::Approved => {
                    // Already in; don't burn a use.
                    remember(&conn, idempotency_key, &existing.inner)?;
                    return Ok(existing.inner.clone());
                },
                MembershipStatus::Pending => {},
            }
        }

        if !DatabaseInvite::decrement_uses(&conn, invite.id, unix_now())? {
            return Err(ServerError::PolicyDenied("invite is not valid".to_string()));
        }

        let membership = match existing {
            Some(mut pending) => {
                pending.set_status(&conn, MembershipStatus::Approved)?;
                DatabaseJoinRequest::delete(&conn, network.id, caller.user_id)?;
                pending.inner
            },
            None => {
                DatabaseMembership::create(
                    &conn,
                    MembershipContents {
                        network_id: network.id,
                        user_id: caller.user_id,
                        role: MembershipRole::Member,
                        status: MembershipStatus::Approved,
                        joined_at: unix_now(),
                        banned_at: None,
                        ban_reason: None,
                    },
                )?
                .inner
            },
        };

        for observer in &self.observers {
            observer.member_approved(&conn, &network, caller.user_id)?;
        }
        audit::record(
            &conn,
            AuditKind::InviteRedeemed,
            caller.user_id,
            invite.id,
            &[("network", network.id.to_string())],
        )?;
        remember(&conn, idempotency_key, &membership)?;
        log::info!(
            "user {} redeemed invite {} into network {}",
            caller.user_id,
            invite.id,
            network.id
        );
        Ok(membership)
    }

    /// Kill a token. Owner/admin of the token's network only.
    pub fn revoke(&self, caller: &Caller, invite_id: i64) -> Result<(), ServerError> {
        let conn = self.db.lock();
        let invite = DatabaseInvite::get(&conn, invite_id)?;
        let network = DatabaseNetwork::get_scoped(&conn, invite.network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;

        DatabaseInvite::revoke(&conn, invite.id)?;
        audit::record(
            &conn,
            AuditKind::InviteRevoked,
            caller.user_id,
            invite.id,
            &[("network", network.id.to_string())],
        )?;
        Ok(())
    }

    /// Live tokens for a network. Owner/admin only; expired and revoked
    /// tokens are filtered out lazily.
    pub fn list(&self, caller: &Caller, network_id: NetworkId) -> Result<Vec<Invite>, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        admin_membership(&conn, &network, caller.user_id)?;
        DatabaseInvite::list_for_network(&conn, network.id, unix_now())
    }

    /// Compact dead tokens. Correctness never depends on this running; the
    /// background sweeper calls it periodically.
    pub fn sweep_expired(&self) -> Result<usize, ServerError> {
        let conn = self.db.lock();
        DatabaseInvite::delete_expired(&conn, unix_now())
    }
}

/// 32 bytes of OS randomness, URL-safe base64: exactly 44 characters.
fn generate_token() -> String {
    use rand_core::{OsRng, RngCore};

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE)
}

fn remember(conn: &Connection, key: &str, value: &Membership) -> Result<(), ServerError> {
    DatabaseIdempotency::store(
        conn,
        IDEMPOTENCY_COMPONENT,
        key,
        &serde_json::to_string(value)?,
        unix_now(),
    )
}
