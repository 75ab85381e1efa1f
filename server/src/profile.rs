//! Device registry and per-device tunnel configuration assembly.
//!
//! The assembler answers "what is my device's view of this network?": its own
//! interface address from the allocator plus every other active peer's public
//! key and allowed-IPs. The private-key slot in the answer is ALWAYS empty;
//! the server neither holds nor relays device private keys, and any attempt
//! to push one through the API surface is logged and ignored.

use crate::{
    audit::{self, AuditKind},
    db::{DatabaseAllocation, DatabaseDevice, DatabaseMembership, DatabaseNetwork, DatabasePeer},
    membership::Caller,
    Db, ServerError,
};
use goconnect_shared::{
    is_valid_name, key::Key, unix_now, Device, DeviceConfig, DeviceContents, DeviceId, Endpoint,
    InterfaceSection, MembershipStatus, NetworkId, Peer, PeerContents, PeerSection,
    DEFAULT_LISTEN_PORT,
};
use ipnet::Ipv4Net;

pub struct DeviceRegistry {
    db: Db,
}

impl DeviceRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Register a device under the caller. The public key must be unique
    /// within the tenant.
    pub fn register_device(
        &self,
        caller: &Caller,
        name: &str,
        public_key: &str,
    ) -> Result<Device, ServerError> {
        if !is_valid_name(name) {
            log::warn!("device name is invalid, must conform to hostname(7) requirements.");
            return Err(ServerError::Validation(
                "device name must be a valid hostname label".to_string(),
            ));
        }
        Key::from_base64(public_key).map_err(|_| {
            ServerError::Validation("public key is not a valid base64 key".to_string())
        })?;

        let conn = self.db.lock();
        DatabaseDevice::create(
            &conn,
            DeviceContents {
                user_id: caller.user_id,
                tenant: caller.tenant.clone(),
                name: name.to_string(),
                public_key: public_key.to_string(),
                created_at: unix_now(),
            },
        )
    }

    pub fn list_devices(&self, caller: &Caller) -> Result<Vec<Device>, ServerError> {
        let conn = self.db.lock();
        DatabaseDevice::list_for_user(&conn, caller.user_id)
    }

    /// Activate a device as a peer of a network the caller is an approved
    /// member of. Idempotent: re-attaching returns the existing peer row.
    /// Allocation is idempotent too, which also covers network creators whose
    /// address is assigned lazily on first attach.
    pub fn attach_peer(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        device_id: DeviceId,
        endpoint: Option<Endpoint>,
    ) -> Result<Peer, ServerError> {
        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;
        let device = DatabaseDevice::get_scoped(&conn, device_id, &caller.tenant)?;
        if device.user_id != caller.user_id {
            return Err(ServerError::NotFound);
        }

        let membership = DatabaseMembership::get(&conn, network.id, caller.user_id)
            .map_err(|_| ServerError::Forbidden)?;
        if membership.status != MembershipStatus::Approved {
            return Err(ServerError::Forbidden);
        }

        if let Some(existing) = DatabasePeer::find(&conn, network.id, device.id)? {
            return Ok(existing);
        }

        let allocation = crate::ipam::Ipam::allocate_in(&conn, &network, caller.user_id)?;
        let peer = DatabasePeer::create(
            &conn,
            PeerContents {
                network_id: network.id,
                device_id: device.id,
                tenant: caller.tenant.clone(),
                public_key: device.public_key.clone(),
                allowed_ip: Ipv4Net::new(allocation.ip, 32)
                    .map_err(|e| ServerError::Internal(e.to_string()))?,
                endpoint,
                is_active: true,
            },
        )?;
        log::info!(
            "device {} attached to network {} as peer {}",
            device.id,
            network.id,
            peer.id
        );
        Ok(peer)
    }
}

/// Extra query parameters forwarded from the transport edge, scanned for
/// key-material injection attempts.
pub type RawQuery = [(String, String)];

pub struct ProfileAssembler {
    db: Db,
}

impl ProfileAssembler {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Assemble the tunnel configuration for one of the caller's devices in a
    /// network. Admins may assemble for devices they do not own; everyone
    /// else sees `NotFound` for foreign devices.
    pub fn device_config(
        &self,
        caller: &Caller,
        network_id: NetworkId,
        device_id: DeviceId,
        raw_query: &RawQuery,
    ) -> Result<DeviceConfig, ServerError> {
        scrub_private_key_injection(caller, raw_query);

        let conn = self.db.lock();
        let network = DatabaseNetwork::get_scoped(&conn, network_id, &caller.tenant)?;

        let membership = DatabaseMembership::get(&conn, network.id, caller.user_id)
            .map_err(|_| ServerError::Forbidden)?;
        if membership.status != MembershipStatus::Approved {
            return Err(ServerError::Forbidden);
        }

        let device = DatabaseDevice::get_scoped(&conn, device_id, &caller.tenant)?;
        if device.user_id != caller.user_id && !membership.is_admin_capable() {
            return Err(ServerError::NotFound);
        }

        let allocation = DatabaseAllocation::find(&conn, network.id, device.user_id)?
            .ok_or_else(|| {
                ServerError::Internal(format!(
                    "approved member {} of network {} holds no allocation",
                    device.user_id, network.id
                ))
            })?;

        let peers = DatabasePeer::list_active(&conn, network.id)?
            .into_iter()
            .filter(|peer| peer.public_key != device.public_key)
            .map(|peer| PeerSection {
                public_key: peer.contents.public_key,
                allowed_ips: peer.contents.allowed_ip.to_string(),
                endpoint: peer.contents.endpoint,
                preshared_key: None,
            })
            .collect();

        let dns = network
            .dns
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(String::from)
            .collect();

        audit::record(
            &conn,
            AuditKind::ProfileRendered,
            caller.user_id,
            device.id,
            &[("network", network.id.to_string())],
        )?;

        Ok(DeviceConfig {
            interface: InterfaceSection {
                // Never populated by the server; the device injects its own.
                private_key: String::new(),
                addresses: vec![format!("{}/{}", allocation.ip, network.cidr.prefix_len())],
                dns,
                listen_port: DEFAULT_LISTEN_PORT,
            },
            peers,
        })
    }
}

/// Drop any private-key material a confused or malicious edge tries to pass
/// along. The request proceeds as if the parameter were absent.
fn scrub_private_key_injection(caller: &Caller, raw_query: &RawQuery) {
    for (key, _) in raw_query {
        let normalized: String = key
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized == "privatekey" {
            log::warn!(
                "security: user {} attempted to pass a private key through the profile API; input ignored",
                caller.user_id
            );
        }
    }
}
