use ipnet::Ipv4Net;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    ops::Deref,
    path::Path,
    str::FromStr,
};
use url::Host;

pub type NetworkId = i64;
pub type UserId = i64;
pub type DeviceId = i64;

/// Names double as DNS labels, so they follow the requirements of hostname(7).
/// Note that the full length also must be maximum 63 characters, which this
/// regex does not check.
static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z0-9]-?)*[a-z0-9]$").unwrap());

pub fn is_valid_name(name: &str) -> bool {
    name.len() < 64 && NAME_REGEX.is_match(name)
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    Open,
    Approval,
    InviteOnly,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MembershipRole {
    Member,
    Admin,
    Owner,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Pending,
    Approved,
    Banned,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sender,
    Receiver,
}

macro_rules! string_repr {
    ($ty:ty { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    _ => Err(()),
                }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_repr!(Visibility {
    Visibility::Public => "public",
    Visibility::Private => "private",
});

string_repr!(JoinPolicy {
    JoinPolicy::Open => "open",
    JoinPolicy::Approval => "approval",
    JoinPolicy::InviteOnly => "invite_only",
});

string_repr!(MembershipRole {
    MembershipRole::Member => "member",
    MembershipRole::Admin => "admin",
    MembershipRole::Owner => "owner",
});

string_repr!(MembershipStatus {
    MembershipStatus::Pending => "pending",
    MembershipStatus::Approved => "approved",
    MembershipStatus::Banned => "banned",
});

string_repr!(TransferStatus {
    TransferStatus::Pending => "pending",
    TransferStatus::InProgress => "in_progress",
    TransferStatus::Completed => "completed",
    TransferStatus::Failed => "failed",
    TransferStatus::Cancelled => "cancelled",
});

string_repr!(TransferDirection {
    TransferDirection::Sender => "sender",
    TransferDirection::Receiver => "receiver",
});

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkContents {
    pub tenant: String,
    pub name: String,
    pub cidr: Ipv4Net,
    pub visibility: Visibility,
    pub join_policy: JoinPolicy,
    /// Comma-separated resolver list handed to member devices, if any.
    pub dns: Option<String>,
    pub created_by: UserId,
    pub created_at: u64,
}

impl NetworkContents {
    /// Number of assignable host addresses, excluding the network and
    /// broadcast addresses.
    pub fn host_capacity(&self) -> u32 {
        let total = 1u64 << (32 - self.cidr.prefix_len());
        total.saturating_sub(2) as u32
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Network {
    pub id: NetworkId,

    #[serde(flatten)]
    pub contents: NetworkContents,
}

impl Deref for Network {
    type Target = NetworkContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.cidr)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MembershipContents {
    pub network_id: NetworkId,
    pub user_id: UserId,
    pub role: MembershipRole,
    pub status: MembershipStatus,
    pub joined_at: u64,
    pub banned_at: Option<u64>,
    pub ban_reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Membership {
    pub id: i64,

    #[serde(flatten)]
    pub contents: MembershipContents,
}

impl Deref for Membership {
    type Target = MembershipContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl Membership {
    pub fn is_admin_capable(&self) -> bool {
        self.status == MembershipStatus::Approved && self.role >= MembershipRole::Admin
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub id: i64,
    pub network_id: NetworkId,
    pub user_id: UserId,
    pub created_at: u64,
    /// Idempotency fingerprint of the join call that materialized this request.
    pub fingerprint: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InviteContents {
    pub network_id: NetworkId,
    pub token: String,
    pub created_by: UserId,
    pub expires_at: u64,
    pub uses_max: u32,
    pub uses_left: u32,
    pub revoked: bool,
}

impl InviteContents {
    pub fn is_usable(&self, now: u64) -> bool {
        !self.revoked && self.uses_left > 0 && now < self.expires_at
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Invite {
    pub id: i64,

    #[serde(flatten)]
    pub contents: InviteContents,
}

impl Deref for Invite {
    type Target = InviteContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AllocationContents {
    pub network_id: NetworkId,
    pub user_id: UserId,
    /// Host offset within the network range. The materialized address is
    /// `network base + offset + 1`, skipping the network address itself.
    pub offset: u32,
    pub ip: Ipv4Addr,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Allocation {
    pub id: i64,

    #[serde(flatten)]
    pub contents: AllocationContents,
}

impl Deref for Allocation {
    type Target = AllocationContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub tenant: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceContents {
    pub user_id: UserId,
    pub tenant: String,
    pub name: String,
    /// The device's WireGuard public key. The matching private key never
    /// leaves the device filesystem.
    pub public_key: String,
    pub created_at: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,

    #[serde(flatten)]
    pub contents: DeviceContents,
}

impl Deref for Device {
    type Target = DeviceContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.public_key)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PeerContents {
    pub network_id: NetworkId,
    pub device_id: DeviceId,
    pub tenant: String,
    pub public_key: String,
    /// The /32 of the owning user's allocated address.
    pub allowed_ip: Ipv4Net,
    pub endpoint: Option<Endpoint>,
    pub is_active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Peer {
    pub id: i64,

    #[serde(flatten)]
    pub contents: PeerContents,
}

impl Deref for Peer {
    type Target = PeerContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

/// The per-device tunnel description produced by the server. The private key
/// slot is always empty in server output; the device injects its own key
/// before handing the configuration to the tunnel driver.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub interface: InterfaceSection,
    pub peers: Vec<PeerSection>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InterfaceSection {
    pub private_key: String,
    pub addresses: Vec<String>,
    pub dns: Vec<String>,
    pub listen_port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PeerSection {
    pub public_key: String,
    pub allowed_ips: String,
    pub endpoint: Option<Endpoint>,
    pub preshared_key: Option<String>,
}

/// An external endpoint that supports both IP and domain name hosts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "failed to resolve address".to_string(),
            )
        })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(v4) => Host::Ipv4(*v4.ip()),
            SocketAddr::V6(v6) => Host::Ipv6(*v6.ip()),
        };
        Self {
            host,
            port: addr.port(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or("missing ':' separator")?;
        Ok(Endpoint {
            host: Host::parse(host).map_err(|_| "couldn't parse host")?,
            port: port.parse().map_err(|_| "couldn't parse port")?,
        })
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EndpointVisitor;
        impl serde::de::Visitor<'_> for EndpointVisitor {
            type Value = Endpoint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a valid host:port endpoint")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                s.parse().map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(EndpointVisitor)
    }
}

pub trait IoErrorContext<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError>;
    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError> {
        self.with_str(path.as_ref().to_string_lossy())
    }

    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError> {
        self.map_err(|e| WrappedIoError {
            io_error: e,
            context: context.into(),
        })
    }
}

#[derive(Debug)]
pub struct WrappedIoError {
    io_error: std::io::Error,
    context: String,
}

impl Display for WrappedIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.context, self.io_error)
    }
}

impl Deref for WrappedIoError {
    type Target = std::io::Error;

    fn deref(&self) -> &Self::Target {
        &self.io_error
    }
}

impl std::error::Error for WrappedIoError {}
