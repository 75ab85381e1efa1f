use anyhow::bail;
use goconnect_shared::{signal::SignalHub, Error, IoErrorContext};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::prelude::*,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

pub mod audit;
mod db;
mod error;
pub mod invite;
pub mod ipam;
pub mod membership;
pub mod profile;

pub use error::ServerError;
use invite::InviteService;
use ipam::Ipam;
use membership::MembershipEngine;
use profile::{DeviceRegistry, ProfileAssembler};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub type Db = Arc<Mutex<Connection>>;

/// Every engine shares one store connection; observers wire the allocator
/// into membership transitions so approval and allocation stay atomic.
#[derive(Clone)]
pub struct Context {
    pub db: Db,
    pub hub: SignalHub,
    pub membership: Arc<MembershipEngine>,
    pub invites: Arc<InviteService>,
    pub ipam: Arc<Ipam>,
    pub devices: Arc<DeviceRegistry>,
    pub profiles: Arc<ProfileAssembler>,
}

impl Context {
    pub fn new(conn: Connection) -> Result<Self, ServerError> {
        // Foreign key constraints aren't on in SQLite by default. Enable.
        conn.pragma_update(None, "foreign_keys", 1)?;
        db::init(&conn)?;

        let db: Db = Arc::new(Mutex::new(conn));
        let ipam = Arc::new(Ipam::new(db.clone()));

        let mut membership = MembershipEngine::new(db.clone());
        membership.register_observer(ipam.clone());

        let mut invites = InviteService::new(db.clone());
        invites.register_observer(ipam.clone());

        Ok(Self {
            hub: SignalHub::new(),
            membership: Arc::new(membership),
            invites: Arc::new(invites),
            ipam,
            devices: Arc::new(DeviceRegistry::new(db.clone())),
            profiles: Arc::new(ProfileAssembler::new(db.clone())),
            db,
        })
    }
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    /// The tenant this deployment coordinates.
    pub tenant: String,

    /// The listen port of the coordination API.
    pub listen_port: u16,
}

impl ConfigFile {
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut file = File::create(&path).with_path(&path)?;
        goconnect_shared::chmod(&file, 0o600)?;
        file.write_all(toml::to_string(self).unwrap().as_bytes())
            .with_path(path)?;
        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_path(path)?;
        if goconnect_shared::chmod(&file, 0o600)? {
            log::warn!("updated permissions for {} to 0600.", path.display());
        }
        Ok(toml::from_str(
            &std::fs::read_to_string(path).with_path(path)?,
        )?)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl ServerConfig {
    pub fn new(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            config_dir,
            data_dir,
        }
    }

    pub fn database_path(&self, name: &str) -> PathBuf {
        PathBuf::new()
            .join(&self.data_dir)
            .join(name)
            .with_extension("db")
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        PathBuf::new()
            .join(&self.config_dir)
            .join(name)
            .with_extension("conf")
    }
}

/// Create a user in the deployment's tenant.
pub fn add_user(name: &str, deployment: &str, conf: &ServerConfig) -> Result<(), Error> {
    let config = ConfigFile::from_file(conf.config_path(deployment))?;
    let conn = open_database_connection(deployment, conf)?;
    let context = Context::new(conn)?;

    let user = db::DatabaseUser::create(&context.db.lock(), &config.tenant, name)?;
    println!("user \"{}\" created with id {}.", user.name, user.id);
    Ok(())
}

#[derive(Clone, Debug, clap::Args)]
pub struct AddNetworkOpts {
    /// Name of the new network.
    pub name: String,

    /// The network CIDR, e.g. 10.42.0.0/16.
    pub cidr: ipnet::Ipv4Net,

    /// The user who will own the network.
    #[clap(long)]
    pub owner: i64,

    /// How non-members become members.
    #[clap(long, default_value = "open", value_parser = parse_join_policy)]
    pub join_policy: goconnect_shared::JoinPolicy,

    /// Whether the network is listed for non-members.
    #[clap(long, default_value = "private", value_parser = parse_visibility)]
    pub visibility: goconnect_shared::Visibility,

    /// Comma-separated DNS servers pushed to member devices.
    #[clap(long)]
    pub dns: Option<String>,
}

fn parse_join_policy(s: &str) -> Result<goconnect_shared::JoinPolicy, String> {
    s.parse()
        .map_err(|_| "must be one of open, approval, invite_only".to_string())
}

fn parse_visibility(s: &str) -> Result<goconnect_shared::Visibility, String> {
    s.parse()
        .map_err(|_| "must be one of public, private".to_string())
}

/// Create a network owned by an existing user.
pub fn add_network(opts: AddNetworkOpts, deployment: &str, conf: &ServerConfig) -> Result<(), Error> {
    let config = ConfigFile::from_file(conf.config_path(deployment))?;
    let conn = open_database_connection(deployment, conf)?;
    let context = Context::new(conn)?;

    let caller = membership::Caller::new(opts.owner, config.tenant);
    let network = context.membership.create_network(
        &caller,
        membership::NetworkSpec {
            name: opts.name,
            cidr: opts.cidr,
            visibility: opts.visibility,
            join_policy: opts.join_policy,
            dns: opts.dns,
        },
    )?;
    println!("network {} created.", network);
    Ok(())
}

pub fn open_database_connection(name: &str, conf: &ServerConfig) -> Result<Connection, Error> {
    let database_path = conf.database_path(name);
    if !Path::new(&database_path).exists() {
        bail!(
            "no database file found at {}",
            database_path.to_string_lossy()
        );
    }

    Ok(Connection::open(&database_path)?)
}

fn spawn_expired_invite_sweeper(invites: Arc<InviteService>) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match invites.sweep_expired() {
                Ok(deleted) if deleted > 0 => {
                    log::info!("Deleted {} expired invite tokens.", deleted)
                },
                Err(e) => log::error!("Failed to delete expired invite tokens: {}", e),
                _ => {},
            }
        }
    });
}

fn spawn_idempotency_sweeper(db: Db) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let swept = db::DatabaseIdempotency::sweep(&db.lock(), goconnect_shared::unix_now());
            match swept {
                Ok(deleted) if deleted > 0 => {
                    log::info!("Dropped {} idempotency records past retention.", deleted)
                },
                Err(e) => log::error!("Failed to sweep idempotency records: {}", e),
                _ => {},
            }
        }
    });
}

/// Bring the coordination server up and park until interrupted. Transport
/// listeners attach to the returned context at the edge; the core runs the
/// stores, the signaling hub, and the background sweepers.
pub async fn serve(name: &str, conf: &ServerConfig) -> Result<(), Error> {
    let config = ConfigFile::from_file(conf.config_path(name))?;
    log::debug!("opening database connection...");
    let conn = open_database_connection(name, conf)?;
    let context = Context::new(conn)?;

    spawn_expired_invite_sweeper(context.invites.clone());
    spawn_idempotency_sweeper(context.db.clone());

    log::info!(
        "goconnect-server {} serving tenant \"{}\" on port {}.",
        VERSION,
        config.tenant,
        config.listen_port
    );

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down.");
    Ok(())
}
