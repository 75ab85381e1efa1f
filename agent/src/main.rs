use clap::{Parser, Subcommand};
use colored::*;
use goconnect_agent::{
    config::DataStore,
    signaler::Signaler,
    transfer::{ListOptions, Manager},
    Error, VERSION,
};
use goconnect_shared::{
    deeplink::{Action, DeepLink},
    signal::SignalPayload,
    DeviceConfig, TRANSFER_PORT,
};
use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

#[derive(Debug, Parser)]
#[clap(name = "goconnect-agent", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = "/var/lib/goconnect")]
    data_dir: PathBuf,

    #[clap(short, long, default_value = "/etc/goconnect")]
    config_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create (or show) this device's key pair and print the public key.
    Key {
        /// Device name the key pair is stored under.
        name: String,
    },

    /// Render a server-produced device configuration into a tunnel config
    /// file, injecting the locally held private key.
    Render {
        /// Device name whose key pair to use.
        name: String,

        /// Network name the configuration belongs to.
        network: String,

        /// Path to the device configuration JSON fetched from the server.
        device_config: PathBuf,

        /// The server's public key (base64).
        #[clap(long)]
        server_key: String,

        /// The server's external endpoint, host:port.
        #[clap(long)]
        server_endpoint: String,
    },

    /// Classify a goconnect:// deep link and print what it asks for.
    Link {
        /// The URL to inspect.
        url: String,
    },

    /// Run the transfer listener, accepting direct peer-to-peer file
    /// transfers until interrupted.
    Listen {
        /// Device id announced over signaling.
        name: String,

        /// Address to bind the transfer listener on.
        #[clap(long, default_value_t = format!("0.0.0.0:{TRANSFER_PORT}"))]
        bind: String,
    },
}

/// Outbound signaling is a no-op until the agent is attached to a server
/// session; transfers keep working for peers that dial in directly.
struct OfflineSignaler;

impl Signaler for OfflineSignaler {
    fn send(&self, to: &str, _payload: SignalPayload) -> bool {
        log::debug!("not connected to a signaling server; payload for {to} dropped");
        false
    }
}

#[tokio::main]
async fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();

    if let Err(e) = run(opts).await {
        eprintln!("{} {}", "[ERROR]".red(), e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<(), Error> {
    match opts.command {
        Command::Key { name } => {
            let store = DataStore::open_or_create(&opts.data_dir, &name)?;
            println!("{}", store.keypair()?.public.to_base64());
        },
        Command::Render {
            name,
            network,
            device_config,
            server_key,
            server_endpoint,
        } => {
            let store = DataStore::open_or_create(&opts.data_dir, &name)?;
            let config: DeviceConfig =
                serde_json::from_str(&std::fs::read_to_string(device_config)?)?;
            let server = goconnect_shared::interface_config::ServerInfo {
                public_key: server_key,
                external_endpoint: server_endpoint
                    .parse()
                    .map_err(|e: &str| anyhow::anyhow!(e))?,
            };
            let path = store.render_interface_config(&opts.config_dir, &network, &config, server)?;
            println!(
                "{} wrote tunnel configuration to {}.",
                "[*]".dimmed(),
                path.display().to_string().yellow()
            );
        },
        Command::Link { url } => {
            let link = DeepLink::parse(&url)?;
            match link.action {
                Action::Login => println!("login against {:?}", link.param_value("server")),
                Action::Join => println!("join with invite code {}", link.target.yellow()),
                Action::Network => println!("view network {}", link.target.yellow()),
                Action::Connect => println!("connect to peer {}", link.target.yellow()),
                Action::Unknown(host) => println!("unknown action {}", host.red()),
            }
        },
        Command::Listen { name, bind } => {
            let bind: SocketAddr = bind.parse().map_err(|_| anyhow::anyhow!("invalid bind address"))?;
            let manager = Manager::new(name.as_str(), Arc::new(OfflineSignaler));
            let addr = manager.start(bind).await?;
            println!(
                "{} goconnect-agent {} listening for transfers on {}.",
                "[*]".dimmed(),
                VERSION,
                addr.to_string().yellow()
            );

            let reaper = manager.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
                loop {
                    interval.tick().await;
                    let removed = reaper.cleanup_old(Duration::from_secs(24 * 60 * 60));
                    if removed > 0 {
                        log::info!("cleaned up {removed} finished transfer sessions");
                    }
                }
            });

            tokio::signal::ctrl_c().await?;
            let active = manager.list_sessions(&ListOptions::default());
            log::info!("stopping with {} session(s) tracked.", active.len());
            manager.stop();
        },
    }
    Ok(())
}
