use clap::{Parser, Subcommand};
use colored::*;
use goconnect_server::{AddNetworkOpts, ConfigFile, Context, ServerConfig, VERSION};
use goconnect_shared::{ensure_dirs_exist, Error};
use rusqlite::Connection;
use std::{env, path::PathBuf};

#[derive(Debug, Parser)]
#[clap(name = "goconnect-server", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = "/etc/goconnect-server")]
    config_dir: PathBuf,

    #[clap(short, long, default_value = "/var/lib/goconnect-server")]
    data_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new deployment: config file plus an empty database.
    New {
        /// Deployment name, used for the config and database file names.
        #[clap(long)]
        name: String,

        /// The tenant this deployment coordinates.
        #[clap(long)]
        tenant: String,

        /// Port the coordination API will listen on.
        #[clap(long, default_value_t = 51820)]
        listen_port: u16,
    },

    /// Create a user in a deployment's tenant.
    AddUser {
        /// Deployment name passed to `new`.
        deployment: String,

        /// The user's display name.
        name: String,
    },

    /// Create a network owned by an existing user.
    AddNetwork {
        /// Deployment name passed to `new`.
        deployment: String,

        #[clap(flatten)]
        opts: AddNetworkOpts,
    },

    /// Run the coordination server for an existing deployment.
    Serve {
        /// Deployment name passed to `new`.
        name: String,
    },
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
    let conf = ServerConfig::new(opts.config_dir, opts.data_dir);

    match opts.command {
        Command::New {
            name,
            tenant,
            listen_port,
        } => initialize(&conf, &name, &tenant, listen_port),
        Command::AddUser { deployment, name } => goconnect_server::add_user(&name, &deployment, &conf),
        Command::AddNetwork { deployment, opts } => {
            goconnect_server::add_network(opts, &deployment, &conf)
        },
        Command::Serve { name } => goconnect_server::serve(&name, &conf).await,
    }
}

fn initialize(conf: &ServerConfig, name: &str, tenant: &str, listen_port: u16) -> Result<(), Error> {
    ensure_dirs_exist(&[&conf.config_dir, &conf.data_dir])?;

    ConfigFile {
        tenant: tenant.to_string(),
        listen_port,
    }
    .write_to_path(conf.config_path(name))?;

    // Opening the context once creates the schema.
    let conn = Connection::open(conf.database_path(name))?;
    Context::new(conn)?;

    println!(
        "{} deployment {} initialized (goconnect-server {}).",
        "[*]".dimmed(),
        name.yellow(),
        VERSION
    );
    Ok(())
}
