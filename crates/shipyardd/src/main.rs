//! shipyardd — the Shipyard daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Provisioner backends
//! - Supervisors and the scheduler that ticks them
//! - REST API
//!
//! # Usage
//!
//! ```text
//! shipyardd --config /etc/shipyard/shipyard.toml
//! shipyardd --listen 0.0.0.0:8075 --data-dir /var/lib/shipyard
//! shipyardd scaffold-config > shipyard.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shipyard_core::ShipyardConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyardd", about = "Shipyard fleet control plane daemon")]
struct Cli {
    /// Path to shipyard.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address the API listens on; overrides `server.listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Directory holding the state database; overrides `server.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log JSON lines; overrides `server.log_json`.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (the default).
    Run,
    /// Print a shipyard.toml with every default spelled out.
    ScaffoldConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::ScaffoldConfig) = cli.command {
        print!("{}", ShipyardConfig::scaffold().to_toml_string()?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => ShipyardConfig::from_file(path)?,
        None => ShipyardConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    init_tracing(config.log_json());

    daemon::run(config).await
}

/// Command-line flags win over the config file.
fn apply_overrides(config: &mut ShipyardConfig, cli: &Cli) {
    let server = config.server.get_or_insert_with(Default::default);
    if let Some(listen) = &cli.listen {
        server.listen = Some(listen.clone());
    }
    if let Some(data_dir) = &cli.data_dir {
        server.data_dir = Some(data_dir.clone());
    }
    if cli.log_json {
        server.log_json = Some(true);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shipyard=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
