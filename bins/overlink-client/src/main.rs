//! Overlink client daemon
//!
//! Runs the reconciliation engine over the userspace driver and an
//! in-process signaling hub. Network maps come from the management plane
//! in a full deployment; in standalone mode a snapshot file can seed the
//! engine instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::ClientConfig;
use overlink_core::{Engine, EngineDeps};
use overlink_net::{
    IfaceAddress, KeyStoreServer, LocalHub, RecordingDnsServer, RecordingRouteManager,
    RelayManager, SshServer, StaticMgmtClient, UserspaceDriver,
};
use overlink_proto::{KeyPair, NetworkMap, SyncResponse};

/// Overlink - peer-to-peer overlay VPN client
#[derive(Parser)]
#[command(name = "overlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/overlink/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted
    Run {
        /// Network-map snapshot applied at startup
        #[arg(short, long)]
        map: Option<PathBuf>,
    },

    /// Validate the configuration and exit
    CheckConfig,

    /// Generate a fresh key pair
    GenKey,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli.log_level.parse().unwrap_or(tracing::Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to initialise logging");
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::GenKey => {
            let pair = KeyPair::generate();
            println!("secret_key = \"{}\"", pair.secret.to_base64());
            println!("# public key: {}", pair.public);
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig => {
            let config = ClientConfig::load(&cli.config)?;
            config.engine_config()?.validate()?;
            println!("config ok: {}", cli.config.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { map } => {
            let config = ClientConfig::load(&cli.config)?;
            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            runtime.block_on(run_engine(config, map))
        }
    }
}

async fn run_engine(config: ClientConfig, map_path: Option<PathBuf>) -> Result<ExitCode> {
    let engine_config = config.engine_config()?;
    let address = IfaceAddress::parse(&engine_config.overlay_addr)
        .context("parsing overlay address")?;

    let mut messages = Vec::new();
    if let Some(path) = map_path {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading network map {}", path.display()))?;
        let network_map: NetworkMap = serde_json::from_str(&raw)
            .with_context(|| format!("parsing network map {}", path.display()))?;
        info!(serial = network_map.serial, "loaded network-map snapshot");
        messages.push(SyncResponse {
            network_map: Some(network_map),
        });
    }

    let relay = RelayManager::new();
    relay
        .set_serve_addresses(config.relay.serve_addresses.clone())
        .await;
    if let Some(proxy) = &config.relay.local_proxy {
        match proxy.parse() {
            Ok(addr) => relay.set_local_proxy(Some(addr)).await,
            Err(e) => warn!(proxy = %proxy, error = %e, "ignoring invalid relay proxy endpoint"),
        }
    }

    let deps = EngineDeps {
        driver: UserspaceDriver::new(
            &engine_config.iface_name,
            address,
            engine_config.udp_port,
        ),
        signal: LocalHub::new(),
        mgmt: StaticMgmtClient::new(messages),
        dns: RecordingDnsServer::new(),
        routes: RecordingRouteManager::new(engine_config.public_key().to_string()),
        relay,
        iface_lookup: Arc::new(config.iface_lookup()),
        ssh_factory: Arc::new(|| Ok(KeyStoreServer::new() as Arc<dyn SshServer>)),
    };

    let engine = Engine::new(engine_config, deps)?;
    info!(key = %engine.public_key(), "local identity");

    if let Err(e) = engine.start().await {
        error!(error = %e, "engine failed to start");
        return Ok(ExitCode::FAILURE);
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received, shutting down");

    match engine.stop().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "engine stopped with errors");
            Ok(ExitCode::FAILURE)
        }
    }
}
