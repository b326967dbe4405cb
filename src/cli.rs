//! Command-line entry points.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use wayfinder_agent::{AgentController, BrowserHost, LogStore, ScreenshotStore, TaskLogLayer};

use crate::bridge::{self, BridgeState, WsBrowserHost};
use crate::build_tag;
use crate::config::ConfigStore;
use crate::llm::ProviderEngineFactory;

#[derive(Parser)]
#[command(
    name = "wayfinder",
    version,
    about = "Autonomous browser-side web agent controller"
)]
pub struct Cli {
    /// Path to the configuration file (defaults to the platform config dir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge server the browser extension connects to.
    Serve(ServeArgs),
    /// Validate the configuration file and report ignored values.
    CheckConfig,
    /// Print version and build information.
    BuildInfo,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port for the panel/helper/host WebSocket endpoints.
    #[arg(long, default_value_t = 8321)]
    pub port: u16,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = cli
        .config
        .map(ConfigStore::new)
        .unwrap_or_default();

    match cli.command {
        Commands::Serve(args) => serve(args, store).await,
        Commands::CheckConfig => check_config(&store),
        Commands::BuildInfo => {
            println!("wayfinder {}", build_tag());
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs, store: ConfigStore) -> Result<()> {
    let logs = Arc::new(LogStore::new());
    init_tracing(logs.clone());

    let config = store.load()?;
    let screenshots = Arc::new(ScreenshotStore::new());
    let host = Arc::new(WsBrowserHost::new());
    let controller = Arc::new(AgentController::new(
        host.clone() as Arc<dyn BrowserHost>,
        Arc::new(ProviderEngineFactory),
        config,
        logs,
        screenshots,
        build_tag(),
    ));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;
    info!(config = %store.path().display(), "starting wayfinder bridge");
    bridge::serve(addr, BridgeState { controller, host }).await
}

fn check_config(store: &ConfigStore) -> Result<()> {
    let rejected = store.rejected_keys()?;
    if rejected.is_empty() {
        println!("configuration OK: {}", store.path().display());
    } else {
        println!(
            "configuration loaded with {} ignored value(s): {}",
            rejected.len(),
            rejected.join(", ")
        );
    }
    Ok(())
}

fn init_tracing(logs: Arc<LogStore>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(TaskLogLayer::new(logs))
        .init();
}
