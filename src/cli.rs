//! Command-line interface.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cache::MemoryCache;
use crate::config::Config;
use crate::scheduler::store::InMemoryReminderStore;
use crate::scheduler::ReminderScheduler;
use crate::server::ota::InMemoryDeviceRepository;
use crate::server::registry::SessionRegistry;
use crate::server::ServerState;
use crate::session::report::NullReportSink;
use crate::session::{DefaultAdapterFactory, GatewayContext, StaticBindingSource};

#[derive(Parser)]
#[command(name = "voxbridge")]
#[command(about = "Real-time voice-assistant gateway for embedded devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server
    Serve {
        /// Listen host
        #[arg(long)]
        host: Option<String>,
        /// Listen port
        #[arg(long)]
        port: Option<u16>,
        /// Path to a config file (defaults to the user config dir)
        #[arg(long)]
        config: Option<std::path::PathBuf>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { host, port, config } => {
            let config = match config {
                Some(path) => Config::load_from(path)?,
                None => Config::load()?,
            };
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(Arc::new(config), &host, port).await
        }
    }
}

async fn serve(config: Arc<Config>, host: &str, port: u16) -> Result<()> {
    let cache = Arc::new(MemoryCache::new());
    let registry = SessionRegistry::new();
    let store = Arc::new(InMemoryReminderStore::new());
    let scheduler = ReminderScheduler::new(store, registry.clone(), None);

    scheduler.restore_pending().await;
    let scheduler_task = scheduler.clone();
    tokio::spawn(scheduler_task.run());
    info!("reminder scheduler running");

    let ctx = GatewayContext {
        config: config.clone(),
        cache,
        registry,
        scheduler,
        bindings: Arc::new(StaticBindingSource {
            config: config.clone(),
        }),
        adapters: Arc::new(DefaultAdapterFactory {
            config: config.clone(),
        }),
        report_sink: Arc::new(NullReportSink),
    };

    let state = ServerState {
        ctx,
        devices: Arc::new(InMemoryDeviceRepository::new()),
        broker: None,
    };

    crate::server::start(state, host, port).await
}
