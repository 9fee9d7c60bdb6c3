//! CDN edge proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                      EDGE                            │
//!   Client Request     │  ┌─────────┐   ┌───────┐   ┌────────┐   ┌──────┐     │
//!   ───────────────────┼─▶│   net   │──▶│ vhost │──▶│ access │──▶│ ddos │     │
//!                      │  │listener │   │router │   │ policy │   │      │     │
//!                      │  └─────────┘   └───────┘   └────────┘   └──┬───┘     │
//!                      │                                            ▼         │
//!                      │                 ┌──────────┐        ┌───────────┐    │
//!                      │                 │  cache   │◀──────▶│ upstream  │◀───┼── Origin
//!                      │                 │(lookup + │        │ pool/LB   │    │
//!                      │                 │  store)  │        └───────────┘    │
//!   Client Response    │  ┌──────────┐   └────┬─────┘                         │
//!   ◀──────────────────┼──│access log│◀───────┘                               │
//!                      │  └──────────┘                                        │
//!                      │                                                      │
//!                      │  config (hot reload) · health probes · lifecycle     │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use cdn_edge::config::{load_config, watcher::ConfigWatcher};
use cdn_edge::lifecycle::{signals::shutdown_on_signal, Shutdown, TaskQueue};
use cdn_edge::observability::{logging::init_logging, metrics::init_metrics};
use cdn_edge::routing::{VhostDefaults, VhostRegistry};
use cdn_edge::EdgeServer;

#[derive(Parser)]
#[command(name = "cdn-edge")]
#[command(version, about = "CDN edge proxy", long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if cli.check {
        println!(
            "{}: ok ({} vhosts)",
            cli.config.display(),
            config.vhosts.len()
        );
        return Ok(());
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cdn-edge starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = Arc::new(VhostRegistry::new(VhostDefaults::from_config(&config)));
    registry.install(&config.vhosts);

    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let tasks = TaskQueue::new(
        config.background.queue_capacity,
        config.background.concurrency,
    );

    // Reload swaps vhosts; listeners stay as bound at startup.
    let (watcher, mut updates) = ConfigWatcher::new(&cli.config, config.vhost_dir.as_deref());
    let _watcher = match watcher.run() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher disabled");
            None
        }
    };
    {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        registry.install(&update.vhosts);
                    }
                    _ = shutdown.wait() => break,
                }
            }
        });
    }

    let server = EdgeServer::new(config, registry, tasks, shutdown)?;
    server.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
