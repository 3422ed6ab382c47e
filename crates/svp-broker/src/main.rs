//! SVP Broker - the Shared Variable Processor daemon.
//!
//! Interpreters and auxiliary processors connect here to offer, couple and
//! exchange shared variables.

use anyhow::{Context, Result};
use clap::Parser;
#[cfg(unix)]
use std::path::PathBuf;
use svp_core::{BrokerConfig, BrokerServer, SvpConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "svp-broker")]
#[command(about = "Shared Variable Processor broker")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = SvpConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = SvpConfig::DEFAULT_HOST)]
    host: String,

    /// Listen on a Unix-domain socket instead of TCP
    #[cfg(unix)]
    #[arg(long)]
    unix_path: Option<PathBuf>,

    /// Maximum number of live shared variables (unbounded if omitted)
    #[arg(long)]
    max_variables: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, visible_alias = "verbose", visible_short_alias = 'v')]
    debug: bool,
}

impl Args {
    fn broker_config(&self) -> Result<BrokerConfig> {
        let mut builder = BrokerConfig::builder().tcp(self.host.clone(), self.port);
        #[cfg(unix)]
        if let Some(path) = &self.unix_path {
            builder = builder.unix(path.clone());
        }
        if let Some(max) = self.max_variables {
            builder = builder.max_variables(max);
        }
        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting SVP broker");

    let config = args.broker_config()?;
    let endpoint = config.endpoint.clone();
    let handle = match BrokerServer::start(config).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Cannot listen on {}: {}", endpoint, e);
            return Err(e).with_context(|| format!("binding {}", endpoint));
        }
    };

    // Spawning interpreters read the port from stdout
    if let Some(port) = handle.port() {
        println!("SVP_PORT={}", port);
    }
    info!("SVP broker running on {}", handle.endpoint());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.join().await;

    Ok(())
}
