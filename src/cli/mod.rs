//! Command-line interface for dbpool
//!
//! ```bash
//! # Lease a single connection and show pool statistics
//! dbpool --config pool.yaml check
//!
//! # 32 workers, 500 cycles each, holding every lease for 2ms
//! dbpool bench --workers 32 --iterations 500 --hold-ms 2
//! ```

pub mod args;
pub mod commands;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::config;
use crate::pool::{ConnectionPool, TcpConnector};
use args::{Cli, Commands};

/// Run the CLI application
pub async fn run(cli: Cli) -> Result<()> {
    cli.validate().context("Invalid arguments")?;
    debug!("CLI arguments: {:?}", cli);

    let config = config::load_config(cli.config.as_deref())?;
    info!(
        pool = %config.name,
        backend = %config.connection.address(),
        capacity = config.capacity,
        "Starting dbpool"
    );

    let pool = ConnectionPool::new(config, TcpConnector::new())
        .await
        .context("Failed to create connection pool")?;

    let result = match cli.command {
        Commands::Check => commands::cmd_check(&pool).await.map(|_| ()),
        Commands::Bench {
            workers,
            iterations,
            hold_ms,
        } => commands::cmd_bench(&pool, workers, iterations, Duration::from_millis(hold_ms))
            .await
            .map(|_| ()),
    };

    pool.close().await;
    result
}

/// Initialize logging; `RUST_LOG` wins over `--log-level`
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
