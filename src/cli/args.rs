use clap::{Parser, Subcommand};

/// dbpool - exercise a bounded connection pool against a backend
#[derive(Parser, Debug)]
#[command(name = "dbpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file (falls back to DBPOOL_* environment variables)
    #[arg(long, global = true, env = "DBPOOL_CONFIG")]
    pub config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open the pool, lease one connection and print pool statistics
    Check,

    /// Hammer the pool with concurrent acquire/release cycles
    Bench {
        /// Number of concurrent workers
        #[arg(short, long, default_value = "16")]
        workers: usize,

        /// Acquire/release cycles per worker
        #[arg(short, long, default_value = "100")]
        iterations: usize,

        /// How long each lease is held, in milliseconds
        #[arg(long, default_value = "5")]
        hold_ms: u64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Commands::Bench {
            workers,
            iterations,
            ..
        } = &self.command
        {
            if *workers == 0 {
                anyhow::bail!("--workers must be at least 1");
            }
            if *iterations == 0 {
                anyhow::bail!("--iterations must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bench() {
        let cli = Cli::try_parse_from([
            "dbpool", "--log-level", "debug", "bench", "--workers", "4", "--hold-ms", "1",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Bench {
                workers,
                iterations,
                hold_ms,
            } => {
                assert_eq!(workers, 4);
                assert_eq!(iterations, 100);
                assert_eq!(hold_ms, 1);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let cli = Cli::try_parse_from(["dbpool", "bench", "--workers", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
