//! CLI for the Tether lifecycle and access-coordination substrate.
//!
//! Stress pipeline: start application -> build ownership forest ->
//! concurrent readers vs. queued writes -> teardown -> shutdown -> report.

mod report;
mod stress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tether_app::{AppConfig, Application};

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Lifecycle and access-coordination diagnostics")]
struct Cli {
    /// JSON configuration file; defaults apply when absent.
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Capture creation backtraces for leak reports.
    #[arg(long, global = true, env = "TETHER_DEBUG_DISPOSER", default_value_t = false)]
    debug_disposer: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Exercise the ownership tree and the access rule under load.
    Stress {
        #[arg(long, default_value_t = 8)]
        roots: usize,

        #[arg(long, default_value_t = 4)]
        depth: usize,

        #[arg(long, default_value_t = 4)]
        fanout: usize,

        /// Parallel reader tasks.
        #[arg(long, default_value_t = 8)]
        readers: usize,

        #[arg(long, default_value_t = 500)]
        reads_per_reader: usize,

        /// Write actions pushed to the write thread.
        #[arg(long, default_value_t = 200)]
        writes: usize,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.debug_disposer {
        config.disposer.debug_mode = true;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", config.to_json()?);
        }
        Commands::Stress {
            roots,
            depth,
            fanout,
            readers,
            reads_per_reader,
            writes,
            json,
        } => {
            let params = stress::StressParams {
                roots,
                depth,
                fanout,
                readers,
                reads_per_reader,
                writes,
            };
            tracing::info!(roots, depth, fanout, readers, writes, "starting stress run");

            // Lock waits and rayon joins block; keep them off the runtime workers.
            let report = tokio::task::spawn_blocking(move || -> tether_core::TetherResult<_> {
                let app = Application::start(config)?;
                let outcome = stress::run(&app, &params)?;
                let shutdown = app.shutdown()?;
                Ok(report::StressReport::build(&params, outcome, shutdown))
            })
            .await??;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }

            if !report.is_clean() {
                return Err("stress run found problems".into());
            }
        }
    }

    Ok(())
}
