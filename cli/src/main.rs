//! CLI for Conduit
//!
//! Commands:
//! - generate: write the random payload files
//! - bench: move the payload into shared GPU memory and time each strategy
//! - probe: list adapters and the queue plan

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod output;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit - D3D12/Vulkan shared memory transfer benchmark", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); `conduit.toml` is read if present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write random payload files (file0.bin .. fileN.bin)
    Generate(commands::generate::GenerateArgs),

    /// Benchmark transfer strategies into the shared buffer
    Bench(commands::bench::BenchArgs),

    /// Show adapters, queue families and the planned queues
    Probe(commands::probe::ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        output::error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::BenchConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate(args) => commands::generate::run(args, config),
        Commands::Bench(args) => commands::bench::run(args, config).await,
        Commands::Probe(args) => commands::probe::run(args, config),
    }
}

/// Directives used when `RUST_LOG` is unset: Conduit's own crates at
/// `info` (or `debug` with `--verbose`), everything else at `warn`.
fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!(
        "warn,conduit={level},conduit_interop={level},conduit_shared={level}",
        level = level
    )
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        for verbose in [false, true] {
            let directives = default_directives(verbose);
            EnvFilter::try_new(&directives).unwrap();
        }
        assert!(default_directives(true).contains("conduit_interop=debug"));
        assert!(default_directives(false).starts_with("warn,"));
    }

    #[test]
    fn test_global_flags_reach_subcommands() {
        let cli = Cli::try_parse_from(["conduit", "probe", "-v", "--config", "bench.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("bench.toml")));
        assert!(matches!(cli.command, Commands::Probe(_)));
    }
}
