//! Bench command implementation

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use colored::Colorize;
use conduit_interop::backend::{PrimaryApi, PrimaryDevice, SecondaryApi};
use conduit_interop::loopback::LoopbackPlatform;
use conduit_interop::{DiagnosticPump, DiagnosticSink, InteropSession, SessionConfig, StrategyKind};
use conduit_shared::utils::{format_bytes, parse_size, throughput_mib_s};
use conduit_shared::TransferPayload;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Backend, BenchConfig};
use crate::output;

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Strategy to run
    #[arg(short, long, value_enum, default_value_t = StrategyArg::All)]
    pub strategy: StrategyArg,

    /// Payload directory (defaults to `data_dir` from the configuration)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Bytes per file (e.g., "256KiB")
    #[arg(short = 'u', long)]
    pub unit_len: Option<String>,

    /// Number of files
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Measured passes per strategy
    #[arg(short, long)]
    pub iterations: Option<u32>,

    /// Unmeasured passes per strategy
    #[arg(short, long)]
    pub warmup: Option<u32>,

    /// Backend: loopback or native
    #[arg(short, long)]
    pub backend: Option<Backend>,

    /// Requests in flight on the DMA queue
    #[arg(long)]
    pub dma_queue_capacity: Option<u16>,

    /// Enable the D3D12 debug layer
    #[arg(long)]
    pub debug_layer: bool,

    /// Read the shared buffer back after each strategy and compare it to
    /// the source
    #[arg(long)]
    pub verify: bool,

    /// Also write the report as JSON
    #[arg(long)]
    pub json: Option<PathBuf>,
}

impl BenchArgs {
    fn apply(&self, config: &mut BenchConfig) -> Result<()> {
        if let Some(dir) = &self.dir {
            config.data_dir = dir.clone();
        }
        if let Some(unit_len) = &self.unit_len {
            config.unit_len = parse_size(unit_len).context("Failed to parse unit length")?;
        }
        if let Some(count) = self.count {
            config.file_count = count;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(warmup) = self.warmup {
            config.warmup = warmup;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(capacity) = self.dma_queue_capacity {
            config.dma_queue_capacity = capacity;
        }
        if self.debug_layer {
            config.debug_layer = true;
        }
        Ok(())
    }
}

/// Strategy selection on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Single staged copy of the first file
    #[value(alias = "a")]
    Single,
    /// Reused staged copy over every file
    #[value(alias = "b")]
    Reused,
    /// DMA-engine queue over every file
    #[value(alias = "c")]
    Dma,
    /// All three, in that order
    All,
}

impl StrategyArg {
    pub fn strategies(self) -> Vec<StrategyKind> {
        match self {
            StrategyArg::Single => vec![StrategyKind::SingleStaged],
            StrategyArg::Reused => vec![StrategyKind::ReusedStaged],
            StrategyArg::Dma => vec![StrategyKind::DmaQueue],
            StrategyArg::All => StrategyKind::ALL.to_vec(),
        }
    }
}

/// Timing summary for one strategy
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub strategy: StrategyKind,
    pub units_per_pass: usize,
    pub bytes_per_pass: u64,
    pub passes: usize,
    pub min: Duration,
    pub mean: Duration,
    pub max: Duration,
    /// Throughput at the mean pass time
    pub mib_per_s: f64,
    pub verified: bool,
}

impl StrategyStats {
    fn from_passes(
        strategy: StrategyKind,
        units_per_pass: usize,
        bytes_per_pass: u64,
        passes: &[Duration],
    ) -> Option<Self> {
        let min = passes.iter().min().copied()?;
        let max = passes.iter().max().copied()?;
        let total: Duration = passes.iter().sum();
        let mean = total / u32::try_from(passes.len()).ok()?;
        Some(Self {
            strategy,
            units_per_pass,
            bytes_per_pass,
            passes: passes.len(),
            min,
            mean,
            max,
            mib_per_s: throughput_mib_s(bytes_per_pass, mean),
            verified: false,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub backend: Backend,
    pub adapter: String,
    pub unit_len: u64,
    pub file_count: usize,
    pub warmup: u32,
    pub results: Vec<StrategyStats>,
    pub dropped_diagnostics: u64,
}

pub async fn run(args: BenchArgs, mut config: BenchConfig) -> Result<()> {
    args.apply(&mut config)?;
    config.validate()?;
    let strategies = args.strategy.strategies();

    let payload =
        TransferPayload::from_directory(&config.data_dir, config.unit_len, config.file_count)
            .with_context(|| {
                format!(
                    "Payload in {} is incomplete (run `conduit generate` first)",
                    config.data_dir.display()
                )
            })?;

    output::info(&format!(
        "Benchmarking {} file(s) of {} on the {} backend",
        payload.file_count(),
        format_bytes(payload.unit_len()),
        config.backend
    ));

    let (sink, pump) = DiagnosticPump::spawn(config.diagnostics_capacity);
    let result = tokio::task::block_in_place(|| {
        run_backend(&config, &payload, &strategies, args.verify, sink.clone())
    });
    let logged = pump.shutdown().await;
    debug!("Diagnostic pump logged {} record(s)", logged);

    let mut report = result?;
    report.dropped_diagnostics = sink.dropped();
    if report.dropped_diagnostics > 0 {
        output::warning(&format!(
            "{} diagnostic record(s) were dropped",
            report.dropped_diagnostics
        ));
    }

    print_report(&report);

    if let Some(path) = &args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        output::success(&format!("Report written to {}", path.display()));
    }

    Ok(())
}

fn run_backend(
    config: &BenchConfig,
    payload: &TransferPayload,
    strategies: &[StrategyKind],
    verify: bool,
    sink: DiagnosticSink,
) -> Result<BenchReport> {
    match config.backend {
        Backend::Loopback => {
            let platform = LoopbackPlatform::single_adapter();
            bench(
                &platform.primary(),
                &platform.secondary(),
                config,
                payload,
                strategies,
                verify,
                sink,
            )
        }
        Backend::Native => run_native(config, payload, strategies, verify, sink),
    }
}

#[cfg(all(windows, feature = "native"))]
fn run_native(
    config: &BenchConfig,
    payload: &TransferPayload,
    strategies: &[StrategyKind],
    verify: bool,
    sink: DiagnosticSink,
) -> Result<BenchReport> {
    use conduit_interop::d3d12::D3D12Api;
    use conduit_interop::vulkan::VulkanApi;

    let primary = D3D12Api::new(config.debug_layer);
    let secondary = VulkanApi::new().context("Failed to initialize Vulkan")?;
    bench(&primary, &secondary, config, payload, strategies, verify, sink)
}

#[cfg(not(all(windows, feature = "native")))]
fn run_native(
    _config: &BenchConfig,
    _payload: &TransferPayload,
    _strategies: &[StrategyKind],
    _verify: bool,
    _sink: DiagnosticSink,
) -> Result<BenchReport> {
    bail!("The native backend needs Windows and a build with `--features native`")
}

/// Establish one session and time every strategy in it.
fn bench<PA, SA>(
    primary: &PA,
    secondary: &SA,
    config: &BenchConfig,
    payload: &TransferPayload,
    strategies: &[StrategyKind],
    verify: bool,
    sink: DiagnosticSink,
) -> Result<BenchReport>
where
    PA: PrimaryApi,
    SA: SecondaryApi,
{
    let session_config =
        SessionConfig::new(config.unit_len).with_dma_queue_capacity(config.dma_queue_capacity);
    let mut session = InteropSession::establish(primary, secondary, &session_config, sink)
        .context("Failed to establish interop session")?;
    info!(
        "Shared buffer of {} on {} ({})",
        format_bytes(session.len()),
        session.binding().device().adapter_name(),
        session.primary_identity()
    );

    let mut results = Vec::with_capacity(strategies.len());
    for &strategy in strategies {
        for _ in 0..config.warmup {
            session
                .run(strategy, payload)
                .with_context(|| format!("Warmup of {} failed", strategy))?;
        }

        let mut passes = Vec::with_capacity(config.iterations as usize);
        let mut units = 0;
        let mut bytes = 0;
        for iteration in 0..config.iterations {
            let report = session
                .run(strategy, payload)
                .with_context(|| format!("Pass {} of {} failed", iteration + 1, strategy))?;
            debug!("{} pass {}: {:?}", strategy, iteration + 1, report.elapsed);
            units = report.units;
            bytes = report.bytes;
            passes.push(report.elapsed);
        }

        let mut stats = StrategyStats::from_passes(strategy, units, bytes, &passes)
            .context("No measured passes")?;

        if verify {
            let expected_path = match strategy {
                StrategyKind::SingleStaged => payload.first_file(),
                _ => payload.last_file(),
            }
            .context("Payload has no source files")?;
            let expected = std::fs::read(expected_path)
                .with_context(|| format!("Failed to read {}", expected_path.display()))?;
            let actual = session.read_back().context("Failed to read back shared buffer")?;
            if actual != expected {
                bail!(
                    "{}: shared buffer does not match {}",
                    strategy,
                    expected_path.display()
                );
            }
            stats.verified = true;
        }

        results.push(stats);
    }

    let adapter = session.primary_identity().to_string();
    session.teardown().context("Failed to tear down interop session")?;

    Ok(BenchReport {
        backend: config.backend,
        adapter,
        unit_len: payload.unit_len(),
        file_count: payload.file_count(),
        warmup: config.warmup,
        results,
        dropped_diagnostics: 0,
    })
}

fn print_report(report: &BenchReport) {
    println!();
    output::heading(&format!(
        "{:<20} {:>10} {:>10} {:>10} {:>12}",
        "strategy", "min", "mean", "max", "MiB/s"
    ));
    for stats in &report.results {
        println!(
            "{:<20} {:>10.2?} {:>10.2?} {:>10.2?} {:>12}",
            stats.strategy.to_string(),
            stats.min,
            stats.mean,
            stats.max,
            format!("{:.1}", stats.mib_per_s).green()
        );
    }
    println!();

    if report.results.iter().any(|s| s.verified) {
        output::success("Shared buffer contents verified");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_payload(dir: &std::path::Path, len: usize, count: usize) {
        for index in 0..count {
            let bytes: Vec<u8> = (0..len).map(|i| (i * 7 + index * 13) as u8).collect();
            fs::write(dir.join(conduit_shared::data_file_name(index)), bytes).unwrap();
        }
    }

    #[test]
    fn test_strategy_argument_parsing() {
        #[derive(clap::Parser)]
        struct Cli {
            #[command(flatten)]
            bench: BenchArgs,
        }

        let parse = |args: &[&str]| {
            <Cli as clap::Parser>::try_parse_from(std::iter::once("bench").chain(args.iter().copied()))
                .map(|cli| cli.bench.strategy.strategies())
        };
        assert_eq!(parse(&[]).unwrap(), StrategyKind::ALL.to_vec());
        assert_eq!(parse(&["--strategy", "dma"]).unwrap(), vec![StrategyKind::DmaQueue]);
        assert_eq!(parse(&["-s", "b"]).unwrap(), vec![StrategyKind::ReusedStaged]);
        assert!(parse(&["--strategy", "fastest"]).is_err());
    }

    #[test]
    fn test_stats_from_passes() {
        let passes = [
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ];
        let stats = StrategyStats::from_passes(StrategyKind::DmaQueue, 4, 1 << 20, &passes).unwrap();
        assert_eq!(stats.min, Duration::from_millis(10));
        assert_eq!(stats.max, Duration::from_millis(30));
        assert_eq!(stats.mean, Duration::from_millis(20));
        assert!((stats.mib_per_s - 50.0).abs() < 1e-9);

        assert!(StrategyStats::from_passes(StrategyKind::DmaQueue, 0, 0, &[]).is_none());
    }

    #[test]
    fn test_loopback_bench_verifies_every_strategy() {
        let dir = tempfile::tempdir().unwrap();
        write_payload(dir.path(), 2048 + 5, 4);
        let config = BenchConfig {
            data_dir: dir.path().to_path_buf(),
            unit_len: 2048 + 5,
            file_count: 4,
            iterations: 2,
            warmup: 1,
            backend: Backend::Loopback,
            ..BenchConfig::default()
        };
        let payload = TransferPayload::from_directory(dir.path(), config.unit_len, 4).unwrap();

        let report = run_backend(
            &config,
            &payload,
            &StrategyKind::ALL,
            true,
            DiagnosticSink::disabled(),
        )
        .unwrap();

        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|s| s.verified && s.passes == 2));
        assert_eq!(report.results[0].units_per_pass, 1);
        assert_eq!(report.results[2].units_per_pass, 4);
        assert_eq!(report.results[2].bytes_per_pass, 4 * (2048 + 5));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "loopback");
        assert_eq!(json["results"][2]["strategy"], "dma_queue");
    }

    #[test]
    fn test_mismatched_unit_length_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_payload(dir.path(), 512, 2);
        let config = BenchConfig {
            unit_len: 1024,
            backend: Backend::Loopback,
            ..BenchConfig::default()
        };
        let payload = TransferPayload::from_directory(dir.path(), 512, 2).unwrap();

        let err = run_backend(
            &config,
            &payload,
            &[StrategyKind::SingleStaged],
            false,
            DiagnosticSink::disabled(),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("1024"));
    }
}
