//! tfuzz entry point.
//!
//! `tfuzz run` supervises one worker process per shard (or runs a single
//! worker in-process), `tfuzz worker` runs one shard, and `tfuzz dedup`
//! groups persisted cases by crash signature.

mod signals;
mod supervisor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tfuzz_common::FuzzConfig;
use tfuzz_engine::{deduplicate, CampaignBuilder, CampaignExit};
use tracing::{error, info, info_span, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::signals::SignalHandler;
use crate::supervisor::Supervisor;

const CONFIG_ENV: &str = "TFUZZ_CONFIG_PATH";
const LOCAL_CONFIG: &str = "tfuzz.toml";
const EFFECTIVE_CONFIG: &str = "tfuzz_effective_config.toml";

/// tfuzz command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tfuzz",
    about = "Differential fuzzer for the Rust trait system",
    version,
    long_about = None
)]
struct Args {
    /// Path to a campaign configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a campaign (default).
    Run(RunArgs),

    /// Run one shard; started by `run`.
    #[command(hide = true)]
    Worker {
        /// Shard index.
        #[arg(long)]
        index: usize,
        /// Number of shards.
        #[arg(long)]
        count: usize,
    },

    /// Group persisted cases by crash signature.
    Dedup {
        /// Result category to scan.
        #[arg(long, default_value = "crash")]
        category: String,
        /// Report file.
        #[arg(long, short = 'o', default_value = "deduplication_report.json")]
        output: PathBuf,
    },
}

/// Overrides applied on top of the configuration file.
#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Number of worker processes.
    #[arg(long)]
    workers: Option<usize>,

    /// Iterations per worker.
    #[arg(long)]
    iterations: Option<u64>,

    /// Only run structural strategies.
    #[arg(long, overrides_with = "all_strategies")]
    structural_only: bool,

    /// Run every strategy.
    #[arg(long)]
    all_strategies: bool,

    /// Cap on case directories across all categories.
    #[arg(long)]
    max_cases: Option<usize>,

    /// Cap on the results tree size in GiB.
    #[arg(long)]
    max_results_gb: Option<f64>,

    /// Stop when free space drops below this many GiB.
    #[arg(long)]
    min_free_gb: Option<f64>,

    /// Success cases to keep (-1 = unlimited).
    #[arg(long, allow_hyphen_values = true)]
    keep_success_cases: Option<i64>,

    /// Error cases to keep (-1 = unlimited).
    #[arg(long, allow_hyphen_values = true)]
    keep_error_cases: Option<i64>,

    /// Fate cases to keep (-1 = unlimited).
    #[arg(long, allow_hyphen_values = true)]
    keep_fate_cases: Option<i64>,

    /// Rewritten seeds to keep (-1 = unlimited).
    #[arg(long, allow_hyphen_values = true)]
    keep_rewritten_cases: Option<i64>,

    /// Flag nightly/next-solver disagreement.
    #[arg(long, overrides_with = "no_detect_miscompilation")]
    detect_miscompilation: bool,

    /// Do not flag nightly/next-solver disagreement.
    #[arg(long)]
    no_detect_miscompilation: bool,

    /// Promote accepted constraint injections into new seed pools.
    #[arg(long, overrides_with = "no_promote_success")]
    promote_success: bool,

    /// Do not promote.
    #[arg(long)]
    no_promote_success: bool,

    /// Seeds per promoted pool before rolling to the next.
    #[arg(long)]
    new_seeds_max: Option<usize>,

    /// Prefix of promoted pool directories.
    #[arg(long)]
    new_seeds_prefix: Option<String>,

    /// Time workers get to stop after a shutdown signal.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    grace_period: Duration,
}

fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl RunArgs {
    /// Overrides for a bare `tfuzz` invocation.
    fn default_grace() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            ..Self::default()
        }
    }

    fn apply(&self, config: &mut FuzzConfig) {
        if let Some(workers) = self.workers {
            config.fuzzer.workers = workers;
        }
        if let Some(iterations) = self.iterations {
            config.fuzzer.iterations = iterations;
        }
        if let Some(structural_only) = toggle(self.structural_only, self.all_strategies) {
            config.fuzzer.structural_only = structural_only;
        }

        let retention = &mut config.retention;
        if self.max_cases.is_some() {
            retention.max_cases = self.max_cases;
        }
        if self.max_results_gb.is_some() {
            retention.max_results_gb = self.max_results_gb;
        }
        if self.min_free_gb.is_some() {
            retention.min_free_gb = self.min_free_gb;
        }
        for (flag, field) in [
            (self.keep_success_cases, &mut retention.keep_success_cases),
            (self.keep_error_cases, &mut retention.keep_error_cases),
            (self.keep_fate_cases, &mut retention.keep_fate_cases),
            (self.keep_rewritten_cases, &mut retention.keep_rewritten_cases),
        ] {
            if let Some(value) = flag {
                *field = value;
            }
        }
        if let Some(on) = toggle(self.detect_miscompilation, self.no_detect_miscompilation) {
            retention.detect_miscompilation = on;
        }
        if let Some(on) = toggle(self.promote_success, self.no_promote_success) {
            retention.promote_success = on;
        }
        if let Some(max) = self.new_seeds_max {
            retention.new_seeds_max = max;
        }
        if let Some(prefix) = &self.new_seeds_prefix {
            retention.new_seeds_prefix.clone_from(prefix);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (config, source) = load_config(args.config.as_deref())?;

    match args.command.unwrap_or_else(|| Cmd::Run(RunArgs::default_grace())) {
        Cmd::Run(run) => {
            let mut config = config;
            run.apply(&mut config);
            config.validate().context("invalid configuration")?;
            run_campaign(config, &source, &args.log_level, run.grace_period)
        }
        Cmd::Worker { index, count } => {
            let console = index == 0 || config.fuzzer.worker_console_logging;
            init_logging(&args.log_level, Some(&config.paths.logs), index, console)?;
            info!(config = %source, "configuration loaded");
            let signals = SignalHandler::new().context("failed to set up signal handlers")?;
            run_worker(config, index, count, &signals)
        }
        Cmd::Dedup { category, output } => {
            init_logging(&args.log_level, None, 0, true)?;
            let report = deduplicate(&config.paths.results, &category)
                .with_context(|| format!("failed to scan {category} cases"))?;
            report
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            info!(
                category = %category,
                unique = report.total_unique,
                report = %output.display(),
                "deduplication report written"
            );
            Ok(())
        }
    }
}

/// Initialize logging: a per-worker file without ANSI colors plus an optional console layer.
///
/// `RUST_LOG` overrides the level-based default filter.
fn init_logging(level: &str, logs: Option<&Path>, worker: usize, console: bool) -> Result<()> {
    let filter = format!(
        "tfuzz={level},tfuzz_engine={level},tfuzz_adapters={level},tfuzz_common={level}"
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let file_layer = match logs {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let path = dir.join(format!("fuzzer_worker_{worker}.log"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("failed to initialize logging")
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TFUZZ_CONFIG_PATH` environment variable
/// 3. `./tfuzz.toml`
/// 4. Built-in defaults
///
/// Logging is not up yet, so the chosen source is returned for later reporting.
fn load_config(path: Option<&Path>) -> Result<(FuzzConfig, String)> {
    if let Some(config_path) = path {
        let config = FuzzConfig::from_file(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?;
        return Ok((config, config_path.display().to_string()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            let config = FuzzConfig::from_file(&config_path)
                .with_context(|| format!("failed to load config from {CONFIG_ENV}={env_path}"))?;
            return Ok((config, env_path));
        }
        eprintln!("{CONFIG_ENV}={env_path} does not exist, checking other locations");
    }

    let local_path = PathBuf::from(LOCAL_CONFIG);
    if local_path.exists() {
        let config = FuzzConfig::from_file(&local_path)
            .with_context(|| format!("failed to load config from {LOCAL_CONFIG}"))?;
        return Ok((config, LOCAL_CONFIG.to_string()));
    }

    Ok((FuzzConfig::default(), "built-in defaults".to_string()))
}

/// Run one shard to completion.
fn run_worker(config: FuzzConfig, index: usize, count: usize, signals: &SignalHandler) -> Result<()> {
    let span = info_span!("worker", index);
    let _enter = span.enter();

    let logs = config.paths.logs.clone();
    let observer = signals.clone();
    let mut campaign = CampaignBuilder::new(config)
        .shard(index, count)
        .shutdown(move || observer.shutdown_requested())
        .build()
        .context("failed to set up campaign")?;

    let exit = match campaign.run() {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker stopped on unexpected error");
            return Err(e);
        }
    };
    match exit {
        CampaignExit::Completed => info!("iterations complete"),
        CampaignExit::Interrupted => info!(
            signals = signals.state().signal_count(),
            "stopped on shutdown request"
        ),
        CampaignExit::NoSeeds | CampaignExit::SeedsExhausted => warn!(?exit, "ran out of seeds"),
        CampaignExit::DiskBudget => warn!("stopped: free disk space below minimum"),
    }

    let snapshot = campaign.metrics().snapshot();
    let path = logs.join(format!("worker_{index}_metrics.json"));
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!(path = %path.display(), error = %e, "cannot write metrics snapshot");
            }
        }
        Err(e) => warn!(error = %e, "cannot serialize metrics snapshot"),
    }
    Ok(())
}

/// Run in-process for one worker, otherwise supervise worker processes.
fn run_campaign(config: FuzzConfig, source: &str, log_level: &str, grace: Duration) -> Result<()> {
    let workers = config.fuzzer.workers;
    let signals = SignalHandler::new().context("failed to set up signal handlers")?;

    if workers <= 1 {
        init_logging(log_level, Some(&config.paths.logs), 0, true)?;
        info!(version = env!("CARGO_PKG_VERSION"), config = %source, "starting tfuzz");
        return run_worker(config, 0, 1, &signals);
    }

    init_logging(log_level, None, 0, true)?;
    info!(version = env!("CARGO_PKG_VERSION"), config = %source, workers, "starting tfuzz");

    // Workers re-read the merged configuration so command-line overrides reach them.
    std::fs::create_dir_all(&config.paths.logs)
        .with_context(|| format!("failed to create {}", config.paths.logs.display()))?;
    let effective = config.paths.logs.join(EFFECTIVE_CONFIG);
    let toml = config.to_toml().context("failed to serialize configuration")?;
    std::fs::write(&effective, toml)
        .with_context(|| format!("failed to write {}", effective.display()))?;

    let exe = std::env::current_exe().context("cannot locate the tfuzz executable")?;
    let report = Supervisor::new(exe, effective, log_level, workers, grace).run(&signals)?;
    if report.failed > 0 {
        anyhow::bail!("{} of {workers} workers failed", report.failed);
    }
    Ok(())
}
