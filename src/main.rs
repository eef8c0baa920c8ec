//! `autopower` command line front end.
//!
//! ```text
//! autopower run --config tester.toml [--pseudo] [--auto-ack] [--model F966 ...] [--imei 35... ...]
//! autopower check-config --config tester.toml
//! ```

use anyhow::{bail, Context, Result};
use autopower::config::{AppConfig, ModelProfile};
use autopower::console::OperatorConsole;
use autopower::dispatch::Dispatched;
use autopower::instrument::simulated::{SimulatedBus, TraceShape};
use autopower::instrument::{gpib_bus, HandleRegistry, PowerSupplyBus};
use autopower::measurement::Imei;
use autopower::messages::RunEntry;
use autopower::orchestrator;
use autopower::sink::JsonLinesSink;
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autopower")]
#[command(about = "Automated power-failure tests on GPIB power supplies")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured models
    Run(RunArgs),
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Use simulated supplies instead of the GPIB bus
    #[arg(long)]
    pseudo: bool,

    /// Acknowledge device checks without asking
    #[arg(long)]
    auto_ack: bool,

    /// Only run these models, in this order
    #[arg(short, long = "model", value_name = "MODEL_ID")]
    models: Vec<String>,

    /// IMEI of the device under test, one per model in run order
    #[arg(long = "imei", value_name = "IMEI", value_parser = Imei::parse)]
    imeis: Vec<Imei>,

    /// Seed for simulated traces
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autopower={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("loading configuration from {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    init_logging("info");
    let config = load_config(path)?;
    let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
    println!("{}", rendered);
    println!("# {} model(s) valid", config.models.len());
    Ok(())
}

/// Simulated supplies that draw mid-band current for every profile voltage.
fn pseudo_bus(profiles: &[ModelProfile], seed: u64) -> SimulatedBus {
    profiles.iter().fold(SimulatedBus::new(seed), |bus, profile| {
        let thresholds = &profile.thresholds;
        let mean = (thresholds.pass_min + thresholds.pass_max) / 2.0;
        let jitter = (thresholds.pass_max - thresholds.pass_min) / 10.0;
        bus.with_voltage_trace(profile.voltage, TraceShape::Noisy { mean, jitter })
    })
}

/// Operator answer to a device check.
#[derive(Debug, PartialEq)]
enum Reply {
    Acknowledge,
    Skip,
    CancelRun,
}

/// Waits for a prompt answer. An interrupt while waiting cancels the run;
/// end of input does too.
async fn await_reply<A, I>(answer: A, interrupt: I) -> Result<Reply>
where
    A: Future<Output = std::io::Result<Option<String>>>,
    I: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        line = answer => Ok(match line?.as_deref().map(str::trim) {
            Some(text) if text.eq_ignore_ascii_case("s") => Reply::Skip,
            Some(text) if text.eq_ignore_ascii_case("c") => Reply::CancelRun,
            Some(_) => Reply::Acknowledge,
            None => Reply::CancelRun,
        }),
        Ok(()) = interrupt => {
            warn!("Interrupted at device check; cancelling run");
            Ok(Reply::CancelRun)
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    init_logging(&config.application.log_level);

    let profiles = config.profiles(&args.models)?;
    if profiles.is_empty() {
        bail!("no models configured in {}", args.config.display());
    }
    let entries = RunEntry::pair(profiles.clone(), args.imeis)?;

    let bus: Arc<dyn PowerSupplyBus> = if args.pseudo || config.application.pseudo_mode {
        let seed = args.seed.unwrap_or_else(rand::random);
        info!(seed, "Pseudo mode: using simulated supplies");
        Arc::new(pseudo_bus(&profiles, seed))
    } else {
        gpib_bus().context("GPIB bus unavailable (try --pseudo)")?
    };

    let measurement = config.measurement.clone();
    let registry = HandleRegistry::new(bus, measurement.connect_timeout, measurement.command_timeout);
    let sink = JsonLinesSink::new(config.application.result_dir());
    let (handle, mut progress) =
        orchestrator::spawn(registry, Box::new(sink), measurement, config.retry.clone());

    let mut console = OperatorConsole::new(handle.control().clone(), args.auto_ack);
    let mut dispatcher = OperatorConsole::dispatcher();
    let mut answers = BufReader::new(tokio::io::stdin()).lines();

    handle.control().start(entries)?;

    loop {
        tokio::select! {
            outcome = dispatcher.dispatch_next(&mut console, &mut progress, Duration::from_millis(250)) => {
                if outcome == Dispatched::Closed {
                    break;
                }
            }
            Ok(()) = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling run");
                console.cancel(false)?;
            }
        }

        for line in console.take_lines() {
            println!("{}", line);
        }

        if let Some(check) = console.next_pending_check().cloned() {
            println!("{}", check.question);
            println!("[Enter] acknowledge  [s] skip {}  [c] cancel run", check.model_id);
            match await_reply(answers.next_line(), tokio::signal::ctrl_c()).await? {
                Reply::Acknowledge => console.acknowledge()?,
                Reply::Skip => console.cancel(true)?,
                Reply::CancelRun => console.cancel(false)?,
            }
        }

        if console.run_finished() {
            break;
        }
    }

    dispatcher.drain(&mut console, &mut progress);
    for line in console.take_lines() {
        println!("{}", line);
    }
    println!("{}", console.summary());

    drop(console);
    handle.shutdown().await.context("orchestrator task failed")?;
    Ok(())
}
