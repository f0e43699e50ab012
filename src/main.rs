//! netrecond - network traffic reconstruction daemon.
//!
//! Captures on an interface, tracks flows and prints reconstructed
//! credentials and transferred files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netrecon::analyzer::{CHAP_CHALLENGE_RESPONSE, CHAP_MSCHAPV2, TFTP_FILE};
use netrecon::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use netrecon::engine::Engine;
use netrecon::event::EventListener;
use netrecon::input::{InputChannel, PnetSource};
use netrecon::packet::InputId;
use netrecon::reporter::{ConsoleReporter, EventReporter, ReporterListener};

#[derive(Parser)]
#[command(name = "netrecond")]
#[command(about = "Reconstructs credentials and files from network traffic")]
struct Args {
    /// Network interface to capture on (e.g., eth0)
    #[arg(short, long)]
    interface: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of dispatcher workers (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// List available interfaces and exit
    #[arg(short, long)]
    list_interfaces: bool,

    /// Print byte fields in full
    #[arg(short, long)]
    verbose: bool,

    /// Also print this event (repeatable), e.g. tftp_request
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Log the engine status every N seconds
    #[arg(long)]
    status_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_interfaces {
        for name in PnetSource::list_interfaces() {
            println!("{}", name);
        }
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = EngineConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(interface) = args.interface.clone() {
        config.interface = Some(interface);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let source = match &config.interface {
        Some(name) => PnetSource::open(name),
        None => PnetSource::on_default_interface(),
    }
    .context("Failed to open capture")?;

    let engine = Arc::new(
        Engine::builder(config.clone())
            .build()
            .context("Failed to build engine")?,
    );

    let reporter: Arc<dyn EventReporter> = Arc::new(ConsoleReporter::new().with_verbose(args.verbose));
    let listener: Arc<dyn EventListener> = Arc::new(ReporterListener::new(reporter.clone()));
    let mut shown: Vec<String> = [CHAP_CHALLENGE_RESPONSE, CHAP_MSCHAPV2, TFTP_FILE]
        .iter()
        .map(|name| name.to_string())
        .collect();
    shown.extend(args.events.iter().cloned());
    for name in &shown {
        let definition = engine
            .bus()
            .definition(name)
            .with_context(|| format!("Unknown event '{}'", name))?;
        engine.bus().subscribe(&definition, listener.clone());
    }

    let input = InputChannel::spawn(source, InputId(0), config.input())
        .context("Failed to start capture")?;
    let shutdown = input.shutdown_handle();
    ctrlc::set_handler(move || shutdown.shutdown()).context("Failed to set signal handler")?;

    let status_task = args.status_interval.map(|secs| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(secs.max(1));
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::info!("engine status\n{}", engine.status());
            }
        })
    });

    reporter.on_start(input.name());
    let summary = engine.run(input).await.context("Capture failed")?;
    if let Some(task) = status_task {
        task.abort();
    }
    engine.shutdown();
    reporter.on_stop();

    tracing::info!(%summary, "capture finished");
    Ok(())
}
