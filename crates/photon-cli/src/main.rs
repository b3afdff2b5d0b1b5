//! `photon-cli` – Photon Command Line Interface
//!
//! Runs treatment protocols against a simulated device set with the full
//! safety core wired in.
//!
//! ```text
//! photon run    <protocol.json>   execute a protocol
//! photon check  <protocol.json>   validate a protocol without touching hardware
//! photon config [--init]          print the effective config (or write defaults)
//! ```
//!
//! During `run`, **Ctrl-C** latches the arbiter's emergency stop, which
//! disables the laser and fails the protocol at its next yield point.

mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use photon_hal::{DeviceRegistry, SimRegistry};
use photon_kernel::{LaserCutoff, SafetyArbiter, SensorMonitor, WatchdogBridge};
use photon_middleware::{EventBus, FanoutSink, MemorySink, Topic, TracingSink};
use photon_runtime::telemetry;
use photon_runtime::{ExecutionError, ExecutionReport, ProtocolEngine};
use photon_types::{
    DeviceKind, EventPayload, EventSink, Protocol, SafetyCondition, SafetyState,
};

const SKIN_CONTACT: &str = "skin_contact";

#[derive(Parser, Debug)]
#[command(name = "photon")]
#[command(about = "Laser treatment device safety core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Commands {
    /// Execute a protocol on simulated devices
    Run {
        /// Protocol file (JSON)
        protocol: PathBuf,
    },

    /// Validate a protocol without touching hardware
    Check {
        /// Protocol file (JSON)
        protocol: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            eprintln!("  Using default configuration.");
            config::Config::default()
        }
    };
    // Before any runtime exists; the exporter is synchronous.
    let _guard = telemetry::init_tracing("photon", cfg.log_format());

    let outcome = match cli.command {
        Commands::Config { init } => show_config(&cfg, init),
        Commands::Check { protocol } => check(&cfg, &protocol),
        Commands::Run { protocol } => tokio::runtime::Runtime::new()
            .map_err(|e| format!("Failed to start runtime: {e}"))
            .and_then(|rt| rt.block_on(run(&cfg, &protocol))),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_protocol(path: &Path) -> Result<Protocol, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read protocol at {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Failed to parse protocol: {}", e))
}

fn sim_devices() -> Result<photon_hal::SimDevices, String> {
    SimRegistry::new()
        .with_laser()
        .with_actuator()
        .with_illumination()
        .with_controller()
        .with_sensor(SKIN_CONTACT)
        .build()
        .map_err(|e| format!("Failed to bring up devices: {e}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn show_config(cfg: &config::Config, init: bool) -> Result<(), String> {
    let path = config::config_path();
    if init {
        if path.exists() {
            return Err(format!("{} already exists", path.display()));
        }
        config::save(&config::Config::default())?;
        println!("  {} Config written to {}", "✓".green().bold(), path.display().to_string().bold());
        return Ok(());
    }
    println!("  {} {}", "Config:".bold(), path.display());
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {e}"))?;
    println!("{raw}");
    Ok(())
}

fn check(cfg: &config::Config, path: &Path) -> Result<(), String> {
    let protocol = load_protocol(path)?;
    let devices = sim_devices()?;
    let engine = ProtocolEngine::new(
        Arc::new(devices.registry),
        Arc::new(SafetyArbiter::standard()),
        cfg.engine_config(),
    )
    .with_verifier(cfg.verifier());
    engine.validate(&protocol).map_err(|e| e.to_string())?;

    println!(
        "  {} {} ({} actions)",
        "✓".green().bold(),
        protocol.name.bold(),
        protocol.len()
    );
    for (index, step) in protocol.steps.iter().enumerate() {
        println!("    {:>3}. {}", index + 1, step.action.describe());
    }
    Ok(())
}

async fn run(cfg: &config::Config, path: &Path) -> Result<(), String> {
    let protocol = load_protocol(path)?;
    let devices = sim_devices()?;
    if let Some(sensor) = devices.probe(SKIN_CONTACT) {
        sensor.set_reading(1.0);
    }
    let registry = Arc::new(devices.registry);

    // ── Event plumbing ────────────────────────────────────────────────────
    let bus = EventBus::default();
    let audit = Arc::new(MemorySink::new());
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(bus.clone()))
            .with(audit.clone()),
    );

    // ── Safety core ───────────────────────────────────────────────────────
    let arbiter = Arc::new(
        SafetyArbiter::new(
            SafetyCondition::standard()
                .into_iter()
                .chain([SafetyCondition::WatchdogAlive]),
        )
        .with_sink(Arc::clone(&sink)),
    );
    let laser = registry
        .laser()
        .ok_or_else(|| "no laser channel registered".to_string())?;
    LaserCutoff::install(&arbiter, Arc::clone(&laser));

    let link = device(&registry, DeviceKind::Controller)?;
    let watchdog = Arc::new(
        WatchdogBridge::new(link, Arc::clone(&arbiter), cfg.watchdog_config())
            .with_laser(Arc::clone(&laser))
            .with_sink(Arc::clone(&sink)),
    )
    .spawn();

    let sensor = device(&registry, DeviceKind::Sensor)?;
    let monitor_config = cfg.monitor_config();
    let settle = monitor_config.interval * (monitor_config.threshold + 2)
        + cfg.watchdog_config().interval * 2;
    let monitor = Arc::new(SensorMonitor::new(
        sensor,
        SafetyCondition::Custom(SKIN_CONTACT.to_string()),
        Arc::clone(&arbiter),
        monitor_config,
    ))
    .spawn();

    for condition in SafetyCondition::standard() {
        arbiter
            .set_condition(condition, true)
            .map_err(|e| e.to_string())?;
    }

    let stop_arbiter = Arc::clone(&arbiter);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – emergency stop".yellow().bold());
        stop_arbiter.trigger_emergency_stop("operator Ctrl-C");
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── Execution ─────────────────────────────────────────────────────────
    let outcome = match wait_until_permitted(&arbiter, settle).await {
        Ok(()) => {
            let mut engine = ProtocolEngine::new(
                Arc::clone(&registry),
                Arc::clone(&arbiter),
                cfg.engine_config(),
            )
            .with_verifier(cfg.verifier())
            .with_sink(Arc::clone(&sink))
            .with_bus(bus.clone());

            let printer = tokio::spawn(print_progress(bus.clone()));
            println!("  {} {}", "Running".bold().cyan(), protocol.name.bold());
            let result = engine.execute(&protocol).await;
            printer.abort();
            result.map_err(|e| describe_failure(&e))
        }
        Err(e) => Err(e),
    };

    // ── Teardown ──────────────────────────────────────────────────────────
    watchdog.shutdown().await;
    monitor.shutdown().await;
    let shutdown = tokio::task::spawn_blocking(move || registry.shutdown()).await;
    match shutdown {
        Ok(Ok(())) => info!("devices shut down"),
        Ok(Err(e)) => warn!(error = %e, "device shutdown incomplete"),
        Err(e) => warn!(error = %e, "device shutdown task failed"),
    }
    println!("  {} {} audit records", "Audit:".bold(), audit.len());

    let report = outcome?;
    print_report(&report);
    Ok(())
}

fn device(registry: &DeviceRegistry, kind: DeviceKind) -> Result<Arc<photon_hal::DeviceChannel>, String> {
    registry
        .by_kind(kind)
        .ok_or_else(|| format!("no {kind} channel registered"))
}

async fn wait_until_permitted(arbiter: &SafetyArbiter, limit: Duration) -> Result<(), String> {
    let mut state = arbiter.watch();
    match tokio::time::timeout(limit, state.wait_for(|s| s.permits_action())).await {
        Ok(Ok(_)) => Ok(()),
        _ => {
            let failing: Vec<String> = arbiter
                .conditions()
                .into_iter()
                .filter(|(_, ok)| !ok)
                .map(|(c, _)| c.to_string())
                .collect();
            Err(format!(
                "device not ready ({}): {}",
                arbiter.state(),
                failing.join(", ")
            ))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

async fn print_progress(bus: EventBus) {
    let mut progress = bus.subscribe_to(Topic::Protocol);
    while let Some(event) = progress.next().await {
        if let EventPayload::Progress(p) = event.payload {
            println!(
                "    {} {}",
                format!("[{}/{}]", p.index + 1, p.total).dimmed(),
                p.description
            );
        }
    }
}

fn describe_failure(error: &ExecutionError) -> String {
    match error {
        ExecutionError::NotPermitted(SafetyState::EmergencyStop)
        | ExecutionError::PermissionRevoked {
            state: SafetyState::EmergencyStop,
            ..
        } => format!("{error}; reset the emergency stop before retrying"),
        _ => error.to_string(),
    }
}

fn print_report(report: &ExecutionReport) {
    println!();
    println!("  {} {}", "✓".green().bold(), "Protocol completed".bold());
    println!("    protocol  {}", report.protocol);
    println!("    actions   {}", report.actions_completed);
    println!("    retries   {}", report.retries);
    println!("    elapsed   {:.2?}", report.elapsed);
}
