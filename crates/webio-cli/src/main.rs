//! `webio` – WebSocket IO gateway daemon
//!
//! This binary wires the pieces together:
//!
//! 1. Loads `configuration/settings.toml`, restoring it from the factory copy
//!    (or defaults) when missing.
//! 2. Brings up every configured IO through the sysfs drivers, or through
//!    simulated outputs with `--simulate`.
//! 3. Starts the gateway service thread and the UI command handlers.
//! 4. Runs the foreground loop until **Ctrl-C**, then shuts the gateway down
//!    and stops every output.

mod config;
mod ui;

use clap::Parser;
use colored::Colorize;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use webio_gateway::Gateway;
use webio_gateway::service::DEFAULT_SHUTDOWN_TIMEOUT;
use webio_hal::{DEFAULT_SYSFS_ROOT, IoManager, Output, SimOutput};
use webio_types::WebIoError;

use crate::config::Settings;
use crate::ui::{PWM_PIN_NAME, UiServer};

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "webio", version, about = "WebSocket gateway for PWM/GPIO control")]
struct Args {
    /// Settings file.
    #[arg(long, env = "WEBIO_CONFIG", default_value = "configuration/settings.toml")]
    config: PathBuf,

    /// Factory settings copied over when the settings file is missing.
    #[arg(long, env = "WEBIO_FACTORY_CONFIG")]
    factory: Option<PathBuf>,

    /// Root of the kernel's sysfs class tree.
    #[arg(long, default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Drive simulated outputs instead of hardware.
    #[arg(long)]
    simulate: bool,

    /// Period of the status push, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    service_interval_ms: u64,
}

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter (default "info"); WEBIO_LOG_FORMAT=json
    // switches to newline-delimited JSON.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("WEBIO_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let args = Args::parse();
    print_banner();

    // ── Shutdown flag ─────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match run(&args, &shutdown) {
        Ok(()) => {
            println!("{}", "  ✓ Exiting webio.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "webio failed");
            println!("{}: {}", "Fatal".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, shutdown: &AtomicBool) -> Result<(), WebIoError> {
    let settings = Settings::load(&args.config, args.factory.as_deref())?;
    println!(
        "  Settings loaded from {}",
        args.config.display().to_string().bold()
    );
    match settings.find_io_key_by_pin_name(PWM_PIN_NAME) {
        Some(key) => info!(io = key, pin = PWM_PIN_NAME, "pwm-control target"),
        None => warn!(pin = PWM_PIN_NAME, "no IO configured for pwm-control"),
    }

    let io = Arc::new(Mutex::new(build_io(&settings, args)));

    let mut ui = UiServer::new(Gateway::new(), Arc::clone(&io));
    ui.start(&settings.server)?;
    if let Some(addr) = ui.gateway().local_addr() {
        println!(
            "  Serving {} on {}",
            settings.server.app_name.bold(),
            format!("ws://{addr}").cyan()
        );
    }

    // ── Foreground loop ───────────────────────────────────────────────────
    let interval = Duration::from_millis(args.service_interval_ms.max(1));
    let mut next_service = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        if Instant::now() >= next_service {
            ui.service();
            next_service += interval;
        }
        if !ui.gateway().is_running() {
            warn!("gateway service thread exited; stopping");
            break;
        }
        thread::sleep(TICK);
    }

    // ── Teardown ──────────────────────────────────────────────────────────
    if let Err(e) = ui.shutdown(DEFAULT_SHUTDOWN_TIMEOUT) {
        error!(error = %e, "gateway did not shut down cleanly");
    }
    io.lock().stop_all()
}

fn build_io(settings: &Settings, args: &Args) -> IoManager {
    let configs = settings.to_io_configs();
    let mut io = IoManager::with_sysfs_root(&args.sysfs_root);
    let count = if args.simulate {
        io.initialize_with(&configs, |name, config| {
            let output: Box<dyn Output> = SimOutput::new(name, config.clone());
            Ok(output)
        })
    } else {
        io.initialize(&configs)
    };
    if count < configs.len() {
        warn!(ready = count, configured = configs.len(), "some IO failed to initialize");
    }
    println!("  {} of {} IO ready", count, configs.len());
    io
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                 __    _     "#.bold().cyan());
    println!("{}", r#"  _      _____  / /_  (_)___ "#.bold().cyan());
    println!("{}", r#" | | /| / / _ \/ __ \/ / __ \"#.bold().cyan());
    println!("{}", r#" | |/ |/ /  __/ /_/ / / /_/ /"#.bold().cyan());
    println!("{}", r#" |__/|__/\___/_.___/_/\____/ "#.bold().cyan());
    println!();
    println!("  {}", "PWM/GPIO over WebSocket".dimmed());
    println!();
}
