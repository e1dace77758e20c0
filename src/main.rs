//! HapticLink - Rust implementation
//!
//! Drives Skinetic haptic vests from a YAML session file: connects the
//! configured devices, loads patterns and plays effects from an interactive
//! prompt.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use crate::cli::Command;
use hapticlink::config::AppConfig;
use hapticlink::driver::{ConnectionState, OutputType};
use hapticlink::HapticContext;

/// HapticLink - Session manager for Skinetic haptic vests
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Scan for devices with the first configured device and exit
    #[arg(long)]
    list_devices: bool,

    /// Transport used by --list-devices
    #[arg(long, default_value = "autodetect")]
    output: OutputType,

    /// Run without the interactive prompt (stop with Ctrl-C)
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!("Starting HapticLink v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = AppConfig::load(&args.config).await?;
    let base_dir = Path::new(&args.config)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let context = HapticContext::from_config(&config, &base_dir)
        .await
        .context("Failed to build haptic session")?;

    if args.list_devices {
        list_devices(&context, args.output).await?;
        return Ok(());
    }

    run_app(context, args.headless, shutdown_signal()).await?;

    info!("HapticLink shutdown complete");
    Ok(())
}

async fn run_app(
    mut context: HapticContext,
    headless: bool,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    // Connection changes are reported from the main loop, not the driver thread
    let names: Vec<String> = context
        .devices()
        .map(|entry| entry.device.name().to_string())
        .collect();
    for name in &names {
        let device = name.clone();
        context.on_connection_change_main(name, move |state, error, serial| match (state, error) {
            (ConnectionState::Connected, _) => info!("🔗 {} connected (serial {})", device, serial),
            (state, Some(e)) => warn!("⚠️ {} {}: {}", device, state, e),
            (state, None) => info!("🔌 {} {}", device, state),
        })?;
    }

    let connected = context.connect_all().await;
    info!("✅ {}/{} device(s) connected", connected, names.len());

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
    if headless {
        drop(command_tx);
    } else {
        println!("{}", "Type 'help' for the list of commands".dimmed());
        cli::spawn_repl(command_tx);
    }

    let mut ticker = interval(context.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ran = context.tick();
                if ran > 0 {
                    debug!("Ran {} dispatched job(s)", ran);
                }
            }

            Some(command) = command_rx.recv() => {
                if command == Command::Quit {
                    info!("Quit requested, stopping event loop");
                    break;
                }
                handle_command(&mut context, command).await;
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    info!("Shutting down...");
    context.shutdown().await;
    // Flush connection notifications queued during shutdown
    context.tick();
    Ok(())
}

async fn handle_command(context: &mut HapticContext, command: Command) {
    match command {
        Command::Play(name) => match context.effect_mut(&name) {
            Some(effect) => match effect.play() {
                Ok(id) => println!("{} {} ({})", "▶".green(), name.bright_white(), id),
                Err(e) => println!("{} {}: {}", "✗".red(), name, e),
            },
            None => println!("{} unknown effect '{}'", "✗".red(), name),
        },
        Command::Stop { effect: name, fadeout } => match context.effect_mut(&name) {
            Some(effect) => match effect.stop(fadeout) {
                Ok(()) => println!("{} {}", "■".yellow(), name.bright_white()),
                Err(e) => println!("{} {}: {}", "✗".red(), name, e),
            },
            None => println!("{} unknown effect '{}'", "✗".red(), name),
        },
        Command::State(name) => match context.effect_mut(&name) {
            Some(effect) => {
                let state = effect.state();
                println!(
                    "  {}: {} ({} instance(s))",
                    name.bright_white(),
                    state.to_string().cyan(),
                    effect.instances().len()
                );
            }
            None => println!("{} unknown effect '{}'", "✗".red(), name),
        },
        Command::Boost { device, value } => match context.device(&device) {
            Some(handle) => {
                let result = match value {
                    Some(boost) => handle.set_global_boost(boost).and_then(|_| handle.global_boost()),
                    None => handle.global_boost(),
                };
                match result {
                    Ok(boost) => println!("  {} boost: {}", device.bright_white(), boost.to_string().green()),
                    Err(e) => println!("{} {}: {}", "✗".red(), device, e),
                }
            }
            None => println!("{} unknown device '{}'", "✗".red(), device),
        },
        Command::Status => print_status(context),
        Command::Scan(output) => {
            if let Err(e) = list_devices(context, output).await {
                println!("{} {}", "✗".red(), e);
            }
        }
        Command::Pause => for_each_device(context, "pause", |d| d.pause_all()),
        Command::Resume => for_each_device(context, "resume", |d| d.resume_all()),
        Command::StopAll => for_each_device(context, "stop", |d| d.stop_all()),
        Command::Patterns => {
            for entry in context.devices() {
                let device = &entry.device;
                println!("\n{}", device.name().bold());
                for pattern in device.loaded_patterns() {
                    let boost = device.pattern_boost(&pattern.name);
                    match device.accumulation_rule(&pattern.name) {
                        Some(rule) => println!(
                            "  {} (boost {}) → {} within {:.2}s",
                            pattern.name.yellow(),
                            boost,
                            rule.fallback.cyan(),
                            rule.time_window
                        ),
                        None => println!("  {} (boost {})", pattern.name.yellow(), boost),
                    }
                }
            }
        }
        Command::Help => println!("{}", cli::HELP),
        Command::Quit => {}
    }
}

fn for_each_device<F>(context: &HapticContext, what: &str, op: F)
where
    F: Fn(&hapticlink::SkineticDevice) -> Result<(), hapticlink::HapticError>,
{
    for entry in context.devices() {
        match op(&entry.device) {
            Ok(()) => println!("  {} {}", entry.device.name().bright_white(), what.green()),
            Err(e) => println!("{} {} {}: {}", "✗".red(), entry.device.name(), what, e),
        }
    }
}

fn print_status(context: &HapticContext) {
    println!("\n{}", "=== Devices ===".bold().cyan());
    for entry in context.devices() {
        let device = &entry.device;
        let state = device.connection_status();
        let state_text = match state {
            ConnectionState::Connected => state.to_string().green(),
            ConnectionState::Disconnected => state.to_string().red(),
            _ => state.to_string().yellow(),
        };
        println!("  {} [{}] {}", device.name().bright_white(), device.driver().name().dimmed(), state_text);
        if state == ConnectionState::Connected {
            println!(
                "    {} serial {} firmware {}",
                device.device_type(),
                device.serial_number_as_string().cyan(),
                device.device_version().cyan()
            );
        }
        println!("    SDK {}", device.sdk_version().dimmed());
    }

    println!("\n{}", "=== Effects ===".bold().cyan());
    for name in context.effect_names() {
        if let Some(effect) = context.effect(name) {
            println!(
                "  {} {:?} on {} ({} instance(s))",
                name.yellow(),
                effect.strategy(),
                effect
                    .target_device()
                    .map(|d| d.name().to_string())
                    .unwrap_or_else(|| "-".to_string()),
                effect.instances().len()
            );
        }
    }
}

async fn list_devices(context: &HapticContext, output: OutputType) -> Result<()> {
    let entry = context
        .devices()
        .next()
        .context("No device configured to scan with")?;
    let device = &entry.device;

    println!("\n{}", format!("=== Scanning ({}) ===", output).bold().cyan());
    let found = device.scan(output).await?;

    if found.is_empty() {
        println!("  {}", "No device found".yellow());
        return Ok(());
    }

    for info in &found {
        println!(
            "  {} {} via {} firmware {}",
            info.device_type.to_string().bright_white(),
            device.serial_number_to_string(info.serial_number).green(),
            info.output_type.to_string().cyan(),
            info.device_version
        );
    }
    println!("\n{}", format!("✅ {} device(s) found", found.len()).green().bold());
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .init();
    }

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
