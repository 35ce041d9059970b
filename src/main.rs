//! CLI entry point for servo_line
//!
//! Assembles a line from its configuration file, issues one operation, waits until every
//! actuator is idle and prints the resulting status.
//!
//! # Usage
//!
//! ```bash
//! servo_line --config line.toml status
//! servo_line --config line.toml open "ion pump"
//! servo_line --config line.toml --simulate move inlet 120
//! servo_line --config line.toml request v_ip close
//! ```
//!
//! Ctrl+C while waiting aborts every controller.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use servo_line::config::LineConfig;
use servo_line::logging::{self, LoggingConfig, OutputFormat};
use servo_line::registry::LineRegistry;
use servo_line::sim::SimulatedBoard;
use servo_line::transport::Link;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "servo_line")]
#[command(about = "Servo-driven valve control for a processing line", long_about = None)]
struct Cli {
    /// Line configuration file
    #[arg(long, default_value = "line.toml")]
    config: PathBuf,

    /// Run against simulated boards instead of serial ports
    #[arg(long)]
    simulate: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a valve
    Open { valve: String },
    /// Close a valve
    Close { valve: String },
    /// Move a metering valve to an absolute step position
    Move { valve: String, position: i32 },
    /// Send a named action to an actuator (channel select only when omitted)
    Request {
        actuator: String,
        action: Option<String>,
    },
    /// Print the status of every valve and actuator
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LineConfig::load_validated(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let logging = LoggingConfig::from_line_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(cli.log_format);
    logging::init(logging).map_err(|e| anyhow!(e))?;

    let links = open_links(&config, cli.simulate).await?;
    let line = LineRegistry::assemble(&config, links)?;

    run(&line, cli.command).await?;

    tokio::select! {
        _ = line.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; aborting all controllers");
            line.abort_all();
            line.wait_idle().await;
        }
    }

    print_status(&line);
    line.shutdown().await;
    Ok(())
}

async fn open_links(config: &LineConfig, simulate: bool) -> Result<HashMap<String, Link>> {
    let mut links = HashMap::new();
    for controller in &config.controllers {
        let link = if simulate {
            tracing::info!(controller = %controller.name, "Using simulated servo board");
            SimulatedBoard::new().link()
        } else {
            open_serial_link(&controller.name, &controller.port, controller.baud_rate).await?
        };
        links.insert(controller.name.clone(), link);
    }
    Ok(links)
}

#[cfg(feature = "instrument_serial")]
async fn open_serial_link(name: &str, port: &str, baud_rate: u32) -> Result<Link> {
    use servo_line::transport::{open_serial_async, LineTransport};

    let stream = open_serial_async(port, baud_rate, name).await?;
    tracing::info!(controller = %name, %port, baud_rate, "Opened servo board");
    Ok(LineTransport::link(Box::new(stream)))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial_link(name: &str, _port: &str, _baud_rate: u32) -> Result<Link> {
    Err(anyhow!(
        "controller '{}' needs serial support; rebuild with --features instrument_serial or use --simulate",
        name
    ))
}

async fn run(line: &LineRegistry, command: Commands) -> Result<()> {
    let valve = |name: &str| {
        line.valve_id(name)
            .and_then(|id| line.valve(id))
            .ok_or_else(|| anyhow!("unknown valve '{}'", name))
    };

    match command {
        Commands::Open { valve: name } => valve(&name)?.open()?,
        Commands::Close { valve: name } => valve(&name)?.close()?,
        Commands::Move {
            valve: name,
            position,
        } => {
            let requested = valve(&name)?.move_to(position)?;
            tracing::info!(valve = %name, position, requested, "Metering move requested");
        }
        Commands::Request { actuator, action } => {
            let actuator = line
                .actuator_id(&actuator)
                .and_then(|id| line.actuator(id))
                .ok_or_else(|| anyhow!("unknown actuator '{}'", actuator))?;
            match action {
                Some(action) => actuator.request_named(&action)?,
                None => actuator.request(None)?,
            }
        }
        Commands::Status => {}
    }
    Ok(())
}

fn print_status(line: &LineRegistry) {
    for valve in line.valves() {
        match valve.position() {
            Some(position) => println!("{:<20} {:<8} position {}", valve.name(), valve.status(), position),
            None => println!("{:<20} {}", valve.name(), valve.status()),
        }
    }
    for actuator in line.actuators() {
        let telemetry = actuator.telemetry();
        println!(
            "{:<20} ch{:02} {:<24} succeeded={} reports={}",
            actuator.name(),
            actuator.channel(),
            actuator
                .requested_action()
                .map(|a| a.name)
                .unwrap_or_else(|| "-".to_string()),
            actuator.action_succeeded(),
            telemetry.report_count
        );
    }
}
