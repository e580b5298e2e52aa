//! SNAPPY diagnostic CLI.
//!
//! Thin wrapper over the client facade for checking daemon
//! connectivity, driving collection, and watching live device events
//! from a terminal.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use snappy_client::{LinkConfig, SnappyLink};
use snappy_proto::CommandResult;

/// SNAPPY daemon diagnostic tool
#[derive(Parser)]
#[command(name = "snappy")]
#[command(about = "Discover and talk to the SNAPPY measurement daemon")]
#[command(version)]
#[command(after_help = "\
Examples:
  snappy status           Run the full connection diagnostic
  snappy status --json    Same, as machine-readable JSON
  snappy version          Print the daemon's version string
  snappy start            Start measurement collection
  snappy stop             Stop measurement collection
  snappy watch            Stream device events until interrupted

The daemon listens on one loopback port in 8436-8535; every command
scans for it first. Set RUST_LOG=snappy=debug for scan details.
")]
struct Cli {
    /// Emit machine-readable JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the phased connection diagnostic
    Status,

    /// Print the daemon's version string
    Version,

    /// Start measurement collection
    Start,

    /// Stop measurement collection
    Stop,

    /// Print connected device information
    Info,

    /// Stream presence and measurement events until Ctrl-C
    Watch,
}

fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snappy={default_level}")));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let link = SnappyLink::new(LinkConfig::default());

    let outcome = match cli.command {
        Commands::Status => run_status(&link, cli.json).await,
        Commands::Watch => run_watch(&link).await,
        command => run_command(&link, cli.json, &command).await,
    };

    link.dispose().await;
    outcome
}

/// Run the phased diagnostic and render the report.
async fn run_status(link: &SnappyLink, json: bool) -> Result<()> {
    let report = link.test_connection().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let phase = |name: &str, p: &snappy_client::PhaseReport| {
            let mark = if p.success { "ok" } else { "FAILED" };
            println!("  {name:<10} {mark:<8} {} ms", p.elapsed_ms);
        };
        match report.port {
            Some(port) => println!("daemon found on port {port}"),
            None => println!("no daemon found"),
        }
        if let Some(version) = &report.version_string {
            println!("daemon version: {version}");
        }
        phase("locate", &report.locate);
        phase("connect", &report.connect);
        phase("version", &report.version);
    }

    if report.healthy() {
        Ok(())
    } else {
        bail!("connection diagnostic failed");
    }
}

/// Connect, run one facade operation, and render its result.
async fn run_command(link: &SnappyLink, json: bool, command: &Commands) -> Result<()> {
    connect(link).await?;
    let result = match command {
        Commands::Version => link.daemon_version().await,
        Commands::Start => link.start_collection().await,
        Commands::Stop => link.stop_collection().await,
        Commands::Info => link.device_info().await,
        Commands::Status | Commands::Watch => unreachable!("dispatched in main"),
    };
    render(result, json)
}

/// Connect and stream push events to stdout until interrupted.
async fn run_watch(link: &SnappyLink) -> Result<()> {
    connect(link).await?;

    let mut presence = link.presence();
    let mut data = link.data();
    let mut status = link.status();

    eprintln!("watching; Ctrl-C to stop");
    loop {
        tokio::select! {
            event = presence.recv() => match event {
                Ok(true) => println!("device connected"),
                Ok(false) => println!("device disconnected"),
                Err(_) => break,
            },
            sample = data.recv() => match sample {
                Ok(sample) => println!(
                    "{} {} value={}",
                    sample.timestamp.format("%H:%M:%S%.3f"),
                    sample.device_id,
                    sample.value,
                ),
                Err(_) => break,
            },
            service = status.recv() => match service {
                Ok(service) => {
                    debug!("service status: {service:?}");
                    if !service.is_connected() {
                        eprintln!("connection lost, recovery pending");
                    }
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

async fn connect(link: &SnappyLink) -> Result<()> {
    let result = link.connect().await;
    if !result.success {
        bail!("{}: {}", result.error.as_deref().unwrap_or("error"), result.message);
    }
    debug!("connected to daemon v{}", result.message);
    Ok(())
}

fn render(result: CommandResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.success {
        println!("{}", result.message);
    }

    if result.success {
        Ok(())
    } else {
        bail!("{}: {}", result.error.as_deref().unwrap_or("error"), result.message);
    }
}
