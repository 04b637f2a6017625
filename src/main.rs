//! cmdlink
//!
//! `cmdlink controller` listens for one agent, sends it a batch of commands
//! and prints the results. `cmdlink agent` connects out to a controller and
//! executes whatever it is asked to.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cmdlink::backend::LocalHandlers;
use cmdlink::config::Config;
use cmdlink::dispatch::{serve, Dispatcher};
use cmdlink::protocol::Command;
use cmdlink::session::{load_batch, BatchReport, Outcome, SessionConfig, SessionDriver};
use cmdlink::transport::{FramedTransport, Transport, WebSocketTransport};

#[derive(Parser, Debug)]
#[command(name = "cmdlink")]
#[command(about = "Sequenced remote command execution")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON configuration file (defaults to $CMDLINK_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Connect to a controller and execute its commands
    Agent {
        /// Controller address: ws://host:port or tcp://host:port
        #[arg(long)]
        connect: String,
    },

    /// Wait for an agent and run a batch of commands against it
    Controller {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: String,

        /// Batch file: JSON array of {"n": code, "p": payload}
        #[arg(long)]
        batch: PathBuf,

        /// Use length-prefixed TCP frames instead of WebSocket
        #[arg(long)]
        framed: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.mode {
        Mode::Agent { connect } => run_agent(&config, &connect).await,
        Mode::Controller {
            listen,
            batch,
            framed,
            json,
        } => run_controller(&config, &listen, &batch, framed, json).await,
    }
}

async fn run_agent(config: &Config, connect: &str) -> Result<()> {
    let dispatcher = Dispatcher::new(LocalHandlers::from_config(&config.agent));
    info!(
        root = ?config.agent.root,
        read_only = config.agent.read_only,
        "Starting agent"
    );

    let answered = if let Some(addr) = connect.strip_prefix("tcp://") {
        let mut transport = FramedTransport::connect(addr).await?;
        serve(&mut transport, &dispatcher).await?
    } else if connect.starts_with("ws://") {
        let mut transport = WebSocketTransport::connect(connect).await?;
        serve(&mut transport, &dispatcher).await?
    } else {
        anyhow::bail!("Unsupported controller address '{connect}': expected ws:// or tcp://");
    };

    info!(answered, "Agent finished");
    Ok(())
}

async fn run_controller(
    config: &Config,
    listen: &str,
    batch: &Path,
    framed: bool,
    json: bool,
) -> Result<()> {
    let commands = load_batch(batch)?;
    let session = SessionConfig::from_file(&config.session).with_env_overrides();
    let timeout = session.response_timeout;

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {listen}"))?;
    info!(addr = %listener.local_addr()?, framed, "Waiting for agent");

    let (stream, peer) = listener.accept().await.context("Failed to accept agent")?;
    info!(%peer, "Agent connected");

    let report = if framed {
        drive(FramedTransport::from_tcp(stream), session, &commands).await?
    } else {
        drive(WebSocketTransport::accept(stream).await?, session, &commands).await?
    };

    print_report(&report, json)?;
    anyhow::ensure!(
        !report.timed_out,
        "Timed out after {:?} waiting for responses",
        timeout
    );
    anyhow::ensure!(
        report.is_complete(),
        "Connection closed with {} request(s) unanswered",
        report.abandoned.len() + report.unsent
    );
    Ok(())
}

async fn drive<T: Transport>(
    transport: T,
    config: SessionConfig,
    commands: &[Command],
) -> Result<BatchReport> {
    let mut driver = SessionDriver::new(transport, config);
    let report = driver.run_batch(commands).await?;
    if let Err(e) = driver.close().await {
        warn!(error = %e, "Failed to close connection");
    }
    Ok(report)
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for completed in &report.completed {
        match &completed.outcome {
            Outcome::Success { result } => {
                println!("[{}] {}: {result}", completed.sequence, completed.command);
            }
            Outcome::Failure { code, kind, reason } => println!(
                "[{}] {}: error {code} {kind}: {}",
                completed.sequence,
                completed.command,
                reason.as_deref().unwrap_or("(no reason)")
            ),
        }
    }
    for abandoned in &report.abandoned {
        println!("[{}] {}: no response", abandoned.sequence, abandoned.command);
    }
    println!(
        "{} completed, {} failed, {} abandoned, {} unsent, {} unmatched, {} malformed{}",
        report.completed.len(),
        report.failures(),
        report.abandoned.len(),
        report.unsent,
        report.unmatched,
        report.malformed,
        if report.timed_out { " (timed out)" } else { "" }
    );
    Ok(())
}
