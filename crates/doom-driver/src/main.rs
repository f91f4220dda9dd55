use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::channel::{ExchangeKey, PollPolicy};
use coordination::strategy::ControlScope;
use coordination::ActionTable;
use doom_driver::config::{ChannelBackend, SurfaceKind};
use doom_driver::controller::{ControllerSettings, TurnController};
use doom_driver::{wiring, DriverConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (fields default to DOOM_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play one session
    Run(RunArgs),

    /// Read or answer exchange records by hand
    Channel {
        #[command(subcommand)]
        op: ChannelOp,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// manual, scripted or model-driven (aliases: human, random, ai)
    #[arg(long)]
    mode: Option<String>,

    /// Level to warp to
    #[arg(long)]
    level: Option<String>,

    /// Stop after this many turns
    #[arg(long)]
    max_turns: Option<u64>,

    /// Read control signals on every turn instead of only manual ones
    #[arg(long)]
    control_scope: Option<ControlScope>,

    /// Exchange records live in this directory instead of agent metadata
    #[arg(long)]
    channel_dir: Option<PathBuf>,

    /// buildkite or local
    #[arg(long)]
    surface: Option<SurfaceKind>,

    /// Where clips and the local page are written
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seed for scripted play
    #[arg(long)]
    seed: Option<u64>,

    /// Key prefix isolating this run in a shared store
    #[arg(long)]
    namespace: Option<String>,
}

impl RunArgs {
    fn apply(self, config: &mut DriverConfig) {
        if self.mode.is_some() {
            config.mode = self.mode;
        }
        if self.level.is_some() {
            config.level = self.level;
        }
        if let Some(max_turns) = self.max_turns {
            config.max_turns = max_turns;
        }
        if let Some(scope) = self.control_scope {
            config.control_scope = scope;
        }
        if let Some(path) = self.channel_dir {
            config.channel = ChannelBackend::Dir { path };
        }
        if let Some(surface) = self.surface {
            config.surface = surface;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.namespace.is_some() {
            config.namespace = self.namespace;
        }
    }
}

#[derive(Subcommand, Debug)]
enum ChannelOp {
    /// Write a value, e.g. `channel put action_3 Left`
    Put { key: String, value: String },
    /// Print a value without consuming it
    Get { key: String },
    /// Wait for a value, print it and claim it
    Consume {
        key: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(cli.config, args).await,
        Command::Channel { op } => channel(cli.config, op).await,
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<DriverConfig> {
    let config = DriverConfig::load(path.as_deref())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;
    Ok(config)
}

async fn run(config_path: Option<PathBuf>, args: RunArgs) -> Result<u8> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let channel = wiring::build_channel(&config)?;
    let collaborators = wiring::build_collaborators(&config)?;
    info!(
        channel = %channel.describe(),
        surface = ?config.surface,
        max_turns = config.max_turns,
        "Driver starting"
    );

    let mut controller = TurnController::new(
        ControllerSettings::from_config(&config),
        Arc::new(ActionTable::standard()),
        channel,
        collaborators,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("Termination signal received, shutting down");
            cancel.cancel();
        }
    });

    let configured_mode = config.mode()?;
    let (mode, level) = tokio::select! {
        bootstrapped = controller.bootstrap(configured_mode, config.level.clone()) => {
            bootstrapped.context("Failed to determine mode and level")?
        }
        _ = cancel.cancelled() => return Ok(130),
    };

    let report = controller
        .run(mode, &level, cancel)
        .await
        .context("Session aborted")?;
    info!(
        session = %report.session_id,
        outcome = ?report.outcome,
        turns = report.outcome.turns(),
        final_mode = %report.mode,
        "{}",
        report.summary
    );
    Ok(report.outcome.exit_code())
}

async fn channel(config_path: Option<PathBuf>, op: ChannelOp) -> Result<u8> {
    let config = load_config(config_path)?;
    let channel = wiring::build_channel(&config)?;
    let parse = |raw: &str| ExchangeKey::parse(raw).with_context(|| format!("Bad key '{raw}'"));

    match op {
        ChannelOp::Put { key, value } => {
            channel.put(&parse(&key)?, &value).await?;
            info!(key = %key, "Value written");
        }
        ChannelOp::Get { key } => match channel.get(&parse(&key)?).await? {
            Some(value) => println!("{value}"),
            None => {
                warn!(key = %key, "No value");
                return Ok(1);
            }
        },
        ChannelOp::Consume { key, timeout_secs } => {
            let poll = PollPolicy::new(Duration::from_secs(timeout_secs), config.poll_interval());
            let value = channel.consume(&parse(&key)?, poll).await?;
            println!("{value}");
        }
    }
    Ok(0)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
