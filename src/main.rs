//! sessiond - session lifecycle daemon.
//!
//! Runs the orchestrator over the in-process collaborator implementations:
//! accounts seeded from the command line, in-memory storage keys, and a
//! recording broadcast channel. Lifecycle events are mirrored to the log
//! until the daemon is stopped with Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sessiond::config::SessiondConfig;
use sessiond::orchestrator::{Orchestrator, StartMode};
use sessiond::services::{AccountInfo, LocalServices};
use sessiond::state::SessionId;
use sessiond::switch::{SwitchAck, SwitchObserver};

/// sessiond - session lifecycle daemon
///
/// Orchestrates concurrent sessions: background starts, storage unlock,
/// two-phase stops, and single-flight foreground switches.
#[derive(Parser, Debug)]
#[command(name = "sessiond", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "SESSIOND_CONFIG")]
    config: Option<PathBuf>,

    /// Seed a full session account (repeatable)
    #[arg(long = "account", value_name = "ID")]
    accounts: Vec<u32>,

    /// Seed a profile account as CHILD:PARENT (repeatable)
    #[arg(long = "profile", value_name = "CHILD:PARENT")]
    profiles: Vec<String>,

    /// Start these sessions in the background at boot (repeatable)
    #[arg(long = "start", value_name = "ID")]
    start: Vec<u32>,

    /// Switch foreground to this session once the daemon is up
    #[arg(long, value_name = "ID")]
    switch_to: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => SessiondConfig::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            SessiondConfig::default()
        }),
        None => SessiondConfig::default(),
    };

    let services = LocalServices::new();
    services
        .accounts
        .insert(SessionId::SYSTEM, AccountInfo::full_session());
    for id in &cli.accounts {
        services
            .accounts
            .insert(SessionId(*id), AccountInfo::full_session());
    }
    for spec in &cli.profiles {
        let (child, parent) = parse_profile(spec)?;
        services
            .accounts
            .insert(child, AccountInfo::profile_of(parent));
    }

    tracing::info!("sessiond starting");
    let orchestrator = Orchestrator::with_local_services(config, &services);
    orchestrator.register_switch_observer("log", Arc::new(LoggingObserver));

    // Mirror registry transitions to the log.
    let mut events = orchestrator.subscribe_events();
    let shutdown = CancellationToken::new();
    let event_shutdown = shutdown.clone();
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = event_shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => tracing::info!(?event, "registry event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    for id in &cli.start {
        orchestrator.start(SessionId(*id), StartMode::Background, None);
    }
    if let Some(target) = cli.switch_to {
        if let Err(err) = orchestrator.switch_to(SessionId(target)) {
            tracing::error!(session = target, %err, "initial switch failed");
        }
    }

    tracing::info!(
        current = %orchestrator.current_session_id(),
        "sessiond ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");
    shutdown.cancel();
    let _ = event_task.await;

    tracing::info!("sessiond exiting");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sessiond=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_profile(spec: &str) -> anyhow::Result<(SessionId, SessionId)> {
    let (child, parent) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected CHILD:PARENT, got '{spec}'"))?;
    Ok((SessionId(child.parse()?), SessionId(parent.parse()?)))
}

/// Switch observer that just logs and acknowledges.
struct LoggingObserver;

impl SwitchObserver for LoggingObserver {
    fn on_switching(&self, from: SessionId, to: SessionId, ack: SwitchAck) {
        tracing::info!(%from, %to, "foreground moving");
        ack.ack();
    }

    fn on_switch_complete(&self, to: SessionId) {
        tracing::info!(%to, "foreground settled");
    }
}
