//! ClassLink presenter entry point.
//!
//! Loads the configuration, starts the session server and the fan-out
//! channel, and runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML file, then command-line overrides
//!  └─ start services
//!       ├─ SessionServer     (accept loop, heartbeat sweep, presence)
//!       └─ FanoutSender      (multicast media channel for collaborators)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use classlink_core::transport::FanoutSender;
use classlink_core::{Message, ParticipantId};
use classlink_presenter::application::manage_participants::ParticipantRecord;
use classlink_presenter::application::session_events::SessionHandler;
use classlink_presenter::infrastructure::network::SessionServer;
use classlink_presenter::infrastructure::storage::config::{
    config_file_path, load_config, save_config,
};

/// How often the participant roster is written to the log.
const ROSTER_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "classlink-presenter", version, about = "ClassLink presenter session server")]
struct Args {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, env = "CLASSLINK_PRESENTER_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port participants connect to.
    #[arg(long)]
    port: Option<u16>,

    /// Presenter name shown to participants.
    #[arg(long)]
    name: Option<String>,

    /// Classroom channel number.
    #[arg(long)]
    channel: Option<u32>,

    /// Write the effective configuration to the config file and exit.
    #[arg(long)]
    init_config: bool,
}

/// Logs session events; stands in for the UI until one is attached.
struct LogEvents;

#[async_trait]
impl SessionHandler for LogEvents {
    async fn on_connected(&self, participant: ParticipantRecord) {
        info!(
            "+ {} \"{}\" from {}",
            participant.id, participant.name, participant.address
        );
    }

    async fn on_disconnected(&self, participant: ParticipantId) {
        info!("- {participant}");
    }

    async fn on_message(&self, participant: ParticipantId, message: Message) {
        info!("{participant}: {} ({} fields)", message.msg_type, message.data.len());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut file_config = load_config(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        file_config.network.port = port;
    }
    if let Some(name) = args.name {
        file_config.presenter.name = name;
    }
    if let Some(channel) = args.channel {
        file_config.presenter.channel = channel;
    }

    // Level comes from `RUST_LOG`, else from the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&file_config.presenter.log_level)),
        )
        .init();

    if args.init_config {
        let path = match args.config {
            Some(path) => path,
            None => config_file_path()?,
        };
        save_config(&file_config, &path).context("writing configuration")?;
        info!("configuration written to {}", path.display());
        return Ok(());
    }

    info!("ClassLink presenter starting");

    let server = SessionServer::start(file_config.server_config(), Arc::new(LogEvents))
        .await
        .context("starting session server")?;

    // ── Fan-out channel ───────────────────────────────────────────────────────
    let fanout = match FanoutSender::new(&file_config.fanout_config()) {
        Ok(sender) => {
            info!("fan-out channel ready on {}", sender.target());
            Some(sender)
        }
        Err(e) => {
            warn!("fan-out channel unavailable: {e}");
            None
        }
    };

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!(
        "presenter \"{}\" ready on {}.  Press Ctrl-C to exit.",
        file_config.presenter.name,
        server.local_addr()
    );

    let mut last_roster = Instant::now();
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        if last_roster.elapsed() >= ROSTER_LOG_INTERVAL {
            last_roster = Instant::now();
            let participants = server.participants();
            info!("{} participant(s) connected", participants.len());
            for p in participants {
                info!(
                    "  {} \"{}\" {} {:?}",
                    p.record.id, p.record.name, p.record.status, p.liveness
                );
            }
        }
    }

    server.stop().await;
    let stats = server.stats();
    info!(
        "session ended: {} connections, {} messages in, {} messages out, up {:?}",
        stats.total_connections, stats.messages_received, stats.messages_sent, stats.uptime
    );
    if let Some(sender) = fanout {
        let fs = sender.stats();
        info!("fan-out: {} datagrams, {} bytes, {} errors", fs.datagrams, fs.bytes, fs.errors);
    }

    info!("ClassLink presenter stopped");
    Ok(())
}
