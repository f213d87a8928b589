//! ClassLink participant entry point.
//!
//! Loads the configuration, connects to a presenter (a fixed address, or the
//! first one heard through discovery), listens on the fan-out channel, and
//! runs until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use classlink_core::transport::FanoutReceiver;
use classlink_core::{Message, ParticipantId};
use classlink_participant::application::client_events::ClientHandler;
use classlink_participant::application::presenter_directory::PresenterEntry;
use classlink_participant::infrastructure::network::SessionClient;
use classlink_participant::infrastructure::storage::config::{
    config_file_path, load_config, save_config,
};

#[derive(Debug, Parser)]
#[command(name = "classlink-participant", version, about = "ClassLink participant client")]
struct Args {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, env = "CLASSLINK_PARTICIPANT_CONFIG")]
    config: Option<PathBuf>,

    /// Display name sent to the presenter.
    #[arg(long)]
    name: Option<String>,

    /// Connect to this presenter instead of discovering one.
    #[arg(long)]
    presenter: Option<SocketAddr>,

    /// Only join a presenter announcing this channel.
    #[arg(long)]
    channel: Option<u32>,
}

/// Logs client events and forwards discovered presenters to `main`.
struct LogEvents {
    found: mpsc::UnboundedSender<PresenterEntry>,
}

#[async_trait]
impl ClientHandler for LogEvents {
    async fn on_connected(&self, participant: ParticipantId, presenter: SocketAddr) {
        info!("joined {presenter} as {participant}");
    }

    async fn on_disconnected(&self) {
        info!("left the session");
    }

    async fn on_message(&self, message: Message) {
        info!("presenter: {} ({} fields)", message.msg_type, message.data.len());
    }

    async fn on_presenter_found(&self, presenter: PresenterEntry) {
        let _ = self.found.send(presenter);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => config_file_path()?,
    };

    let mut file_config = load_config(Some(&config_path)).context("loading configuration")?;

    // Level comes from `RUST_LOG`, else from the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&file_config.participant.log_level)),
        )
        .init();

    let (machine_id, generated) = file_config.ensure_machine_id();
    if generated {
        match save_config(&file_config, &config_path) {
            Ok(()) => info!("new machine id {machine_id} saved to {}", config_path.display()),
            Err(e) => warn!("could not persist machine id: {e}"),
        }
    }
    if let Some(name) = args.name {
        file_config.participant.name = name;
    }
    if let Some(presenter) = args.presenter {
        file_config.network.presenter = Some(presenter);
    }

    info!("ClassLink participant starting");

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let client = SessionClient::new(
        file_config.client_config(),
        Arc::new(LogEvents { found: found_tx }),
    );

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    // ── Fan-out channel ───────────────────────────────────────────────────────
    let mut fanout = None;
    if file_config.fanout.enabled {
        match FanoutReceiver::start_sequenced(&file_config.fanout_config()) {
            Ok((receiver, mut payloads)) => {
                info!("listening for fan-out data on {}", receiver.local_addr());
                tokio::spawn(async move {
                    while let Some(payload) = payloads.recv().await {
                        debug!("fan-out payload: {} bytes", payload.len());
                    }
                });
                fanout = Some(receiver);
            }
            Err(e) => warn!("fan-out channel unavailable: {e}"),
        }
    }

    // ── Session ───────────────────────────────────────────────────────────────
    match file_config.network.presenter {
        Some(addr) => {
            client.connect(addr).await.context("joining presenter")?;
        }
        None => {
            client.start_discovery().context("starting discovery")?;
            info!("looking for presenters.  Press Ctrl-C to exit.");
        }
    }

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        while let Ok(presenter) = found_rx.try_recv() {
            info!(
                "presenter \"{}\" on channel {} at {}",
                presenter.name, presenter.channel, presenter.address
            );
            if client.is_connected() || args.channel.is_some_and(|c| c != presenter.channel) {
                continue;
            }
            if let Err(e) = client.connect_to(&presenter).await {
                warn!("could not join \"{}\": {e}", presenter.name);
            }
        }
    }

    let stats = client.stats();
    client.stop().await;
    info!(
        "{} messages in, {} messages out, {} bytes in, {} bytes out",
        stats.messages_received, stats.messages_sent, stats.bytes_received, stats.bytes_sent
    );
    if let Some(mut receiver) = fanout {
        receiver.stop();
        let fs = receiver.stats();
        info!(
            "fan-out: {} datagrams, {} bytes, {} dropped, {} out of order",
            fs.datagrams, fs.bytes, fs.dropped, fs.discarded
        );
    }

    info!("ClassLink participant stopped");
    Ok(())
}
