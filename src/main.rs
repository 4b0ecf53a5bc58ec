//! blechat - headless Bluetooth LE messenger.
//!
//! Reads commands from stdin and prints the active conversation as it
//! changes.

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::HashSet;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use blechat::bluetooth::{BtleplugLink, PeerManager, TransportSessionManager};
use blechat::message::{ChannelModel, DeliveryCoordinator, MemoryMessageStore, Message, MessageStore, SqliteMessageStore};
use blechat::notify::LogNotifier;
use blechat::NodeConfig;

#[derive(Parser)]
#[command(name = "blechat", version, about = "Offline messaging over Bluetooth LE")]
struct Cli {
    /// Path to JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Display name advertised to peers
    #[arg(long)]
    name: Option<String>,
    /// SQLite file for message history
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,
}

/// How long shutdown waits for in-flight sends to settle.
const DELIVERY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(String),
    Close,
    Peers,
    Refresh,
    Status,
    Quit,
    Send(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        Some(match verb {
            "/open" if !arg.is_empty() => Command::Open(arg.to_string()),
            "/close" => Command::Close,
            "/peers" => Command::Peers,
            "/refresh" => Command::Refresh,
            "/status" => Command::Status,
            "/quit" => Command::Quit,
            _ => Command::Send(line.to_string()),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(name) = cli.name {
        config.display_name = name;
    }
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    config.validate()?;

    info!("=== blechat: offline messaging over Bluetooth LE ===");
    info!("Display name: {}", config.display_name);

    let store: Arc<dyn MessageStore> = match &config.database_path {
        Some(path) => Arc::new(
            SqliteMessageStore::with_path(path)
                .with_context(|| format!("Failed to open message database {}", path.display()))?,
        ),
        None => Arc::new(MemoryMessageStore::new()),
    };

    let model = Arc::new(ChannelModel::new(store, Arc::new(LogNotifier)));
    let registry = Arc::new(PeerManager::new());
    let link = Arc::new(BtleplugLink::new(config.scan_restart_interval()));
    let transport = Arc::new(TransportSessionManager::new(
        link,
        registry.clone(),
        &config.display_name,
        config.session_settings(),
    ));
    let coordinator = DeliveryCoordinator::new(transport, registry, model);

    coordinator.start().await?;
    let printer = tokio::spawn(print_conversation(coordinator.current_channel_messages()));

    println!("Commands: /open <name|BROADCAST>, /close, /peers, /refresh, /status, /quit");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut pending = PendingDeliveries::default();

    let mut lines = spawn_stdin_reader();
    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        match command {
            Command::Open(channel) => {
                coordinator.open_channel(&channel);
                println!("-- {} --", channel);
            }
            Command::Close => coordinator.close_channel(),
            Command::Peers => {
                for peer in coordinator.peers().borrow().iter() {
                    let state = if peer.is_active() {
                        format!("{} dBm", peer.signal_strength)
                    } else {
                        "offline".to_string()
                    };
                    println!("  {} [{}] {}", peer.display_name, peer.address, state);
                }
            }
            Command::Refresh => {
                if let Err(e) = coordinator.refresh_peers().await {
                    error!("Refresh failed: {:#}", e);
                }
            }
            Command::Status => println!("{:#}", coordinator.status()),
            Command::Quit => break,
            Command::Send(text) => match coordinator.send(&text) {
                Some(handle) => pending.track(tokio::spawn(async move {
                    if let Ok(report) = handle.await {
                        if report.channel.is_broadcast() {
                            println!("  (delivered to {} of {})", report.delivered, report.attempts);
                        }
                    }
                })),
                None => println!("Open a channel first: /open <name|BROADCAST>"),
            },
        }
    }

    coordinator.stop().await;
    if !pending.wait(DELIVERY_DRAIN_TIMEOUT).await {
        warn!("Some deliveries were still running at exit");
    }
    printer.abort();
    Ok(())
}

/// Reads stdin on its own thread. A blocked read on the runtime's blocking
/// pool would hold up exit after a signal.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Reporter tasks of sends that may still be in flight.
#[derive(Default)]
struct PendingDeliveries {
    tasks: Vec<JoinHandle<()>>,
}

impl PendingDeliveries {
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    /// Returns false if some task outlived `limit`.
    async fn wait(self, limit: Duration) -> bool {
        time::timeout(limit, join_all(self.tasks)).await.is_ok()
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c() => {}
                _ = sigterm.recv() => {}
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn print_conversation(mut view: watch::Receiver<Vec<Message>>) {
    let mut printed: HashSet<Uuid> = HashSet::new();
    loop {
        let fresh: Vec<Message> = view
            .borrow_and_update()
            .iter()
            .filter(|m| !printed.contains(&m.id))
            .cloned()
            .collect();

        for message in fresh {
            printed.insert(message.id);
            println!(
                "[{}] {}: {}",
                message.formatted_timestamp(),
                message.sender_name,
                message.content
            );
        }

        if view.changed().await.is_err() {
            break;
        }
    }
}
