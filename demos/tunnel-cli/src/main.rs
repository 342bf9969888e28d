//! Command line for support tunnel sessions.
//!
//! `support-tunnel local` runs both endpoints in one process, against an
//! in-memory device unless `--device` names a serial port. `requester` and
//! `operator` run them apart: they meet through a relay hub (`--hub`) and a
//! shared session store (`--store sqlite://sessions.db`).
//!
//! With `--rfc2217` the operator also serves the remote device to local
//! tools, e.g. `pio device monitor --port rfc2217://localhost:4000`.

mod console;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use support_tunnel_agent::{AdminAgent, PortBridge, UserAgent, port_bridge::DEFAULT_PORT};
use support_tunnel_core::{
    RelayBus, SessionId, SessionStore, TunnelConfig,
    session::{CloseReason, DeviceHint},
    traits::SessionFilter,
};
use support_tunnel_flash::{FlashOrchestrator, Flasher, HttpFirmwareSource, MemoryFlasher, RomFlasher};
use support_tunnel_serial::{DeviceFile, LinkOpener, LoopbackDevice, SerialPortDevice};
use support_tunnel_session::{
    SessionManager,
    storage::{MemoryStorage, SqliteStorage},
};
use support_tunnel_transport::{LocalRelay, WsRelay};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::console::{ConsoleCommand, render};

#[derive(Parser)]
#[command(name = "support-tunnel", about = "Remote device support sessions")]
struct Cli {
    /// Relay hub URL, e.g. ws://127.0.0.1:8080/relay
    #[arg(long, env = "SUPPORT_TUNNEL_HUB", global = true)]
    hub: Option<String>,

    /// Session store: `memory` or `sqlite://<path>`
    #[arg(long, env = "SUPPORT_TUNNEL_STORE", default_value = "memory", global = true)]
    store: String,

    /// JSON file overriding tunnel settings
    #[arg(long, env = "SUPPORT_TUNNEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DeviceArgs {
    /// Serial port of the board, e.g. /dev/ttyUSB0 or COM3
    #[arg(long, conflicts_with = "device_file")]
    device: Option<String>,

    /// Character device without line control; baud changes are refused
    #[arg(long)]
    device_file: Option<PathBuf>,

    /// Chip family reported for the device
    #[arg(long, default_value = "ESP32")]
    chip: String,
}

#[derive(Args)]
struct BridgeArgs {
    /// Serve the device to local tools over RFC 2217
    #[arg(long)]
    rfc2217: bool,

    /// Local port for the RFC 2217 server
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

impl BridgeArgs {
    const fn port(&self) -> Option<u16> {
        if self.rfc2217 { Some(self.port) } else { None }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Both endpoints in one process, operator console on stdin
    Local {
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        bridge: BridgeArgs,
    },
    /// Share a device and wait for an operator
    Requester {
        #[command(flatten)]
        device: DeviceArgs,
        /// Requester identity recorded on the session
        #[arg(long, default_value = "requester")]
        id: String,
    },
    /// Join a waiting session, or list joinable ones
    Operator {
        /// Session to join
        #[arg(long, required_unless_present = "list")]
        session: Option<SessionId>,
        /// List sessions that are not closed, then exit
        #[arg(long)]
        list: bool,
        /// Operator identity recorded on the session
        #[arg(long, default_value = "operator")]
        id: String,
        #[command(flatten)]
        bridge: BridgeArgs,
    },
}

async fn open_store(url: &str) -> anyhow::Result<Arc<dyn SessionStore>> {
    if url == "memory" {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    if url.starts_with("sqlite:") {
        let store = SqliteStorage::new(url)
            .await
            .with_context(|| format!("failed to open {url}"))?;
        return Ok(Arc::new(store));
    }
    anyhow::bail!("unsupported store {url}; use memory or sqlite://<path>")
}

/// Separate processes only meet through a hub and a shared store.
fn require_shared(cli: &Cli, mode: &str) -> anyhow::Result<String> {
    if cli.store == "memory" {
        anyhow::bail!("{mode} mode needs a shared --store, e.g. sqlite://sessions.db");
    }
    cli.hub
        .clone()
        .with_context(|| format!("{mode} mode needs --hub"))
}

fn device(args: &DeviceArgs) -> (Arc<dyn LinkOpener>, Arc<dyn Flasher>) {
    match (&args.device, &args.device_file) {
        (Some(path), _) => (
            Arc::new(SerialPortDevice::new(path.clone())),
            Arc::new(RomFlasher::new()),
        ),
        (None, Some(path)) => (Arc::new(DeviceFile::new(path)), Arc::new(RomFlasher::new())),
        (None, None) => {
            let device = LoopbackDevice::new().with_banners();
            device.inject("ESP-ROM:esp32-demo\r\nready\r\n");
            (Arc::new(device), Arc::new(MemoryFlasher::new(args.chip.clone())))
        }
    }
}

async fn start_requester(
    manager: SessionManager,
    bus: Arc<dyn RelayBus>,
    args: &DeviceArgs,
    config: &TunnelConfig,
    requester_id: &str,
) -> anyhow::Result<UserAgent> {
    let (opener, flasher) = device(args);
    let orchestrator = FlashOrchestrator::new(Arc::new(HttpFirmwareSource::new()), flasher)
        .with_chunk_bytes(config.flash_chunk_bytes);
    UserAgent::start(
        manager,
        bus,
        opener,
        orchestrator,
        config.clone(),
        requester_id,
        DeviceHint {
            chip: Some(args.chip.clone()),
            ..DeviceHint::default()
        },
    )
    .await
    .context("failed to start the requester agent")
}

/// Drive the operator endpoint from stdin until the session ends.
async fn operate(mut admin: AdminAgent, rfc2217: Option<u16>) -> anyhow::Result<()> {
    let mut view = admin.terminal().history_plus_stream();
    tokio::spawn(async move {
        while let Some(line) = view.next().await {
            println!("{}", render(&line));
        }
    });

    let (port_tx, mut port_rx) = mpsc::unbounded_channel();
    if let Some(port) = rfc2217 {
        let bridge = PortBridge::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to listen on port {port}"))?;
        println!("Device available at rfc2217://localhost:{port}");
        tokio::spawn(bridge.serve(port_tx.clone(), admin.output_feed()));
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            live = admin.pump() => {
                if !live {
                    break;
                }
            }
            Some(request) = port_rx.recv() => {
                if let Err(e) = admin.apply_port_request(request) {
                    eprintln!("{e}");
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    admin.end(CloseReason::AdminEnded).await?;
                    break;
                };
                let sent = match ConsoleCommand::parse(&line) {
                    ConsoleCommand::Text(text) => admin.send_text(&text),
                    ConsoleCommand::Action(action) => admin.dispatch(action),
                    ConsoleCommand::Baud(rate) => admin.set_baud(rate),
                    ConsoleCommand::Signal { dtr, rts } => admin.send_signal(dtr, rts),
                    ConsoleCommand::End => {
                        admin.end(CloseReason::AdminEnded).await?;
                        break;
                    }
                    ConsoleCommand::Invalid(reason) => {
                        eprintln!("{reason}");
                        Ok(())
                    }
                };
                if let Err(e) = sent {
                    eprintln!("{e}");
                }
            }
        }
    }
    Ok(())
}

async fn run_local(
    cli: &Cli,
    config: &TunnelConfig,
    args: &DeviceArgs,
    bridge: &BridgeArgs,
) -> anyhow::Result<()> {
    let (requester_bus, operator_bus): (Arc<dyn RelayBus>, Arc<dyn RelayBus>) = match &cli.hub {
        Some(url) => (
            Arc::new(WsRelay::connect(url.clone())),
            Arc::new(WsRelay::connect(url.clone())),
        ),
        None => {
            let relay = LocalRelay::new();
            (Arc::new(relay.endpoint()), Arc::new(relay.endpoint()))
        }
    };
    let manager = SessionManager::new(open_store(&cli.store).await?);

    let agent = start_requester(manager.clone(), requester_bus, args, config, "requester").await?;
    let session_id = agent.session().id;
    let requester = tokio::spawn(agent.run());

    let admin = AdminAgent::join(manager, operator_bus, config, session_id, "operator")
        .await
        .context("failed to join the session")?;
    operate(admin, bridge.port()).await?;

    let reason = requester.await?;
    tracing::info!(%session_id, %reason, "Session finished");
    Ok(())
}

async fn run_requester(
    cli: &Cli,
    config: &TunnelConfig,
    args: &DeviceArgs,
    requester_id: &str,
) -> anyhow::Result<()> {
    let hub = require_shared(cli, "requester")?;
    let manager = SessionManager::new(open_store(&cli.store).await?);
    let agent = start_requester(
        manager,
        Arc::new(WsRelay::connect(hub)),
        args,
        config,
        requester_id,
    )
    .await?;
    let session_id = agent.session().id;
    println!("Session {session_id} is waiting; join with: support-tunnel operator --session {session_id}");
    println!("Type /end to close it.");

    let handle = agent.handle();
    let mut view = handle.console().history_plus_stream();
    tokio::spawn(async move {
        while let Some(line) = view.next().await {
            println!("{}", render(&line));
        }
    });

    let mut run = tokio::spawn(agent.run());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            reason = &mut run => {
                let reason = reason?;
                tracing::info!(%session_id, %reason, "Session finished");
                return Ok(());
            }
            line = stdin.next_line() => {
                if matches!(line?.as_deref().map(str::trim), None | Some("/end")) {
                    break;
                }
                eprintln!("Only /end is understood here");
            }
        }
    }

    if let Err(e) = handle.end().await {
        tracing::warn!(%session_id, "Ending the session failed: {e}");
    }
    let reason = run.await?;
    tracing::info!(%session_id, %reason, "Session finished");
    Ok(())
}

async fn run_operator(
    cli: &Cli,
    config: &TunnelConfig,
    session: Option<SessionId>,
    list: bool,
    operator_id: &str,
    bridge: &BridgeArgs,
) -> anyhow::Result<()> {
    let manager = SessionManager::new(open_store(&cli.store).await?);
    if list {
        for s in manager.list_active(SessionFilter::default()).await? {
            println!(
                "{}  {:<7}  {}  {}",
                s.id,
                s.status,
                s.requester_id,
                s.device_chip.as_deref().unwrap_or("-")
            );
        }
        return Ok(());
    }
    let session = session.context("--session is required")?;
    let hub = require_shared(cli, "operator")?;

    let admin = AdminAgent::join(
        manager,
        Arc::new(WsRelay::connect(hub)),
        config,
        session,
        operator_id,
    )
    .await
    .with_context(|| format!("failed to join session {session}"))?;
    operate(admin, bridge.port()).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TunnelConfig::default(),
    };

    match &cli.command {
        Command::Local { device, bridge } => run_local(&cli, &config, device, bridge).await,
        Command::Requester { device, id } => run_requester(&cli, &config, device, id).await,
        Command::Operator {
            session,
            list,
            id,
            bridge,
        } => run_operator(&cli, &config, *session, *list, id, bridge).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_operator_needs_a_session_unless_listing() {
        assert!(Cli::try_parse_from(["support-tunnel", "operator"]).is_err());
        assert!(Cli::try_parse_from(["support-tunnel", "operator", "--list"]).is_ok());

        let cli = Cli::try_parse_from([
            "support-tunnel",
            "--store",
            "sqlite://sessions.db",
            "operator",
            "--session",
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "--rfc2217",
        ])
        .unwrap();
        let Command::Operator { session, bridge, .. } = &cli.command else {
            panic!("expected operator mode");
        };
        assert!(session.is_some());
        assert_eq!(bridge.port(), Some(DEFAULT_PORT));
    }

    #[test]
    fn test_separate_processes_need_shared_state() {
        let cli = Cli::try_parse_from(["support-tunnel", "requester"]).unwrap();
        assert!(require_shared(&cli, "requester").is_err());

        let cli = Cli::try_parse_from([
            "support-tunnel",
            "--store",
            "sqlite://sessions.db",
            "--hub",
            "ws://127.0.0.1:8080/relay",
            "requester",
        ])
        .unwrap();
        assert_eq!(
            require_shared(&cli, "requester").unwrap(),
            "ws://127.0.0.1:8080/relay"
        );
    }

    #[tokio::test]
    async fn test_unknown_store_is_rejected() {
        let err = open_store("postgres://db").await.err().unwrap();
        assert!(err.to_string().contains("unsupported store"));
        assert!(open_store("memory").await.is_ok());
    }
}
