//! Both endpoints wired through one in-process relay.

use std::{sync::Arc, time::Duration};

use support_tunnel_core::{
    RelayBus, TunnelConfig,
    protocol::{Action, ActionKind, BaudRate, Envelope, FlashPhase, SerialData, Signal},
    session::{CloseReason, DeviceHint, SessionStatus},
    terminal::{LineLevel, LineSource},
    traits::RelayBusExt,
};
use support_tunnel_flash::{Build, FlashOrchestrator, Manifest, MemoryFirmwareSource, MemoryFlasher, Part};
use support_tunnel_serial::{LoopbackDevice, loopback::BOOT_BANNER};
use support_tunnel_session::{SessionManager, storage::MemoryStorage};
use support_tunnel_transport::LocalRelay;
use tokio::task::JoinHandle;

use crate::{AdminAgent, BridgeHealth, UserAgent, UserAgentHandle};

const MANIFEST_URL: &str = "https://firmware.example/esp32/manifest.json";

struct Rig {
    manager: SessionManager,
    relay: LocalRelay,
    device: LoopbackDevice,
    flasher: MemoryFlasher,
    handle: UserAgentHandle,
    agent: JoinHandle<CloseReason>,
}

async fn start() -> Rig {
    start_with(MemoryFlasher::new("ESP32")).await
}

async fn start_with(flasher: MemoryFlasher) -> Rig {
    let manager = SessionManager::new(Arc::new(MemoryStorage::new()));
    let relay = LocalRelay::new();
    let device = LoopbackDevice::new().with_banners();
    let source = MemoryFirmwareSource::new()
        .with_manifest(
            MANIFEST_URL,
            Manifest {
                name: "demo".into(),
                version: Some("1.2.0".into()),
                builds: vec![Build {
                    chip_family: "ESP32".into(),
                    parts: vec![Part {
                        path: "app.bin".into(),
                        offset: 0x1_0000,
                    }],
                }],
            },
        )
        .with_part("app.bin", vec![0xAB; 40_000]);

    let agent = UserAgent::start(
        manager.clone(),
        Arc::new(relay.endpoint()),
        Arc::new(device.clone()),
        FlashOrchestrator::new(Arc::new(source), Arc::new(flasher.clone())),
        TunnelConfig::default(),
        "requester",
        DeviceHint {
            chip: Some("ESP32".into()),
            serial: Some("AA:BB:CC".into()),
            firmware: None,
        },
    )
    .await
    .unwrap();
    let handle = agent.handle();
    let agent = tokio::spawn(agent.run());

    Rig {
        manager,
        relay,
        device,
        flasher,
        handle,
        agent,
    }
}

async fn join(rig: &Rig) -> AdminAgent {
    AdminAgent::join(
        rig.manager.clone(),
        Arc::new(rig.relay.endpoint()),
        &TunnelConfig::default(),
        rig.handle.session_id(),
        "operator",
    )
    .await
    .unwrap()
}

async fn pump_until(admin: &mut AdminAgent, done: impl Fn(&AdminAgent) -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !done(&*admin) {
            assert!(admin.pump().await, "session ended early");
        }
    })
    .await
    .expect("condition not reached");
}

fn has_line(admin: &AdminAgent, source: LineSource, needle: &str) -> bool {
    admin
        .terminal()
        .lines()
        .iter()
        .any(|l| l.source == source && l.text.contains(needle))
}

#[tokio::test]
async fn test_operator_resets_device_and_ends_session() {
    let rig = start().await;
    let stored = rig.manager.get(rig.handle.session_id()).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Waiting);

    let mut admin = join(&rig).await;
    assert_eq!(admin.session().status, SessionStatus::Active);

    rig.device.inject("Booting...\r\n");
    pump_until(&mut admin, |a| has_line(a, LineSource::Device, "Booting...")).await;

    admin.dispatch(Action::new(ActionKind::Reset)).unwrap();
    pump_until(&mut admin, |a| a.last_result().is_some()).await;
    let result = admin.last_result().unwrap();
    assert_eq!(result.action, ActionKind::Reset);
    assert!(result.success);
    assert_eq!(rig.device.signals(), [(false, true), (false, false)]);
    pump_until(&mut admin, |a| has_line(a, LineSource::Device, "SPI_FAST_FLASH_BOOT")).await;
    assert!(BOOT_BANNER.contains("SPI_FAST_FLASH_BOOT"));

    let closed = admin.end(CloseReason::AdminEnded).await.unwrap();
    assert_eq!(closed.status, SessionStatus::Closed);
    assert_eq!(rig.agent.await.unwrap(), CloseReason::AdminEnded);
    assert!(!rig.device.is_open());

    let stored = rig.manager.get(closed.id).await.unwrap();
    assert_eq!(stored.close_reason, Some(CloseReason::AdminEnded));
}

#[tokio::test]
async fn test_binary_input_reaches_device_unchanged() {
    let rig = start().await;
    let admin = join(&rig).await;
    let payload = [0x00, 0xFF, 0x1B, 0x80, b'\n'];

    admin.send_bytes(&payload).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while rig.device.written() != payload {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bytes never reached the device");
}

#[tokio::test]
async fn test_flash_runs_to_completion() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    admin.dispatch(Action::flash(MANIFEST_URL)).unwrap();
    assert!(admin.is_pending(ActionKind::Flash));
    pump_until(&mut admin, |a| a.last_result().is_some()).await;

    let result = admin.last_result().unwrap();
    assert_eq!(result.action, ActionKind::Flash);
    assert!(result.success, "{:?}", result.error);
    assert!(!admin.is_pending(ActionKind::Flash));

    let progress = admin.flash_progress().unwrap();
    assert_eq!(progress.phase, FlashPhase::Complete);
    assert_eq!(progress.percent, 100);
    assert_eq!(rig.flasher.read(0x1_0000, 4), [0xAB; 4]);
    assert_eq!(rig.flasher.resets(), 1);
}

#[tokio::test]
async fn test_requester_rejects_flash_without_manifest() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    // bypasses the operator-side check
    let raw = rig.relay.endpoint();
    raw.publish_envelope(
        &admin.session().topic(),
        &Envelope::Action(Action::new(ActionKind::Flash)),
    );

    pump_until(&mut admin, |a| a.last_result().is_some()).await;
    let result = admin.last_result().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("manifestUrl is required"));
    assert_eq!(rig.flasher.writes(), 0);
}

#[tokio::test]
async fn test_baud_change_is_acknowledged() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    admin.set_baud(921_600).unwrap();
    pump_until(&mut admin, |a| a.baud().is_some()).await;

    assert_eq!(admin.baud(), Some(921_600));
    assert_eq!(rig.device.bauds(), [115_200, 921_600]);
    assert!(rig.device.is_open());
}

#[tokio::test]
async fn test_unknown_event_is_logged_not_fatal() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    let raw = rig.relay.endpoint();
    raw.publish(
        &admin.session().topic(),
        r#"{"event":"telemetry_ping","payload":{"version":1}}"#.to_string(),
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let warned = rig.handle.console().lines().iter().any(|l| {
                l.level == Some(LineLevel::Warn) && l.text.contains("telemetry_ping")
            });
            if warned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requester never logged the unknown event");

    admin.send_text("help\n").unwrap();
    pump_until(&mut admin, |a| has_line(a, LineSource::Device, "help")).await;
    assert!(has_line(&admin, LineSource::Admin, "help"));
}

#[tokio::test]
async fn test_requester_ends_session() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    let closed = rig.handle.end().await.unwrap();
    assert_eq!(closed.close_reason, Some(CloseReason::UserEnded));

    tokio::time::timeout(Duration::from_secs(5), admin.run())
        .await
        .expect("operator never saw the end");
    assert_eq!(admin.ended(), Some(CloseReason::UserEnded));
    assert_eq!(rig.agent.await.unwrap(), CloseReason::UserEnded);
    assert!(!rig.device.is_open());
    assert!(rig.handle.end().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bridge_health_follows_requester() {
    let rig = start().await;
    let mut admin = join(&rig).await;

    pump_until(&mut admin, |a| a.health() == BridgeHealth::Healthy).await;
    assert_eq!(admin.device_connected(), Some(true));

    rig.agent.abort();
    assert!(rig.agent.await.unwrap_err().is_cancelled());
    assert!(!rig.device.is_open());

    pump_until(&mut admin, |a| a.health() == BridgeHealth::Degraded).await;
    pump_until(&mut admin, |a| a.health() == BridgeHealth::Disconnected).await;
    assert!(admin.ended().is_none());
}

#[tokio::test]
async fn test_closed_session_ignores_late_operator_events() {
    let rig = start().await;
    let admin = join(&rig).await;
    let topic = admin.session().topic();

    rig.manager
        .close(rig.handle.session_id(), CloseReason::AdminEnded)
        .await
        .unwrap();
    let raw = rig.relay.endpoint();
    raw.publish_envelope(&topic, &Envelope::SerialInput(SerialData::text("rm -rf\n")));
    raw.publish_envelope(&topic, &Envelope::Action(Action::new(ActionKind::Reset)));

    let reason = tokio::time::timeout(Duration::from_secs(5), rig.agent)
        .await
        .expect("requester kept running after the close")
        .unwrap();
    assert_eq!(reason, CloseReason::AdminEnded);
    assert!(rig.device.written().is_empty());
    assert!(rig.device.signals().is_empty());
    assert!(!rig.device.is_open());
}

#[tokio::test]
async fn test_waiting_session_drops_operator_events() {
    let rig = start().await;
    let topic = rig.manager.get(rig.handle.session_id()).await.unwrap().topic();

    let raw = rig.relay.endpoint();
    let events = [
        Envelope::SerialInput(SerialData::text("rm -rf\n")),
        Envelope::Signal(Signal {
            dtr: false,
            rts: true,
        }),
        Envelope::SetBaud(BaudRate { rate: 9600 }),
        Envelope::Action(Action::new(ActionKind::Reset)),
        Envelope::Action(Action::new(ActionKind::Bootloader)),
    ];
    for envelope in &events {
        raw.publish_envelope(&topic, envelope);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ignored = rig
                .handle
                .console()
                .lines()
                .iter()
                .filter(|l| l.level == Some(LineLevel::Warn) && l.text.starts_with("Ignored"))
                .count();
            if ignored == events.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requester acted on events before a join");

    assert!(rig.device.written().is_empty());
    assert!(rig.device.signals().is_empty());
    assert_eq!(rig.device.bauds(), [115_200]);
    assert!(rig.device.is_open());
    let stored = rig.manager.get(rig.handle.session_id()).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn test_flash_abort_returns_to_idle() {
    let rig = start_with(MemoryFlasher::new("ESP32").with_write_delay(Duration::from_secs(5))).await;
    let mut admin = join(&rig).await;

    admin.dispatch(Action::flash(MANIFEST_URL)).unwrap();
    pump_until(&mut admin, |a| {
        a.flash_progress()
            .is_some_and(|p| p.phase == FlashPhase::Flashing)
    })
    .await;

    admin.dispatch(Action::new(ActionKind::FlashAbort)).unwrap();
    pump_until(&mut admin, |a| {
        !a.is_pending(ActionKind::Flash) && !a.is_pending(ActionKind::FlashAbort)
    })
    .await;

    assert_eq!(admin.flash_progress().unwrap().phase, FlashPhase::Idle);
    assert!(has_line(&admin, LineSource::System, "flash_abort succeeded"));
    assert!(has_line(&admin, LineSource::System, "flash failed: aborted"));
    let last = admin.last_result().unwrap();
    assert_eq!(last.action, ActionKind::Flash);
    assert!(!last.success);
    assert_eq!(rig.flasher.resets(), 0);

    // the link is back with the requester
    admin.send_text("status\n").unwrap();
    pump_until(&mut admin, |a| has_line(a, LineSource::Device, "status")).await;
}
