//! Operator endpoint.

use std::{collections::HashSet, sync::Arc, time::Duration};

use support_tunnel_core::{
    TunnelConfig, TunnelError,
    protocol::{
        Action, ActionKind, ActionResult, BaudRate, DeviceInfo, Direction, Envelope, FlashPhase,
        FlashProgress, Heartbeat, SerialData, SessionEnd, ShimHello, Signal,
    },
    session::{CloseReason, Session, SessionId},
    terminal::{LineLevel, TerminalAggregator, TerminalLine},
    traits::{BusEvent, RelayBus, RelayBusExt, Subscription},
};
use support_tunnel_session::SessionManager;
use tokio::{sync::broadcast, time::Instant};

use crate::{
    error::AdminError,
    health::{BridgeHealth, HealthMonitor},
    port_bridge::PortRequest,
    relay::{Backoff, next_event},
};

/// How often bridge health is re-evaluated.
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Device output chunks buffered per local port client.
const OUTPUT_FEED_CAPACITY: usize = 256;

/// Client kind announced when a local serial port client attaches.
pub const PORT_BRIDGE_KIND: &str = "pio_bridge";

/// Operator endpoint for one joined session.
///
/// Feeds every inbound event into the terminal view and the health monitor,
/// in arrival order. Call [`AdminAgent::pump`] in a loop to drive it.
pub struct AdminAgent {
    session: Session,
    topic: String,
    manager: SessionManager,
    bus: Arc<dyn RelayBus>,
    subscription: Option<Subscription>,
    terminal: Arc<TerminalAggregator>,
    health: HealthMonitor,
    pending: HashSet<ActionKind>,
    device_info: Option<DeviceInfo>,
    device_connected: Option<bool>,
    flash_progress: Option<FlashProgress>,
    last_result: Option<ActionResult>,
    baud: Option<u32>,
    max_frame_bytes: usize,
    output: broadcast::Sender<Vec<u8>>,
    resubscribe: Backoff,
    resubscribe_at: Option<Instant>,
    next_check: Instant,
    ended: Option<CloseReason>,
}

impl AdminAgent {
    /// Join `session_id` as `operator_id` and wait for the relay to confirm
    /// the subscription.
    ///
    /// # Errors
    /// Returns error if the session is unavailable to this operator or the
    /// subscription is not confirmed within the configured timeout.
    pub async fn join(
        manager: SessionManager,
        bus: Arc<dyn RelayBus>,
        config: &TunnelConfig,
        session_id: SessionId,
        operator_id: &str,
    ) -> Result<Self, AdminError> {
        let session = manager.join(session_id, operator_id).await?;
        let topic = session.topic();

        let mut subscription = bus.subscribe(&topic);
        if let Err(e) = subscription.confirmed(config.subscribe_timeout()).await {
            tracing::error!(session = %session_id, topic = %topic, "Subscribe failed: {e}");
            return Err(AdminError::Subscribe(e));
        }

        let now = Instant::now();
        let terminal = Arc::new(TerminalAggregator::new(config.terminal_capacity));
        terminal.push_system(LineLevel::Info, format!("Joined session {session_id}"));
        let device_info = session.device_chip.clone().map(|chip| DeviceInfo {
            chip,
            serial: session.device_serial.clone(),
            firmware: session.device_firmware.clone(),
        });
        tracing::info!(session = %session_id, operator = operator_id, topic = %topic, "Operator attached");

        Ok(Self {
            session,
            topic,
            manager,
            bus,
            subscription: Some(subscription),
            terminal,
            health: HealthMonitor::new(config, now),
            pending: HashSet::new(),
            device_info,
            device_connected: None,
            flash_progress: None,
            last_result: None,
            baud: None,
            max_frame_bytes: config.max_frame_bytes,
            output: broadcast::channel(OUTPUT_FEED_CAPACITY).0,
            resubscribe: Backoff::resubscribe(),
            resubscribe_at: None,
            next_check: now + HEALTH_CHECK_PERIOD,
            ended: None,
        })
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn terminal(&self) -> &Arc<TerminalAggregator> {
        &self.terminal
    }

    #[must_use]
    pub const fn health(&self) -> BridgeHealth {
        self.health.state()
    }

    /// Latest device metadata, from the session record or `device_info`.
    #[must_use]
    pub const fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Whether the requester reported an open device link in its last heartbeat.
    #[must_use]
    pub const fn device_connected(&self) -> Option<bool> {
        self.device_connected
    }

    #[must_use]
    pub const fn flash_progress(&self) -> Option<&FlashProgress> {
        self.flash_progress.as_ref()
    }

    #[must_use]
    pub const fn last_result(&self) -> Option<&ActionResult> {
        self.last_result.as_ref()
    }

    /// Last baud rate the requester acknowledged.
    #[must_use]
    pub const fn baud(&self) -> Option<u32> {
        self.baud
    }

    #[must_use]
    pub fn is_pending(&self, kind: ActionKind) -> bool {
        self.pending.contains(&kind)
    }

    /// Raw device output, in arrival order. Subscribe to receive it.
    #[must_use]
    pub fn output_feed(&self) -> broadcast::Sender<Vec<u8>> {
        self.output.clone()
    }

    /// Why the session ended, once it has.
    #[must_use]
    pub const fn ended(&self) -> Option<CloseReason> {
        self.ended
    }

    /// Stop waiting for the result of `kind`, allowing it to be sent again.
    pub fn forget_pending(&mut self, kind: ActionKind) {
        self.pending.remove(&kind);
    }

    const fn ensure_live(&self) -> Result<(), AdminError> {
        if self.ended.is_some() {
            Err(AdminError::Ended)
        } else {
            Ok(())
        }
    }

    fn publish(&self, envelope: &Envelope) {
        self.bus.publish_envelope(&self.topic, envelope);
    }

    fn line(&self, level: LineLevel, text: impl Into<String>) {
        self.terminal.push_system(level, text);
    }

    /// Type text into the device console.
    ///
    /// # Errors
    /// Returns error if the session has ended.
    pub fn send_text(&self, text: &str) -> Result<(), AdminError> {
        self.ensure_live()?;
        self.publish(&Envelope::SerialInput(SerialData::text(text)));
        self.terminal.push_admin(text);
        Ok(())
    }

    /// Send raw bytes to the device, split to fit the frame limit.
    ///
    /// # Errors
    /// Returns error if the session has ended.
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<(), AdminError> {
        self.ensure_live()?;
        for chunk in SerialData::chunked(bytes, self.max_frame_bytes) {
            self.publish(&Envelope::SerialInput(chunk));
        }
        Ok(())
    }

    /// Drive the DTR/RTS lines.
    ///
    /// # Errors
    /// Returns error if the session has ended.
    pub fn send_signal(&self, dtr: bool, rts: bool) -> Result<(), AdminError> {
        self.ensure_live()?;
        self.publish(&Envelope::Signal(Signal { dtr, rts }));
        self.line(LineLevel::Info, format!("DTR={dtr} RTS={rts}"));
        Ok(())
    }

    /// Ask the requester to reopen the link at `rate`.
    ///
    /// # Errors
    /// Returns error if the session has ended.
    pub fn set_baud(&self, rate: u32) -> Result<(), AdminError> {
        self.ensure_live()?;
        self.publish(&Envelope::SetBaud(BaudRate { rate }));
        self.line(LineLevel::Info, format!("Requested baud rate {rate}"));
        Ok(())
    }

    /// Forward what a local serial port client did.
    ///
    /// # Errors
    /// Returns error if the session has ended.
    pub fn apply_port_request(&self, request: PortRequest) -> Result<(), AdminError> {
        self.ensure_live()?;
        match request {
            PortRequest::Attached => {
                self.publish(&Envelope::ShimHello(ShimHello {
                    kind: PORT_BRIDGE_KIND.into(),
                }));
                self.line(LineLevel::Info, "Port client attached");
            }
            PortRequest::Data(bytes) => self.send_bytes(&bytes)?,
            PortRequest::Baud(rate) => self.set_baud(rate)?,
            PortRequest::Signal { dtr, rts } => self.send_signal(dtr, rts)?,
            PortRequest::Detached => self.line(LineLevel::Info, "Port client detached"),
        }
        Ok(())
    }

    /// Request a device action.
    ///
    /// # Errors
    /// Returns error if the session has ended, a flash has no manifest URL,
    /// or the same action is still awaiting its result.
    pub fn dispatch(&mut self, action: Action) -> Result<(), AdminError> {
        self.ensure_live()?;
        if action.kind == ActionKind::Flash
            && action.manifest_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(AdminError::MissingManifest);
        }
        if !self.pending.insert(action.kind) {
            return Err(AdminError::ActionPending(action.kind));
        }
        self.line(LineLevel::Info, format!("Requested {}", action.kind));
        self.publish(&Envelope::Action(action));
        Ok(())
    }

    /// End the session: tell the requester, then close the record.
    ///
    /// # Errors
    /// Returns error if the session already ended or the store rejects the close.
    pub async fn end(&mut self, reason: CloseReason) -> Result<Session, AdminError> {
        self.ensure_live()?;
        self.publish(&Envelope::SessionEnd(SessionEnd { reason }));
        let session = self.manager.close(self.session.id, reason).await?;
        self.finish(reason, format!("Session ended ({reason})"));
        self.session = session.clone();
        Ok(session)
    }

    fn finish(&mut self, reason: CloseReason, text: String) {
        self.ended = Some(reason);
        self.subscription = None;
        self.resubscribe_at = None;
        self.line(LineLevel::Info, text);
        tracing::info!(session = %self.session.id, %reason, "Operator detached");
    }

    /// Wait for the next relay event or health check and process it.
    ///
    /// Returns `false` once the session has ended.
    pub async fn pump(&mut self) -> bool {
        if self.ended.is_some() {
            return false;
        }
        let deadline = self
            .resubscribe_at
            .map_or(self.next_check, |at| at.min(self.next_check));
        tokio::select! {
            event = next_event(&mut self.subscription) => {
                self.handle_bus_event(event, Instant::now());
            }
            () = tokio::time::sleep_until(deadline) => self.tick(Instant::now()),
        }
        self.ended.is_none()
    }

    /// Drive the endpoint until the session ends.
    pub async fn run(&mut self) {
        while self.pump().await {}
    }

    /// Periodic work: health re-evaluation and due resubscribes.
    pub fn tick(&mut self, now: Instant) {
        if let Some(change) = self.health.evaluate(now) {
            self.terminal.push(change.to_line());
        }
        self.next_check = now + HEALTH_CHECK_PERIOD;

        if self.resubscribe_at.is_some_and(|at| at <= now) {
            self.resubscribe_at = None;
            tracing::info!(session = %self.session.id, topic = %self.topic, "Resubscribing");
            self.subscription = Some(self.bus.subscribe(&self.topic));
        }
    }

    /// Apply one relay event. `None` means the subscription ended.
    pub fn handle_bus_event(&mut self, event: Option<BusEvent>, now: Instant) {
        match event {
            Some(BusEvent::Message(frame)) => self.on_frame(&frame, now),
            Some(BusEvent::Status(true)) => {
                self.resubscribe.reset();
                self.line(LineLevel::Info, "Relay subscription live");
            }
            Some(BusEvent::Status(false)) => self.disconnected(),
            Some(BusEvent::Error(e)) => {
                let err = TunnelError::Session(e);
                tracing::warn!(session = %self.session.id, "{err}");
                self.terminal.push(err.to_line());
                self.disconnected();
            }
            None => {
                self.subscription = None;
                self.disconnected();
                let delay = self.resubscribe.next_delay();
                self.resubscribe_at = Some(now + delay);
                self.line(
                    LineLevel::Warn,
                    format!("Relay subscription ended, resubscribing in {delay:?}"),
                );
            }
        }
    }

    fn disconnected(&mut self) {
        if let Some(change) = self.health.mark_disconnected() {
            self.terminal.push(change.to_line());
        }
    }

    fn on_frame(&mut self, frame: &str, now: Instant) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(session = %self.session.id, "{e}");
                self.terminal.push(TunnelError::from(e).to_line());
                return;
            }
        };
        if !envelope.is_for(Direction::ToOperator) {
            return;
        }
        tracing::debug!(session = %self.session.id, event = envelope.event_name(), "Requester event");

        match envelope {
            Envelope::SerialOutput(data) => match data.to_bytes() {
                Ok(bytes) => {
                    self.terminal
                        .push(TerminalLine::device(String::from_utf8_lossy(&bytes)));
                    // no receivers is fine
                    let _ = self.output.send(bytes);
                }
                Err(e) => self.terminal.push(TunnelError::from(e).to_line()),
            },
            Envelope::FlashProgress(progress) => {
                let level = if progress.phase == FlashPhase::Error {
                    LineLevel::Error
                } else {
                    LineLevel::Info
                };
                self.line(
                    level,
                    format!(
                        "Flash {} {}%: {}",
                        progress.phase, progress.percent, progress.message
                    ),
                );
                self.flash_progress = Some(progress);
            }
            Envelope::DeviceInfo(info) => {
                self.line(LineLevel::Info, format!("Device chip {}", info.chip));
                self.device_info = Some(info);
            }
            Envelope::ActionResult(result) => {
                self.pending.remove(&result.action);
                match &result.error {
                    None if result.success => {
                        self.line(LineLevel::Info, format!("{} succeeded", result.action));
                    }
                    error => self.line(
                        LineLevel::Error,
                        format!(
                            "{} failed: {}",
                            result.action,
                            error.as_deref().unwrap_or("unknown error")
                        ),
                    ),
                }
                self.last_result = Some(result);
            }
            Envelope::Heartbeat(Heartbeat { connected, .. }) => {
                if let Some(change) = self.health.record_heartbeat(now) {
                    self.terminal.push(change.to_line());
                }
                self.on_device_link(connected);
            }
            Envelope::BaudAck(BaudRate { rate }) => {
                self.baud = Some(rate);
                self.line(LineLevel::Info, format!("Baud rate now {rate}"));
            }
            Envelope::SessionEnd(SessionEnd { reason }) => {
                self.finish(reason, format!("Requester ended the session ({reason})"));
            }
            _ => {}
        }
    }

    fn on_device_link(&mut self, connected: bool) {
        let previous = self.device_connected.replace(connected);
        match (previous, connected) {
            (Some(false), true) => self.line(LineLevel::Info, "Device link restored"),
            (Some(true) | None, false) => {
                self.line(LineLevel::Warn, "Requester reports the device link is down");
            }
            _ => {}
        }
    }
}
