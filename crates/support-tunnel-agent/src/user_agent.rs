//! Requester endpoint: bridges the device link onto the session topic.

use std::{ops::ControlFlow, sync::Arc};

use support_tunnel_core::{
    TunnelConfig, TunnelError,
    error::ProtocolError,
    protocol::{
        Action, ActionKind, ActionResult, BaudRate, DeviceInfo, Direction, Envelope, FlashProgress,
        Heartbeat, SerialData, SessionEnd, ShimHello, Signal,
    },
    session::{CloseReason, DeviceHint, Session, SessionId, SessionStatus, now_millis},
    terminal::{LineLevel, TerminalAggregator},
    traits::{BusEvent, RelayBus, RelayBusExt, Subscription},
};
use support_tunnel_flash::{FlashError, FlashOrchestrator, FlashOutcome, ProgressSink};
use support_tunnel_serial::{
    BOOTLOADER_SEQUENCE, LinkError, LinkGuard, LinkOpener, RESET_SEQUENCE, SignalStep,
    run_sequence,
};
use support_tunnel_session::SessionManager;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::AgentError,
    relay::{Backoff, next_event, sleep_until},
};

enum Command {
    End {
        reply: oneshot::Sender<Result<Session, AgentError>>,
    },
}

/// Handle to a running [`UserAgent`].
#[derive(Clone)]
pub struct UserAgentHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    console: Arc<TerminalAggregator>,
}

impl UserAgentHandle {
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The requester's local console.
    #[must_use]
    pub fn console(&self) -> &Arc<TerminalAggregator> {
        &self.console
    }

    /// End the session from the requester side (`user_ended`).
    ///
    /// # Errors
    /// Returns error if the agent has stopped or the store rejects the close.
    pub async fn end(&self) -> Result<Session, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::End { reply })
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }
}


type FlashDone = Result<FlashOutcome, FlashError>;

/// A flash job. It holds the device link until the task hands it back.
struct FlashRun {
    cancel: CancellationToken,
    task: JoinHandle<(LinkGuard, FlashDone)>,
}

impl Drop for FlashRun {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Requester endpoint.
///
/// Owns the device link for the whole session. Operator events are handled
/// one at a time in arrival order, and only while the session record is
/// active; the record is re-read before each one. A flash run borrows the
/// link and executes beside the loop, so device reads pause until it hands
/// the link back. The link is released however the agent stops, including
/// when its task is aborted.
pub struct UserAgent {
    session: Session,
    topic: String,
    manager: SessionManager,
    bus: Arc<dyn RelayBus>,
    opener: Arc<dyn LinkOpener>,
    link: Option<LinkGuard>,
    flasher: FlashOrchestrator,
    config: TunnelConfig,
    console: Arc<TerminalAggregator>,
    subscription: Option<Subscription>,
    resubscribe: Backoff,
    resubscribe_at: Option<Instant>,
    flash: Option<FlashRun>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

async fn read_link(link: Option<&mut LinkGuard>, buf: &mut [u8]) -> Result<usize, LinkError> {
    match link {
        Some(link) => link.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn flash_finished(
    flash: Option<&mut FlashRun>,
) -> Result<(LinkGuard, FlashDone), JoinError> {
    match flash {
        Some(run) => (&mut run.task).await,
        None => std::future::pending().await,
    }
}

impl UserAgent {
    /// Acquire the device link, open a waiting session and subscribe to its topic.
    ///
    /// # Errors
    /// Returns error if the device cannot be opened or the session cannot be created.
    pub async fn start(
        manager: SessionManager,
        bus: Arc<dyn RelayBus>,
        opener: Arc<dyn LinkOpener>,
        flasher: FlashOrchestrator,
        config: TunnelConfig,
        requester_id: &str,
        device: DeviceHint,
    ) -> Result<Self, AgentError> {
        let link = LinkGuard::acquire(Arc::clone(&opener), config.initial_baud).await?;
        let session = manager.open(requester_id, device).await?;
        let topic = session.topic();
        let subscription = Some(bus.subscribe(&topic));
        let console = Arc::new(TerminalAggregator::new(config.terminal_capacity));
        console.push_system(
            LineLevel::Info,
            format!("Waiting for an operator on session {}", session.id),
        );
        tracing::info!(session = %session.id, topic = %topic, "Requester agent started");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            session,
            topic,
            manager,
            bus,
            opener,
            link: Some(link),
            flasher,
            config,
            console,
            subscription,
            resubscribe: Backoff::resubscribe(),
            resubscribe_at: None,
            flash: None,
            commands_tx,
            commands_rx,
        })
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn handle(&self) -> UserAgentHandle {
        UserAgentHandle {
            session_id: self.session.id,
            commands: self.commands_tx.clone(),
            console: Arc::clone(&self.console),
        }
    }

    /// Bridge until the session ends, returning why it ended.
    pub async fn run(mut self) -> CloseReason {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; self.config.read_buffer_bytes.max(1)];

        loop {
            let flow = tokio::select! {
                read = read_link(self.link.as_mut(), &mut buf) => {
                    self.on_read(read.map(|n| &buf[..n]));
                    ControlFlow::Continue(())
                }
                event = next_event(&mut self.subscription) => self.on_bus_event(event).await,
                () = sleep_until(self.resubscribe_at) => {
                    self.resubscribe_at = None;
                    self.subscription = Some(self.bus.subscribe(&self.topic));
                    ControlFlow::Continue(())
                }
                done = flash_finished(self.flash.as_mut()) => {
                    self.on_flash_done(done);
                    ControlFlow::Continue(())
                }
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                _ = heartbeat.tick() => self.on_tick().await,
            };

            if let ControlFlow::Break(reason) = flow {
                self.shutdown(reason).await;
                return reason;
            }
        }
    }

    fn publish(&self, envelope: &Envelope) {
        self.bus.publish_envelope(&self.topic, envelope);
    }

    fn report(&self, err: &TunnelError) {
        match err.level() {
            LineLevel::Error => tracing::error!(session = %self.session.id, "{err}"),
            _ => tracing::warn!(session = %self.session.id, "{err}"),
        }
        self.console.push(err.to_line());
    }

    fn link_unavailable(&self) {
        let reason = if self.flash.is_some() {
            "device link busy flashing"
        } else {
            "device link unavailable"
        };
        self.report(&TunnelError::Connection(reason.into()));
    }

    fn send_result(&self, result: ActionResult) {
        if !result.success {
            self.console.push_system(
                LineLevel::Warn,
                format!(
                    "{} failed: {}",
                    result.action,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            );
        }
        self.publish(&Envelope::ActionResult(result));
    }

    /// Re-read the session record. Breaks once it is closed, otherwise
    /// reports whether operator events may be acted on.
    async fn refresh_session(&mut self) -> ControlFlow<CloseReason, bool> {
        match self.manager.get(self.session.id).await {
            Ok(session) => {
                self.session = session;
                match self.session.status {
                    SessionStatus::Active => ControlFlow::Continue(true),
                    SessionStatus::Waiting => ControlFlow::Continue(false),
                    SessionStatus::Closed => ControlFlow::Break(
                        self.session.close_reason.unwrap_or(CloseReason::Error),
                    ),
                }
            }
            Err(e) => {
                self.report(&e.into());
                ControlFlow::Continue(false)
            }
        }
    }

    fn on_read(&self, read: Result<&[u8], LinkError>) {
        match read {
            Ok(bytes) => {
                for chunk in SerialData::chunked(bytes, self.config.max_frame_bytes) {
                    self.publish(&Envelope::SerialOutput(chunk));
                }
                self.console.push_device(String::from_utf8_lossy(bytes));
            }
            Err(e) => self.report(&TunnelError::Connection(e.to_string())),
        }
    }

    async fn on_bus_event(&mut self, event: Option<BusEvent>) -> ControlFlow<CloseReason> {
        match event {
            Some(BusEvent::Message(frame)) => return self.on_frame(&frame).await,
            Some(BusEvent::Status(true)) => {
                self.resubscribe.reset();
                if let ControlFlow::Break(reason) = self.refresh_session().await {
                    return ControlFlow::Break(reason);
                }
                self.publish(&Envelope::DeviceInfo(DeviceInfo {
                    chip: self
                        .session
                        .device_chip
                        .clone()
                        .unwrap_or_else(|| "unknown".into()),
                    serial: self.session.device_serial.clone(),
                    firmware: self.session.device_firmware.clone(),
                }));
                tracing::info!(session = %self.session.id, "Relay subscription live");
            }
            Some(BusEvent::Status(false)) => {
                self.console
                    .push_system(LineLevel::Warn, "Relay connection lost");
            }
            Some(BusEvent::Error(e)) => self.report(&TunnelError::Session(e)),
            None => {
                self.subscription = None;
                let delay = self.resubscribe.next_delay();
                self.resubscribe_at = Some(Instant::now() + delay);
                self.report(&TunnelError::Session(format!(
                    "subscription ended, resubscribing in {delay:?}"
                )));
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_frame(&mut self, frame: &str) -> ControlFlow<CloseReason> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(&e.into());
                return ControlFlow::Continue(());
            }
        };
        if !envelope.is_for(Direction::ToRequester) {
            return ControlFlow::Continue(());
        }
        if let Envelope::SessionEnd(SessionEnd { reason }) = envelope {
            return ControlFlow::Break(reason);
        }
        match self.refresh_session().await {
            ControlFlow::Break(reason) => return ControlFlow::Break(reason),
            ControlFlow::Continue(false) => {
                tracing::warn!(
                    session = %self.session.id,
                    event = envelope.event_name(),
                    status = %self.session.status,
                    "Operator event outside an active session"
                );
                self.console.push_system(
                    LineLevel::Warn,
                    format!("Ignored {}: session is not active", envelope.event_name()),
                );
                return ControlFlow::Continue(());
            }
            ControlFlow::Continue(true) => {}
        }
        tracing::debug!(session = %self.session.id, event = envelope.event_name(), "Operator event");

        match envelope {
            Envelope::SerialInput(data) => self.on_serial_input(&data).await,
            Envelope::Action(action) => self.on_action(action).await,
            Envelope::Signal(Signal { dtr, rts }) => self.on_signal(dtr, rts),
            Envelope::SetBaud(BaudRate { rate }) => self.on_set_baud(rate).await,
            Envelope::ShimHello(ShimHello { kind }) => {
                self.console
                    .push_system(LineLevel::Info, format!("Operator attached a {kind} client"));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    async fn on_serial_input(&mut self, data: &SerialData) {
        let bytes = match data.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return self.report(&e.into()),
        };
        let Some(link) = self.link.as_mut() else {
            return self.link_unavailable();
        };
        if let Err(e) = link.write(&bytes).await {
            self.report(&TunnelError::Connection(e.to_string()));
        }
    }

    fn on_signal(&mut self, dtr: bool, rts: bool) {
        let Some(link) = self.link.as_mut() else {
            return self.link_unavailable();
        };
        if let Err(e) = link.set_signals(dtr, rts) {
            self.report(&TunnelError::Connection(e.to_string()));
        }
    }

    async fn on_set_baud(&mut self, rate: u32) {
        if rate == 0 {
            return self.report(
                &ProtocolError::InvalidPayload {
                    event: "set_baud",
                    reason: "rate must be positive".into(),
                }
                .into(),
            );
        }
        let Some(link) = self.link.as_mut() else {
            return self.link_unavailable();
        };
        if !link.applies_baud() {
            let device = link.describe();
            return self.report(&TunnelError::Connection(format!(
                "{device} cannot change baud rate"
            )));
        }
        match link.reopen(rate).await {
            Ok(()) => {
                self.publish(&Envelope::BaudAck(BaudRate { rate }));
                self.console
                    .push_system(LineLevel::Info, format!("Baud rate set to {rate}"));
            }
            Err(e) => self.report(&TunnelError::Connection(format!(
                "reopen at {rate} baud failed: {e}"
            ))),
        }
    }

    async fn on_action(&mut self, action: Action) {
        let result = match action.kind {
            ActionKind::Reset => self.control(ActionKind::Reset, RESET_SEQUENCE).await,
            ActionKind::Bootloader => {
                self.control(ActionKind::Bootloader, BOOTLOADER_SEQUENCE)
                    .await
            }
            ActionKind::Flash => match self.start_flash(action.manifest_url) {
                Ok(()) => return,
                Err(reason) => ActionResult::failed(ActionKind::Flash, reason),
            },
            ActionKind::FlashAbort => match &self.flash {
                Some(run) => {
                    run.cancel.cancel();
                    ActionResult::ok(ActionKind::FlashAbort)
                }
                None => ActionResult::failed(ActionKind::FlashAbort, "no flash in progress"),
            },
        };
        self.send_result(result);
    }

    async fn control(&mut self, kind: ActionKind, steps: &[SignalStep]) -> ActionResult {
        if self.flash.is_some() {
            return ActionResult::failed(kind, "flash in progress");
        }
        let Some(link) = self.link.as_mut() else {
            return ActionResult::failed(kind, "device link unavailable");
        };
        match run_sequence(link, steps).await {
            Ok(()) => {
                self.console.push_system(LineLevel::Info, format!("{kind} done"));
                ActionResult::ok(kind)
            }
            Err(e) => {
                self.report(&TunnelError::Connection(e.to_string()));
                ActionResult::failed(kind, e.to_string())
            }
        }
    }

    fn start_flash(&mut self, manifest_url: Option<String>) -> Result<(), String> {
        let Some(url) = manifest_url.filter(|url| !url.is_empty()) else {
            return Err("manifestUrl is required".into());
        };
        if self.flash.is_some() {
            return Err("flash already in progress".into());
        }
        let Some(mut link) = self.link.take() else {
            return Err("device link unavailable".into());
        };

        let cancel = CancellationToken::new();
        let bus = Arc::clone(&self.bus);
        let topic = self.topic.clone();
        let sink: ProgressSink = Arc::new(move |progress: FlashProgress| {
            bus.publish_envelope(&topic, &Envelope::FlashProgress(progress));
        });
        let orchestrator = self.flasher.clone();
        let token = cancel.clone();
        self.console
            .push_system(LineLevel::Info, format!("Flashing firmware from {url}"));
        let task = tokio::spawn(async move {
            let result = orchestrator.run(&url, &mut link, &token, sink).await;
            (link, result)
        });

        self.flash = Some(FlashRun { cancel, task });
        Ok(())
    }

    fn on_flash_done(&mut self, done: Result<(LinkGuard, FlashDone), JoinError>) {
        self.flash = None;
        let done = match done {
            Ok((link, done)) => {
                self.link = Some(link);
                done
            }
            Err(e) => Err(FlashError::Device(format!("flash task failed: {e}"))),
        };
        let result = match done {
            Ok(FlashOutcome::Complete) => {
                self.console.push_system(LineLevel::Info, "Flash complete");
                ActionResult::ok(ActionKind::Flash)
            }
            Ok(FlashOutcome::Aborted) => ActionResult::failed(ActionKind::Flash, "aborted"),
            Err(e) => {
                let message = e.to_string();
                self.report(&e.into());
                ActionResult::failed(ActionKind::Flash, message)
            }
        };
        self.send_result(result);
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<CloseReason> {
        match command {
            Command::End { reply } => {
                let result = self.end().await;
                let _ = reply.send(result);
                ControlFlow::Break(CloseReason::UserEnded)
            }
        }
    }

    async fn on_tick(&mut self) -> ControlFlow<CloseReason> {
        let connected =
            self.flash.is_some() || self.link.as_ref().is_some_and(LinkGuard::is_open);
        self.publish(&Envelope::Heartbeat(Heartbeat {
            connected,
            ts: now_millis(),
        }));
        if let ControlFlow::Break(reason) = self.refresh_session().await {
            return ControlFlow::Break(reason);
        }
        if !connected {
            self.restore_link().await;
        }
        ControlFlow::Continue(())
    }

    async fn restore_link(&mut self) {
        let restored = if let Some(link) = self.link.as_mut() {
            link.reopen(link.baud()).await
        } else {
            LinkGuard::acquire(Arc::clone(&self.opener), self.config.initial_baud)
                .await
                .map(|link| self.link = Some(link))
        };
        match restored {
            Ok(()) => self
                .console
                .push_system(LineLevel::Info, "Device link restored"),
            Err(e) => tracing::debug!(session = %self.session.id, "Device link still unavailable: {e}"),
        }
    }

    async fn end(&mut self) -> Result<Session, AgentError> {
        self.publish(&Envelope::SessionEnd(SessionEnd {
            reason: CloseReason::UserEnded,
        }));
        let session = self
            .manager
            .close(self.session.id, CloseReason::UserEnded)
            .await?;
        self.session = session.clone();
        Ok(session)
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        if let Some(mut run) = self.flash.take() {
            run.cancel.cancel();
            // the returned guard drops here, releasing the link
            let _ = (&mut run.task).await;
        }
        self.subscription = None;
        self.link = None;
        self.console
            .push_system(LineLevel::Info, format!("Session ended ({reason})"));
        tracing::info!(session = %self.session.id, %reason, "Requester agent stopped");
    }
}
