//! Connection lifecycle and print-job transfer state machine.
//!
//! One spawned task owns the transport, the device registry, the single
//! active connection, and the single pending request. Caller requests arrive
//! through a command mailbox, transport outcomes through the event channel,
//! and both are folded into the state machine on the same task, so no two
//! transitions ever race. [`PrinterHandle`] is the caller-facing side.

use std::mem;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{self, DeliveryMode, PrintJob, CHUNK_SIZE};
use crate::registry::DeviceRegistry;
use crate::transport::{CharacteristicInfo, Device, RadioState, Transport, TransportEvent};
use crate::{PrinterError, Result};

/// Tunable session policies.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long a scan collects advertisements before resolving.
    pub scan_window: Duration,
    /// How long a connect attempt may sit unresolved before failing.
    pub connect_timeout: Duration,
    /// Maximum bytes per transport write.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Why the last connection attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureReason {
    DeviceNotFound,
    ConnectionFailed,
    NoServices,
    CharacteristicNotFound,
}

/// The single live connection. Only exists while the state is
/// `Ready`/`Writing`, so the characteristic handle cannot be used while
/// disconnected.
#[derive(Debug, Clone)]
struct ActiveConnection {
    device: Device,
    write_char: CharacteristicInfo,
}

enum ConnectionState {
    Idle,
    Scanning,
    Connecting { device: Device },
    ServiceDiscovery { device: Device },
    CharacteristicDiscovery { device: Device },
    Ready(ActiveConnection),
    Writing(ActiveConnection),
    Disconnecting,
    Failed(FailureReason),
}

/// Caller requests, each carrying its result sink.
enum Command {
    IsEnabled(oneshot::Sender<bool>),
    HasPermission(oneshot::Sender<bool>),
    Scan(oneshot::Sender<Result<Vec<Device>>>),
    Connect {
        identifier: String,
        done: oneshot::Sender<Result<()>>,
    },
    Status(oneshot::Sender<bool>),
    WriteBytes {
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    PrintText {
        text: String,
        done: oneshot::Sender<Result<()>>,
    },
    Disconnect(oneshot::Sender<Result<bool>>),
}

/// The one in-flight request awaiting a terminal outcome, tagged with a
/// monotonic id so late transport callbacks can be told apart from the
/// current operation.
enum Pending {
    Scan {
        id: u64,
        done: oneshot::Sender<Result<Vec<Device>>>,
    },
    Connect {
        id: u64,
        done: oneshot::Sender<Result<()>>,
    },
    Write {
        id: u64,
        done: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        id: u64,
        done: oneshot::Sender<Result<bool>>,
    },
}

impl Pending {
    fn request_id(&self) -> u64 {
        match self {
            Pending::Scan { id, .. }
            | Pending::Connect { id, .. }
            | Pending::Write { id, .. }
            | Pending::Disconnect { id, .. } => *id,
        }
    }

    /// Deliver a failure outcome, whatever the request kind.
    fn fail(self, err: PrinterError) {
        tracing::debug!(request = self.request_id(), error = %err, "request failed");
        match self {
            Pending::Scan { done, .. } => {
                let _ = done.send(Err(err));
            }
            Pending::Connect { done, .. } => {
                let _ = done.send(Err(err));
            }
            Pending::Write { done, .. } => {
                let _ = done.send(Err(err));
            }
            Pending::Disconnect { done, .. } => {
                let _ = done.send(Err(err));
            }
        }
    }
}

/// Cursor over a print job's frames and chunk offsets.
struct WriteJob {
    request_id: u64,
    frames: Vec<protocol::Frame>,
    frame_idx: usize,
    offset: usize,
    awaiting_ack: bool,
}

impl WriteJob {
    fn new(request_id: u64, job: PrintJob) -> Self {
        Self {
            request_id,
            frames: job.frames,
            frame_idx: 0,
            offset: 0,
            awaiting_ack: false,
        }
    }
}

/// A frame's requested mode, adjusted to what the selected characteristic
/// actually supports.
fn effective_mode(requested: DeliveryMode, write_char: &CharacteristicInfo) -> DeliveryMode {
    match requested {
        DeliveryMode::WithAck if !write_char.write_with_ack => DeliveryMode::FireAndForget,
        DeliveryMode::FireAndForget if !write_char.write_without_ack => DeliveryMode::WithAck,
        mode => mode,
    }
}

/// Prefer write-with-ack, fall back to write-without-ack. The first match
/// wins; no further scanning once one is chosen.
fn select_write_characteristic(
    characteristics: &[CharacteristicInfo],
) -> Option<CharacteristicInfo> {
    characteristics
        .iter()
        .find(|c| c.write_with_ack)
        .or_else(|| characteristics.iter().find(|c| c.write_without_ack))
        .copied()
}

/// Handle to a running printer session. Cheap to clone; all clones talk to
/// the same session task. One request is served at a time; a second one
/// (other than `disconnect`) is rejected with [`PrinterError::Busy`].
#[derive(Clone)]
pub struct PrinterHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PrinterHandle {
    /// Spawn a session task on the current tokio runtime.
    ///
    /// - `transport`: BLE backend (see [`crate::btle::BtleTransport`])
    /// - `events`: event channel handed out by that transport
    /// - `config`: session policies
    pub fn spawn<T: Transport>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: SessionConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = Session {
            transport,
            events,
            commands: commands_rx,
            config,
            registry: DeviceRegistry::new(),
            state: ConnectionState::Idle,
            pending: None,
            job: None,
            deadline: None,
            request_counter: 0,
        };
        tokio::spawn(session.run());
        Self {
            commands: commands_tx,
        }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| PrinterError::SessionClosed)?;
        rx.await.map_err(|_| PrinterError::SessionClosed)
    }

    /// Whether the radio is powered on.
    pub async fn is_bluetooth_enabled(&self) -> Result<bool> {
        self.request(Command::IsEnabled).await
    }

    /// Whether the application is allowed to use the radio at all.
    pub async fn has_bluetooth_permission(&self) -> Result<bool> {
        self.request(Command::HasPermission).await
    }

    /// Scan for peripherals. Suspends for the configured scan window and
    /// resolves with the deduplicated devices observed inside it.
    pub async fn scan_devices(&self) -> Result<Vec<Device>> {
        self.request(Command::Scan).await?
    }

    /// Connect to a device observed in the last scan and resolve its
    /// write-capable characteristic. Resolves once the connection is ready
    /// for printing.
    pub async fn connect(&self, identifier: &str) -> Result<()> {
        let identifier = identifier.to_string();
        self.request(|done| Command::Connect { identifier, done })
            .await?
    }

    /// Whether a connection is currently ready (or mid-write). Pure read;
    /// never triggers a transition.
    pub async fn connection_status(&self) -> Result<bool> {
        self.request(Command::Status).await
    }

    /// Send a raw byte payload to the printer, chunked to the transport's
    /// safe write size.
    pub async fn write_raw_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.request(|done| Command::WriteBytes { bytes, done })
            .await?
    }

    /// Print text, honoring an optional `"<size>///"` prefix (sizes 1-5).
    pub async fn print_formatted_text(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|done| Command::PrintText { text, done })
            .await?
    }

    /// Tear down the active connection. Returns `Ok(false)` when there was
    /// nothing to disconnect. Any request still in flight resolves with
    /// [`PrinterError::Disconnected`] rather than hanging past teardown.
    pub async fn disconnect(&self) -> Result<bool> {
        self.request(Command::Disconnect).await?
    }
}

struct Session<T: Transport> {
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    config: SessionConfig,
    registry: DeviceRegistry,
    state: ConnectionState,
    pending: Option<Pending>,
    job: Option<WriteJob>,
    deadline: Option<Instant>,
    request_counter: u64,
}

enum PumpOutcome {
    AwaitingAck,
    Finished(Result<()>),
}

impl<T: Transport> Session<T> {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = async { tokio::time::sleep_until(deadline.unwrap()).await },
                    if deadline.is_some() => self.handle_deadline().await,
            }
        }
        if let Some(pending) = self.pending.take() {
            pending.fail(PrinterError::SessionClosed);
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_counter += 1;
        self.request_counter
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::IsEnabled(done) => {
                let enabled = self.transport.radio_state().await == RadioState::PoweredOn;
                let _ = done.send(enabled);
            }
            Command::HasPermission(done) => {
                let state = self.transport.radio_state().await;
                let granted = !matches!(state, RadioState::Unauthorized | RadioState::Unsupported);
                let _ = done.send(granted);
            }
            Command::Status(done) => {
                let connected = matches!(
                    self.state,
                    ConnectionState::Ready(_) | ConnectionState::Writing(_)
                );
                let _ = done.send(connected);
            }
            Command::Scan(done) => self.begin_scan(done).await,
            Command::Connect { identifier, done } => self.begin_connect(identifier, done).await,
            Command::WriteBytes { bytes, done } => {
                self.begin_job(protocol::encode_raw_bytes(bytes), done).await
            }
            Command::PrintText { text, done } => {
                self.begin_job(protocol::encode_formatted_text(&text), done)
                    .await
            }
            Command::Disconnect(done) => self.begin_disconnect(done).await,
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisementObserved(device) => {
                if matches!(self.state, ConnectionState::Scanning) {
                    self.registry.observe(device);
                }
            }
            TransportEvent::Connected { identifier } => self.on_connected(identifier).await,
            TransportEvent::ConnectFailed { identifier, reason } => {
                self.on_connect_failed(identifier, reason).await
            }
            TransportEvent::ServicesDiscovered { services } => self.on_services(services).await,
            TransportEvent::ServiceDiscoveryFailed { reason } => {
                if matches!(self.state, ConnectionState::ServiceDiscovery { .. }) {
                    tracing::warn!(reason = %reason, "service discovery failed");
                    self.fail_attempt(FailureReason::NoServices, PrinterError::NoServices)
                        .await;
                }
            }
            TransportEvent::CharacteristicsDiscovered { characteristics } => {
                self.on_characteristics(characteristics).await
            }
            TransportEvent::WriteCompleted { outcome } => self.on_write_completed(outcome).await,
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
        }
    }

    // ---- caller requests -------------------------------------------------

    async fn begin_scan(&mut self, done: oneshot::Sender<Result<Vec<Device>>>) {
        if self.pending.is_some()
            || !matches!(
                self.state,
                ConnectionState::Idle | ConnectionState::Failed(_)
            )
        {
            let _ = done.send(Err(PrinterError::Busy));
            return;
        }
        let radio = self.transport.radio_state().await;
        if radio != RadioState::PoweredOn {
            // "could not scan" is distinct from "found nothing"
            let _ = done.send(Err(PrinterError::BluetoothUnavailable(radio)));
            return;
        }
        self.registry.clear();
        if let Err(err) = self.transport.start_scan().await {
            let _ = done.send(Err(err));
            return;
        }
        let id = self.next_request_id();
        tracing::info!(request = id, window = ?self.config.scan_window, "scan started");
        self.pending = Some(Pending::Scan { id, done });
        self.state = ConnectionState::Scanning;
        self.deadline = Some(Instant::now() + self.config.scan_window);
    }

    async fn begin_connect(&mut self, identifier: String, done: oneshot::Sender<Result<()>>) {
        if self.pending.is_some() {
            let _ = done.send(Err(PrinterError::Busy));
            return;
        }
        match self.state {
            ConnectionState::Idle | ConnectionState::Failed(_) => {}
            ConnectionState::Ready(_) | ConnectionState::Writing(_) => {
                let _ = done.send(Err(PrinterError::InvalidArguments(
                    "already connected; disconnect first".into(),
                )));
                return;
            }
            _ => {
                let _ = done.send(Err(PrinterError::Busy));
                return;
            }
        }
        // Identifier resolution never touches the radio.
        let Some(device) = self.registry.resolve(&identifier).cloned() else {
            self.state = ConnectionState::Failed(FailureReason::DeviceNotFound);
            let _ = done.send(Err(PrinterError::DeviceNotFound(identifier)));
            return;
        };
        if let Err(err) = self.transport.connect(&device.identifier).await {
            self.state = ConnectionState::Failed(FailureReason::ConnectionFailed);
            let _ = done.send(Err(err));
            return;
        }
        let id = self.next_request_id();
        tracing::info!(request = id, identifier = %device.identifier, "connecting");
        self.pending = Some(Pending::Connect { id, done });
        self.state = ConnectionState::Connecting { device };
        self.deadline = Some(Instant::now() + self.config.connect_timeout);
    }

    async fn begin_job(&mut self, job: PrintJob, done: oneshot::Sender<Result<()>>) {
        if self.pending.is_some() {
            let _ = done.send(Err(PrinterError::Busy));
            return;
        }
        let state = mem::replace(&mut self.state, ConnectionState::Idle);
        let conn = match state {
            ConnectionState::Ready(conn) => conn,
            other => {
                self.state = other;
                let _ = done.send(Err(PrinterError::Disconnected));
                return;
            }
        };
        let id = self.next_request_id();
        tracing::debug!(request = id, frames = job.frames.len(), "print job started");
        self.pending = Some(Pending::Write { id, done });
        self.job = Some(WriteJob::new(id, job));
        self.state = ConnectionState::Writing(conn);
        self.pump_job().await;
    }

    async fn begin_disconnect(&mut self, done: oneshot::Sender<Result<bool>>) {
        // The one request allowed to preempt: whatever is still in flight
        // resolves now instead of hanging past teardown.
        if let Some(pending) = self.pending.take() {
            pending.fail(PrinterError::Disconnected);
        }
        self.job = None;
        self.deadline = None;
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::Idle
            | ConnectionState::Failed(_)
            | ConnectionState::Disconnecting => {
                let _ = done.send(Ok(false));
            }
            ConnectionState::Scanning => {
                let _ = self.transport.stop_scan().await;
                let _ = done.send(Ok(false));
            }
            _ => {
                let id = self.next_request_id();
                tracing::info!(request = id, "disconnecting");
                self.state = ConnectionState::Disconnecting;
                if let Err(err) = self.transport.disconnect().await {
                    tracing::warn!(error = %err, "disconnect request failed");
                    self.state = ConnectionState::Idle;
                    let _ = done.send(Ok(true));
                    return;
                }
                self.pending = Some(Pending::Disconnect { id, done });
            }
        }
    }

    // ---- transport events ------------------------------------------------

    async fn on_connected(&mut self, identifier: String) {
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::Connecting { device } if device.identifier == identifier => {
                self.deadline = None;
                tracing::info!(identifier = %identifier, "connected; discovering services");
                self.state = ConnectionState::ServiceDiscovery { device };
                if let Err(err) = self.transport.discover_services().await {
                    self.fail_attempt(FailureReason::NoServices, err).await;
                }
            }
            other => {
                tracing::debug!(identifier = %identifier, "ignoring stale connect event");
                self.state = other;
            }
        }
    }

    async fn on_connect_failed(&mut self, identifier: String, reason: String) {
        if matches!(&self.state, ConnectionState::Connecting { device } if device.identifier == identifier)
        {
            self.fail_attempt(
                FailureReason::ConnectionFailed,
                PrinterError::ConnectionFailed(reason),
            )
            .await;
        }
    }

    async fn on_services(&mut self, services: Vec<Uuid>) {
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::ServiceDiscovery { device } => {
                if services.is_empty() {
                    self.fail_attempt(FailureReason::NoServices, PrinterError::NoServices)
                        .await;
                    return;
                }
                tracing::debug!(count = services.len(), "services discovered");
                self.state = ConnectionState::CharacteristicDiscovery { device };
                if let Err(err) = self.transport.discover_characteristics(&services).await {
                    self.fail_attempt(FailureReason::NoServices, err).await;
                }
            }
            other => self.state = other,
        }
    }

    async fn on_characteristics(&mut self, characteristics: Vec<CharacteristicInfo>) {
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::CharacteristicDiscovery { device } => {
                match select_write_characteristic(&characteristics) {
                    Some(write_char) => {
                        tracing::info!(
                            characteristic = %write_char.uuid,
                            with_ack = write_char.write_with_ack,
                            "write characteristic selected; ready"
                        );
                        self.deadline = None;
                        self.state = ConnectionState::Ready(ActiveConnection { device, write_char });
                        match self.pending.take() {
                            Some(Pending::Connect { id, done }) => {
                                tracing::debug!(request = id, "connect resolved");
                                let _ = done.send(Ok(()));
                            }
                            other => self.pending = other,
                        }
                    }
                    None => {
                        self.fail_attempt(
                            FailureReason::CharacteristicNotFound,
                            PrinterError::CharacteristicNotFound,
                        )
                        .await;
                    }
                }
            }
            other => self.state = other,
        }
    }

    async fn on_write_completed(&mut self, outcome: std::result::Result<(), String>) {
        let awaiting = self.job.as_ref().is_some_and(|j| j.awaiting_ack);
        if !matches!(self.state, ConnectionState::Writing(_)) || !awaiting {
            // late confirmation from an already-resolved operation
            tracing::debug!("ignoring stale write confirmation");
            return;
        }
        match outcome {
            Ok(()) => {
                if let Some(job) = self.job.as_mut() {
                    job.awaiting_ack = false;
                }
                self.pump_job().await;
            }
            Err(reason) => self.finish_job(Err(PrinterError::WriteFailed(reason))),
        }
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        match mem::replace(&mut self.state, ConnectionState::Idle) {
            ConnectionState::Disconnecting => {
                tracing::info!("disconnected");
                match self.pending.take() {
                    Some(Pending::Disconnect { id, done }) => {
                        tracing::debug!(request = id, "disconnect resolved");
                        let _ = done.send(Ok(true));
                    }
                    other => self.pending = other,
                }
            }
            ConnectionState::Connecting { .. }
            | ConnectionState::ServiceDiscovery { .. }
            | ConnectionState::CharacteristicDiscovery { .. }
            | ConnectionState::Ready(_)
            | ConnectionState::Writing(_) => {
                tracing::warn!(?reason, "peripheral disconnected");
                self.job = None;
                self.deadline = None;
                if let Some(pending) = self.pending.take() {
                    pending.fail(PrinterError::Disconnected);
                }
            }
            other => {
                // stale notification from an already-resolved teardown
                self.state = other;
            }
        }
    }

    async fn handle_deadline(&mut self) {
        self.deadline = None;
        match self.state {
            ConnectionState::Scanning => {
                let _ = self.transport.stop_scan().await;
                let devices = self.registry.snapshot();
                tracing::info!(count = devices.len(), "scan window closed");
                self.state = ConnectionState::Idle;
                match self.pending.take() {
                    Some(Pending::Scan { id, done }) => {
                        tracing::debug!(request = id, "scan resolved");
                        let _ = done.send(Ok(devices));
                    }
                    other => self.pending = other,
                }
            }
            ConnectionState::Connecting { .. } => {
                self.fail_attempt(
                    FailureReason::ConnectionFailed,
                    PrinterError::ConnectionFailed("timed out".into()),
                )
                .await;
            }
            _ => {}
        }
    }

    // ---- helpers ---------------------------------------------------------

    /// Terminal failure for the current connection attempt. The caller must
    /// re-issue `connect`.
    async fn fail_attempt(&mut self, reason: FailureReason, err: PrinterError) {
        tracing::warn!(?reason, error = %err, "connection attempt failed");
        self.deadline = None;
        self.job = None;
        self.state = ConnectionState::Failed(reason);
        // best-effort cleanup of a half-open link
        let _ = self.transport.disconnect().await;
        if let Some(pending) = self.pending.take() {
            pending.fail(err);
        }
    }

    /// Push chunks at the transport until the job finishes, fails, or blocks
    /// on a write confirmation. Chunks within a frame, and frames within a
    /// job, go out strictly in sequence; an acknowledged chunk is not
    /// followed by the next until its confirmation arrives.
    async fn pump_job(&mut self) {
        let outcome = loop {
            let ConnectionState::Writing(conn) = &self.state else {
                return;
            };
            let write_char = conn.write_char;
            let Some(job) = self.job.as_mut() else { return };
            if job.awaiting_ack {
                break PumpOutcome::AwaitingAck;
            }
            let Some(frame) = job.frames.get(job.frame_idx) else {
                break PumpOutcome::Finished(Ok(()));
            };
            if frame.payload.is_empty() {
                job.frame_idx += 1;
                job.offset = 0;
                continue;
            }
            let end = (job.offset + self.config.chunk_size).min(frame.payload.len());
            let chunk = frame.payload[job.offset..end].to_vec();
            let mode = effective_mode(frame.mode, &write_char);
            tracing::trace!(
                request = job.request_id,
                frame = job.frame_idx,
                offset = job.offset,
                len = chunk.len(),
                ?mode,
                "writing chunk"
            );
            if end == frame.payload.len() {
                job.frame_idx += 1;
                job.offset = 0;
            } else {
                job.offset = end;
            }
            if mode == DeliveryMode::WithAck {
                job.awaiting_ack = true;
            }
            match self.transport.write(write_char.uuid, &chunk, mode).await {
                Ok(()) if mode == DeliveryMode::WithAck => break PumpOutcome::AwaitingAck,
                Ok(()) => {}
                Err(err) => break PumpOutcome::Finished(Err(err)),
            }
        };
        match outcome {
            PumpOutcome::AwaitingAck => {}
            PumpOutcome::Finished(result) => self.finish_job(result),
        }
    }

    /// Resolve the write request. A failed write does not tear down the
    /// connection; the state returns to `Ready` so the caller can retry.
    fn finish_job(&mut self, result: Result<()>) {
        self.job = None;
        if let ConnectionState::Writing(_) = self.state {
            let state = mem::replace(&mut self.state, ConnectionState::Idle);
            if let ConnectionState::Writing(conn) = state {
                self.state = ConnectionState::Ready(conn);
            }
        }
        match self.pending.take() {
            Some(Pending::Write { id, done }) => {
                tracing::debug!(request = id, ok = result.is_ok(), "write resolved");
                let _ = done.send(result);
            }
            other => self.pending = other,
        }
    }
}
