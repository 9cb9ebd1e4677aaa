use std::collections::VecDeque;
use std::future::{self, Future};
use std::io;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use nightfall_core::{
    decode_inbound, CommandRecord, FrameKind, HazardAlert, InboundFrame, StatusReport,
    TelemetryFragment, TelemetrySnapshot, UiCommand,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::overlay::OptimisticOverlay;
use crate::reconciler::TelemetryReconciler;
use crate::stats::{ConnectionStats, RateSampler};
use crate::supervisor::{ConnectionSupervisor, Directive, LinkErrorCode, LinkStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, WsError>> + Send>>;

/// Immutable picture of the link handed to presentation after every batch of
/// mutations.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LinkView {
    pub status: LinkStatus,
    pub telemetry: TelemetrySnapshot,
    pub stats: ConnectionStats,
    pub predicted_autonomous: Option<bool>,
    pub revision: u64,
}

impl LinkView {
    /// The prediction when one is held, else the confirmed value.
    pub fn effective_autonomous(&self) -> bool {
        self.predicted_autonomous
            .unwrap_or(self.telemetry.state.autonomous)
    }

    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    pub fn is_emergency(&self) -> bool {
        self.telemetry.state.is_emergency()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StatusChanged { from: LinkStatus, to: LinkStatus },
    TelemetryUpdated { revision: u64 },
    DeviceStatus { report: StatusReport, ts: Option<f64> },
    Hazard { alert: HazardAlert, ts: Option<f64> },
    CommandDropped { record: CommandRecord, error: DispatchError },
    PredictionReconciled { value: bool },
    PredictionExpired { predicted: bool, confirmed: bool },
}

#[derive(Debug)]
enum LinkCommand {
    Connect,
    Send(CommandRecord),
    Predict(bool),
    Shutdown,
}

/// Fire-and-forget entry points into a running link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkCommander {
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkCommander {
    pub fn connect(&self) {
        self.try_send(LinkCommand::Connect);
    }

    /// Sends `{type: command_type, ...payload}`.
    pub fn send(&self, command_type: &str, payload: Map<String, Value>) {
        self.try_send(LinkCommand::Send(CommandRecord::new(command_type, payload)));
    }

    /// Sends `{type: "ui_cmd", cmd, ...payload}`.
    pub fn send_ui_cmd(&self, cmd: &str, payload: Map<String, Value>) {
        self.try_send(LinkCommand::Send(CommandRecord::ui_cmd(cmd, payload)));
    }

    pub fn send_command(&self, command: &UiCommand) {
        self.send_ui_cmd(command.name(), command.payload());
    }

    pub fn set_prediction(&self, autonomous: bool) {
        self.try_send(LinkCommand::Predict(autonomous));
    }

    fn try_send(&self, command: LinkCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!("link_command_queue_full: {command:?}");
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                warn!("link_closed: {command:?}");
            }
        }
    }
}

/// Owner-side handle of a spawned link.
#[derive(Debug)]
pub struct LinkHandle {
    commander: LinkCommander,
    view: watch::Receiver<LinkView>,
    events: broadcast::Sender<LinkEvent>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn connect(&self) {
        self.commander.connect();
    }

    pub fn send(&self, command_type: &str, payload: Map<String, Value>) {
        self.commander.send(command_type, payload);
    }

    pub fn send_ui_cmd(&self, cmd: &str, payload: Map<String, Value>) {
        self.commander.send_ui_cmd(cmd, payload);
    }

    pub fn send_command(&self, command: &UiCommand) {
        self.commander.send_command(command);
    }

    pub fn set_prediction(&self, autonomous: bool) {
        self.commander.set_prediction(autonomous);
    }

    pub fn view(&self) -> LinkView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LinkView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn commander(&self) -> LinkCommander {
        self.commander.clone()
    }

    /// Cancels any pending reconnect, closes the socket and waits for the
    /// task to finish.
    pub async fn dispose(self) {
        if self.commander.commands.send(LinkCommand::Shutdown).await.is_err() {
            debug!("link_dispose: task already stopped");
        }
        if let Err(err) = self.task.await {
            warn!("link_task_join_error: {err}");
        }
    }
}

struct Transport {
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    reconnect_at: Option<Instant>,
}

enum Wake {
    Command(Option<LinkCommand>),
    Opened(Result<WsStream, WsError>),
    Frame(Option<Result<Message, WsError>>),
    ReconnectDue,
    RateTick,
    PredictionDeadline,
}

/// The link actor. All state lives here and is touched only by its own task.
pub struct TelemetryLink {
    url: Url,
    max_frame_bytes: usize,
    connect_timeout: Duration,
    supervisor: ConnectionSupervisor,
    reconciler: TelemetryReconciler,
    sampler: RateSampler,
    dispatcher: CommandDispatcher,
    overlay: OptimisticOverlay,
    transport: Transport,
    commands: mpsc::Receiver<LinkCommand>,
    view: watch::Sender<LinkView>,
    events: broadcast::Sender<LinkEvent>,
}

impl TelemetryLink {
    /// Starts the link task on the current tokio runtime. The link stays
    /// idle until [`LinkHandle::connect`] is called.
    pub fn spawn(config: LinkConfig) -> LinkHandle {
        let (link, commander, view) = Self::new(config);
        let events = link.events.clone();
        let task = tokio::spawn(link.run());

        LinkHandle {
            commander,
            view,
            events,
            task,
        }
    }

    fn new(config: LinkConfig) -> (Self, LinkCommander, watch::Receiver<LinkView>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(LinkView::default());
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let link = TelemetryLink {
            url: config.url,
            max_frame_bytes: config.max_frame_bytes,
            connect_timeout: config.connect_timeout,
            supervisor: ConnectionSupervisor::new(config.reconnect),
            reconciler: TelemetryReconciler::new(),
            sampler: RateSampler::new(config.rate_window, Instant::now().into_std()),
            dispatcher: CommandDispatcher::new(config.max_frame_bytes),
            overlay: OptimisticOverlay::new(config.prediction_timeout),
            transport: Transport {
                socket: None,
                connecting: None,
                reconnect_at: None,
            },
            commands: command_rx,
            view: view_tx,
            events: event_tx,
        };
        let commander = LinkCommander {
            commands: command_tx,
        };
        (link, commander, view_rx)
    }

    async fn run(mut self) {
        let mut rate_ticker = self.rate_ticker();

        loop {
            let prediction_deadline = self.overlay.deadline().map(Instant::from_std);
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                opened = next_open(&mut self.transport.connecting) => Wake::Opened(opened),
                frame = next_frame(&mut self.transport.socket) => Wake::Frame(frame),
                _ = sleep_until(self.transport.reconnect_at) => Wake::ReconnectDue,
                _ = rate_ticker.tick() => Wake::RateTick,
                _ = sleep_until(prediction_deadline) => Wake::PredictionDeadline,
            };

            let keep_running = match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => false,
                Wake::Opened(result) => {
                    self.transport.connecting = None;
                    self.handle_open(result).await;
                    true
                }
                Wake::Frame(frame) => {
                    self.handle_frame(frame).await;
                    true
                }
                Wake::ReconnectDue => {
                    self.transport.reconnect_at = None;
                    let directives = self.supervisor.on_reconnect_due();
                    self.apply(directives).await;
                    true
                }
                Wake::RateTick => {
                    self.sample_rate();
                    true
                }
                Wake::PredictionDeadline => {
                    self.expire_prediction();
                    true
                }
            };

            if !keep_running {
                let directives = self.supervisor.shutdown();
                self.apply(directives).await;
                self.publish();
                info!(url = %self.url, "link_disposed");
                return;
            }
            self.publish();
        }
    }

    fn rate_ticker(&self) -> time::Interval {
        let window = self.sampler.window().max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Closes the rate window at the moment the tick is handled. A busy loop
    /// handles ticks after their scheduled deadline.
    fn sample_rate(&mut self) {
        if let Some(rate) = self.sampler.sample(Instant::now().into_std()) {
            self.supervisor.record_rate(rate);
        }
    }

    async fn handle_command(&mut self, command: LinkCommand) -> bool {
        match command {
            LinkCommand::Connect => {
                let directives = self.supervisor.connect();
                self.apply(directives).await;
            }
            LinkCommand::Send(record) => self.dispatch(record).await,
            LinkCommand::Predict(value) => {
                self.overlay.set_prediction(value, Instant::now().into_std());
                let confirmed = self.reconciler.snapshot().state.autonomous;
                if self.overlay.reconcile(confirmed) {
                    self.emit(LinkEvent::PredictionReconciled { value: confirmed });
                }
            }
            LinkCommand::Shutdown => return false,
        }
        true
    }

    /// Executes supervisor directives, feeding close outcomes straight back.
    /// The resulting status changes are emitted before anything else.
    async fn apply(&mut self, directives: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = directives.into();
        while let Some(directive) = queue.pop_front() {
            match directive {
                Directive::Open => {
                    info!(url = %self.url, "link_connect_attempt");
                    let url = self.url.clone();
                    let limit = self.connect_timeout;
                    self.transport.connecting = Some(Box::pin(async move {
                        match time::timeout(limit, connect_async(url)).await {
                            Ok(result) => result.map(|(ws, _)| ws),
                            Err(_) => Err(WsError::Io(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("connect timed out after {}ms", limit.as_millis()),
                            ))),
                        }
                    }));
                }
                Directive::Close => {
                    self.transport.connecting = None;
                    if let Some(mut ws) = self.transport.socket.take() {
                        if let Err(err) = ws.close(None).await {
                            debug!("link_close_error: {err}");
                        }
                    }
                    queue.extend(self.supervisor.on_close());
                }
                Directive::ScheduleReconnect(delay) => {
                    info!(delay_ms = delay.as_millis() as u64, "link_reconnect_scheduled");
                    self.transport.reconnect_at = Some(Instant::now() + delay);
                }
                Directive::CancelReconnect => {
                    self.transport.reconnect_at = None;
                }
            }
        }
        self.emit_transitions();
    }

    async fn handle_open(&mut self, result: Result<WsStream, WsError>) {
        match result {
            Ok(ws) => {
                self.transport.socket = Some(ws);
                let directives = self.supervisor.on_open(Utc::now());
                self.apply(directives).await;
            }
            Err(err) => {
                warn!("link_connect_error: {err}");
                let directives = self.supervisor.on_error(LinkErrorCode::ConnectFailed);
                self.apply(directives).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.ingest(&text),
            Some(Ok(Message::Close(frame))) => {
                info!("link_closed_by_peer: {frame:?}");
                self.apply(vec![Directive::Close]).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                debug!(len = bytes.len(), "binary_frame_ignored");
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!("link_transport_error: {err}");
                let directives = self.supervisor.on_error(LinkErrorCode::TransportFailed);
                self.apply(directives).await;
            }
            None => {
                warn!("link_stream_ended");
                let directives = self.supervisor.on_error(LinkErrorCode::TransportFailed);
                self.apply(directives).await;
            }
        }
    }

    fn ingest(&mut self, text: &str) {
        self.sampler.record();
        let received_at = Utc::now();
        let frame = match decode_inbound(text, self.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("frame_decode_error: {err}");
                self.supervisor.record_malformed();
                return;
            }
        };
        self.supervisor.record_frame(received_at);

        match &frame.kind {
            FrameKind::Telemetry => self.apply_telemetry(&frame, received_at),
            FrameKind::Status => match frame.decode_body::<StatusReport>() {
                Ok(report) => {
                    info!(role = %report.role, status = %report.status, "device_status");
                    self.emit(LinkEvent::DeviceStatus {
                        report,
                        ts: frame.ts,
                    });
                }
                Err(err) => {
                    warn!("frame_decode_error: status: {err}");
                    self.supervisor.record_malformed();
                }
            },
            FrameKind::HazardAlert => match frame.decode_body::<HazardAlert>() {
                Ok(alert) => {
                    warn!(
                        hazard = %alert.hazard,
                        critical = alert.critical,
                        "device_hazard: {}",
                        alert.msg
                    );
                    self.emit(LinkEvent::Hazard {
                        alert,
                        ts: frame.ts,
                    });
                }
                Err(err) => {
                    warn!("frame_decode_error: hazard_alert: {err}");
                    self.supervisor.record_malformed();
                }
            },
            FrameKind::Ping | FrameKind::Ack | FrameKind::Other(_) => {
                debug!(kind = %frame.kind, "frame_not_merged");
            }
        }
    }

    fn apply_telemetry(&mut self, frame: &InboundFrame, received_at: chrono::DateTime<Utc>) {
        if let Some(ts) = frame.ts {
            let latency_ms = received_at.timestamp_millis() - ts as i64;
            debug!(latency_ms, "telemetry_latency");
            self.supervisor.record_latency(latency_ms);
        }

        let parsed = TelemetryFragment::from_body(&frame.body);
        if !parsed.errors.is_empty() {
            for err in &parsed.errors {
                warn!("telemetry_section_rejected: {err}");
            }
            self.supervisor.record_rejected_sections(parsed.errors.len());
        }
        if !self.reconciler.apply_fragment(parsed.fragment, received_at) {
            return;
        }
        self.emit(LinkEvent::TelemetryUpdated {
            revision: self.reconciler.revision(),
        });
        let confirmed = self.reconciler.snapshot().state.autonomous;
        if self.overlay.reconcile(confirmed) {
            self.emit(LinkEvent::PredictionReconciled { value: confirmed });
        }
    }

    async fn dispatch(&mut self, record: CommandRecord) {
        let frame = match self.dispatcher.prepare(self.supervisor.status(), &record) {
            Ok(frame) => frame,
            Err(error) => {
                self.emit(LinkEvent::CommandDropped { record, error });
                return;
            }
        };
        let Some(ws) = self.transport.socket.as_mut() else {
            self.dispatcher.mark_dropped();
            let error = DispatchError::NotConnected(self.supervisor.status());
            self.emit(LinkEvent::CommandDropped { record, error });
            return;
        };
        let written = ws.send(Message::Text(frame)).await;
        match written {
            Ok(()) => {
                self.dispatcher.mark_sent();
                debug!(
                    command_type = record.command_type(),
                    cmd = record.cmd().unwrap_or_default(),
                    "command_sent"
                );
            }
            Err(err) => {
                warn!("command_send_error: {err}");
                self.dispatcher.mark_dropped();
                let directives = self.supervisor.on_error(LinkErrorCode::TransportFailed);
                self.apply(directives).await;
                let error = DispatchError::NotConnected(self.supervisor.status());
                self.emit(LinkEvent::CommandDropped { record, error });
            }
        }
    }

    fn expire_prediction(&mut self) {
        let confirmed = self.reconciler.snapshot().state.autonomous;
        if let Some(predicted) = self.overlay.expire(Instant::now().into_std()) {
            warn!(predicted, confirmed, "prediction_expired");
            self.emit(LinkEvent::PredictionExpired {
                predicted,
                confirmed,
            });
        }
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine; the view still carries the state.
        let _ = self.events.send(event);
    }

    fn emit_transitions(&mut self) {
        for (from, to) in self.supervisor.take_transitions() {
            self.emit(LinkEvent::StatusChanged { from, to });
        }
    }

    fn publish(&mut self) {
        self.emit_transitions();
        let dispatch = self.dispatcher.stats();
        let mut stats = self.supervisor.stats().clone();
        stats.commands_sent = dispatch.sent;
        stats.commands_dropped = dispatch.dropped;
        self.view.send_replace(LinkView {
            status: self.supervisor.status(),
            telemetry: self.reconciler.snapshot().clone(),
            stats,
            predicted_autonomous: self.overlay.predicted(),
            revision: self.reconciler.revision(),
        });
    }
}

async fn next_open(connecting: &mut Option<ConnectFuture>) -> Result<WsStream, WsError> {
    match connecting {
        Some(pending) => pending.as_mut().await,
        None => future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
