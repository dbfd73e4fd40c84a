//! Persistent shell sessions.
//!
//! A [`PersistentSession`] owns one long-lived shell channel on a pooled
//! transport. All channel I/O happens in a single worker task; callers talk to
//! it through an unbounded request queue and get their result back on a
//! oneshot channel.
//!
//! # Lifecycle
//!
//! `Created -> Initializing -> Active -> Closing -> Closed`
//!
//! - Initialization opens the shell. In normal mode it disables terminal echo
//!   and the prompts, then waits for a framed readiness probe.
//! - The session leaves `Active` on an explicit close, on the idle timeout, or
//!   when the channel goes away. It never comes back.
//! - On the way out every queued and in-flight request fails with a
//!   "session closed" error and exactly one [`SessionEvent`] is emitted.
//!
//! # Execution
//!
//! Requests run strictly one at a time in submission order. Normal-mode
//! commands are wrapped by the [`CommandFramer`]; raw-mode commands are
//! written as typed and answered with whatever the shell printed during the
//! settle window. When a framed command times out in an interactive session
//! the worker sends an interrupt (`^C`) before moving on to the next request.
//! In a background session the command is left running and its output keeps
//! flowing into the line buffer.
//!
//! # Timers
//!
//! - Keepalive: a bare newline after `keepalive_interval` without channel
//!   traffic, only while nothing is queued or running. A zero interval
//!   disables it.
//! - Idle timeout: no submitted command for `idle_timeout` closes the session.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{resolve_keepalive_interval, resolve_raw_settle, resolve_ready_timeout};
use super::error::{SshError, SshResult};
use super::framer::{CommandFramer, FrameParser, MAX_CAPTURE_BYTES, generate_nonce};
use super::output::OutputRing;
use super::transport::{ChannelEvent, ChannelReader, ChannelWriter, TargetSpec, Transport};
use super::types::{CommandResult, SessionInfo, SessionMode, SessionType};

/// Disables echo and prompts so the stream only carries command output.
const SHELL_PREP: &str = "stty -echo 2>/dev/null; PS1=''; PS2=''\n";

/// Command used to confirm the shell is reading input.
const READY_PROBE: &str = "true";

/// Interrupt character (Ctrl-C).
const INTERRUPT: &[u8] = b"\x03";

/// Bound on closing our side of the channel during shutdown.
const CHANNEL_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Timer period used when keepalive is disabled; the tick arm stays off.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(1);

pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Initializing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Timer and protocol settings of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    /// How long raw-mode writes collect output before answering
    pub raw_settle: Duration,
    /// Bound on shell startup and the readiness probe
    pub ready_timeout: Duration,
    /// Send `^C` to the shell when a framed command times out. Background
    /// sessions never interrupt; their commands keep running.
    pub interrupt_on_timeout: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            raw_settle: Duration::from_millis(1000),
            ready_timeout: Duration::from_secs(15),
            interrupt_on_timeout: true,
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        Self {
            keepalive_interval: resolve_keepalive_interval(None),
            raw_settle: resolve_raw_settle(None),
            ready_timeout: resolve_ready_timeout(None),
            ..Self::default()
        }
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub target: TargetSpec,
    pub session_type: SessionType,
    pub mode: SessionMode,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// Closed on request or because the channel went away
    Closed,
    /// Closed by the idle timeout
    TimedOut,
    /// Closed after a channel error
    Failed(String),
}

/// Terminal notification of a session; emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: String,
    /// Nonce of the session instance, distinguishing reuses of one id
    pub instance: String,
    pub kind: SessionEventKind,
}

struct CommandRequest {
    command: String,
    raw: bool,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<SshResult<CommandResult>>,
}

pub struct PersistentSession {
    id: String,
    nonce: String,
    mode: SessionMode,
    raw_settle: Duration,
    info: Mutex<SessionInfo>,
    requests: mpsc::UnboundedSender<CommandRequest>,
    output: Arc<Mutex<OutputRing>>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl fmt::Debug for PersistentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl PersistentSession {
    /// Open the shell on `transport`, prepare it and start the worker.
    ///
    /// The terminal event is sent on `events` when the session ends. A
    /// session that fails to start emits nothing.
    pub async fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> SshResult<Arc<Self>> {
        let SessionConfig {
            session_id,
            target,
            session_type,
            mode,
            settings,
        } = config;
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let nonce = generate_nonce();
        let mut framer = CommandFramer::new(nonce.clone());

        state_tx.send_replace(SessionState::Initializing);
        info!(
            "Starting {} session {} ({} mode) on {}@{}:{}",
            session_type, session_id, mode, target.username, target.host, target.port
        );

        let echo = mode == SessionMode::Raw;
        let pair = tokio::time::timeout(settings.ready_timeout, transport.open_shell(echo))
            .await
            .map_err(|_| {
                SshError::timeout(format!(
                    "Opening a shell for session '{}' timed out after {:?}",
                    session_id, settings.ready_timeout
                ))
            })??;
        let writer = pair.writer;
        let mut reader = pair.reader;

        if mode == SessionMode::Normal
            && let Err(e) = prepare_shell(
                &mut framer,
                writer.as_ref(),
                reader.as_mut(),
                settings.ready_timeout,
            )
            .await
        {
            error!("Session {} failed to initialize: {}", session_id, e);
            let _ = tokio::time::timeout(CHANNEL_CLOSE_WAIT, writer.close()).await;
            return Err(e);
        }

        let now = Utc::now().to_rfc3339();
        let info = SessionInfo {
            session_id: session_id.clone(),
            target: target.host.clone(),
            username: target.username.clone(),
            port: target.port,
            session_type,
            mode,
            created_at: now.clone(),
            last_activity: now,
            command_history: Vec::new(),
            is_active: true,
        };

        let output = Arc::new(Mutex::new(OutputRing::new(Some(nonce.clone()))));
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        state_tx.send_replace(SessionState::Active);
        let worker = SessionWorker {
            session_id: session_id.clone(),
            nonce: nonce.clone(),
            writer,
            reader,
            framer,
            requests: requests_rx,
            queue: VecDeque::new(),
            in_flight: None,
            output: (session_type == SessionType::Background).then(|| output.clone()),
            interrupt_on_timeout: settings.interrupt_on_timeout
                && session_type == SessionType::Interactive,
            idle_deadline: Instant::now() + settings.idle_timeout,
            settings: settings.clone(),
            state: state_tx,
            cancel: cancel.clone(),
            events,
        };
        tokio::spawn(worker.run());

        info!("Session {} is active", session_id);
        Ok(Arc::new(Self {
            id: session_id,
            nonce,
            mode,
            raw_settle: settings.raw_settle,
            info: Mutex::new(info),
            requests: requests_tx,
            output,
            state: state_rx,
            cancel,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Run `command` in the shell.
    ///
    /// `raw` overrides the session mode for this call. The wait is bounded by
    /// `timeout` (plus the settle delay for raw writes).
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
        raw: Option<bool>,
    ) -> SshResult<CommandResult> {
        if !self.is_active() {
            return Err(SshError::session_inactive(&self.id));
        }
        let raw = raw.unwrap_or(self.mode == SessionMode::Raw);

        {
            let mut info = self.info.lock().await;
            info.command_history.push(command.to_string());
            info.last_activity = Utc::now().to_rfc3339();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommandRequest {
            command: command.to_string(),
            raw,
            timeout,
            deadline: Instant::now() + timeout,
            reply: reply_tx,
        };
        self.requests
            .send(request)
            .map_err(|_| SshError::session_closed(&self.id))?;

        let wait = if raw {
            timeout + self.raw_settle
        } else {
            timeout
        };
        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SshError::session_closed(&self.id)),
            Err(_) => Err(command_timeout(timeout)),
        }
    }

    /// Most recent buffered lines of a background session. Interactive
    /// sessions do not buffer and always return nothing.
    pub async fn get_buffered_output(&self, max_lines: Option<usize>, clear: bool) -> Vec<String> {
        self.output.lock().await.snapshot(max_lines, clear)
    }

    /// Metadata snapshot.
    pub async fn info(&self) -> SessionInfo {
        let mut info = self.info.lock().await.clone();
        info.is_active = self.is_active();
        info
    }

    /// Ask the worker to stop. Returns immediately; see [`Self::wait_closed`].
    pub fn close(&self) {
        debug!("Close requested for session {}", self.id);
        self.cancel.cancel();
    }

    /// Wait until the worker has finished shutting down.
    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        // An error means the worker is gone, which is closed as well
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

fn command_timeout(timeout: Duration) -> SshError {
    SshError::timeout(format!(
        "Command timed out after {}ms",
        timeout.as_millis()
    ))
}

/// Switch off echo and prompts, then wait for a framed probe to complete.
async fn prepare_shell(
    framer: &mut CommandFramer,
    writer: &dyn ChannelWriter,
    reader: &mut dyn ChannelReader,
    ready_timeout: Duration,
) -> SshResult<()> {
    let probe = framer.frame(READY_PROBE);
    let mut parser = probe.parser;

    writer.write(SHELL_PREP.as_bytes()).await?;
    writer.write(probe.payload.as_bytes()).await?;

    let wait_ready = async {
        loop {
            match reader.next_event().await {
                Some(ChannelEvent::Stdout(data)) | Some(ChannelEvent::Stderr(data)) => {
                    if parser.feed(&data).is_some() {
                        return Ok(());
                    }
                }
                Some(ChannelEvent::Closed) | None => {
                    return Err(SshError::channel(
                        "Shell closed before it became ready",
                    ));
                }
                Some(_) => {}
            }
        }
    };

    tokio::time::timeout(ready_timeout, wait_ready)
        .await
        .map_err(|_| {
            SshError::timeout(format!(
                "Shell did not become ready within {:?}",
                ready_timeout
            ))
        })?
}

enum InFlightKind {
    Framed(FrameParser),
    Raw(Vec<u8>),
}

struct InFlight {
    command: String,
    timeout: Duration,
    kind: InFlightKind,
    deadline: Instant,
    reply: oneshot::Sender<SshResult<CommandResult>>,
}

enum WorkerExit {
    Requested,
    ChannelClosed,
    IdleTimeout,
    Failed(String),
}

struct SessionWorker {
    session_id: String,
    nonce: String,
    writer: Box<dyn ChannelWriter>,
    reader: Box<dyn ChannelReader>,
    framer: CommandFramer,
    requests: mpsc::UnboundedReceiver<CommandRequest>,
    queue: VecDeque<CommandRequest>,
    in_flight: Option<InFlight>,
    /// Present for background sessions only
    output: Option<Arc<Mutex<OutputRing>>>,
    interrupt_on_timeout: bool,
    idle_deadline: Instant,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionWorker {
    async fn run(mut self) {
        let keepalive_enabled = !self.settings.keepalive_interval.is_zero();
        let period = self.settings.keepalive_interval.max(MIN_KEEPALIVE_PERIOD);
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let deadline = self.in_flight.as_ref().map(|f| f.deadline);
            let idle = self.in_flight.is_none() && self.queue.is_empty();

            let step = tokio::select! {
                _ = self.cancel.cancelled() => Err(WorkerExit::Requested),
                event = self.reader.next_event() => match event {
                    Some(ChannelEvent::Stdout(data)) | Some(ChannelEvent::Stderr(data)) => {
                        keepalive.reset();
                        self.on_output(&data).await
                    }
                    Some(ChannelEvent::Closed) | None => Err(WorkerExit::ChannelClosed),
                    Some(other) => {
                        debug!("Session {} shell event: {:?}", self.session_id, other);
                        Ok(())
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        self.idle_deadline = Instant::now() + self.settings.idle_timeout;
                        self.queue.push_back(request);
                        self.dispatch().await
                    }
                    None => Err(WorkerExit::Requested),
                },
                _ = wait_deadline(deadline) => self.on_deadline().await,
                _ = keepalive.tick(), if idle && keepalive_enabled => self.send_keepalive().await,
                _ = tokio::time::sleep_until(self.idle_deadline), if idle => {
                    Err(WorkerExit::IdleTimeout)
                }
            };

            if let Err(exit) = step {
                break exit;
            }
        };

        self.shutdown(exit).await;
    }

    async fn on_output(&mut self, data: &[u8]) -> Result<(), WorkerExit> {
        if let Some(output) = &self.output {
            output.lock().await.push(data);
        }

        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(());
        };
        match &mut in_flight.kind {
            InFlightKind::Framed(parser) => {
                if let Some(frame) = parser.feed(data) {
                    if let Some(done) = self.in_flight.take() {
                        debug!(
                            "Session {} command finished with {}: {}",
                            self.session_id, frame.exit_code, done.command
                        );
                        let _ = done.reply.send(Ok(CommandResult {
                            stdout: frame.output,
                            stderr: String::new(),
                            exit_code: Some(frame.exit_code),
                            signal: None,
                        }));
                    }
                    self.idle_deadline = Instant::now() + self.settings.idle_timeout;
                    return self.dispatch().await;
                }
            }
            InFlightKind::Raw(buf) => {
                buf.extend_from_slice(data);
                if buf.len() > MAX_CAPTURE_BYTES {
                    let excess = buf.len() - MAX_CAPTURE_BYTES;
                    buf.drain(..excess);
                }
            }
        }
        Ok(())
    }

    async fn on_deadline(&mut self) -> Result<(), WorkerExit> {
        let Some(done) = self.in_flight.take() else {
            return Ok(());
        };
        match done.kind {
            InFlightKind::Raw(buf) => {
                let _ = done.reply.send(Ok(CommandResult {
                    stdout: String::from_utf8_lossy(&buf).into_owned(),
                    ..Default::default()
                }));
            }
            InFlightKind::Framed(_) => {
                warn!(
                    "Session {} command timed out after {:?}: {}",
                    self.session_id, done.timeout, done.command
                );
                let _ = done.reply.send(Err(command_timeout(done.timeout)));
                if self.interrupt_on_timeout {
                    self.writer
                        .write(INTERRUPT)
                        .await
                        .map_err(|e| WorkerExit::Failed(e.to_string()))?;
                }
            }
        }
        self.idle_deadline = Instant::now() + self.settings.idle_timeout;
        self.dispatch().await
    }

    /// Start the next queued request if nothing is running.
    async fn dispatch(&mut self) -> Result<(), WorkerExit> {
        while self.in_flight.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return Ok(());
            };
            if request.reply.is_closed() {
                debug!(
                    "Session {} dropping abandoned command: {}",
                    self.session_id, request.command
                );
                continue;
            }
            let now = Instant::now();
            if now >= request.deadline {
                let _ = request.reply.send(Err(command_timeout(request.timeout)));
                continue;
            }

            let (payload, kind, deadline) = if request.raw {
                let line = format!("{}\n", request.command.trim_end_matches(['\r', '\n']));
                (line, InFlightKind::Raw(Vec::new()), now + self.settings.raw_settle)
            } else {
                let framed = self.framer.frame(&request.command);
                debug!(
                    "Session {} dispatching command {}: {}",
                    self.session_id, framed.id, request.command
                );
                (
                    framed.payload,
                    InFlightKind::Framed(framed.parser),
                    request.deadline,
                )
            };

            if let Err(e) = self.writer.write(payload.as_bytes()).await {
                let message = e.to_string();
                let _ = request.reply.send(Err(e));
                return Err(WorkerExit::Failed(message));
            }
            self.in_flight = Some(InFlight {
                command: request.command,
                timeout: request.timeout,
                kind,
                deadline,
                reply: request.reply,
            });
        }
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<(), WorkerExit> {
        debug!("Session {} keepalive", self.session_id);
        self.writer
            .write(b"\n")
            .await
            .map_err(|e| WorkerExit::Failed(e.to_string()))
    }

    async fn shutdown(mut self, exit: WorkerExit) {
        self.state.send_replace(SessionState::Closing);
        let _ = tokio::time::timeout(CHANNEL_CLOSE_WAIT, self.writer.close()).await;

        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight
                .reply
                .send(Err(SshError::session_closed(&self.session_id)));
        }
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            self.queue.push_back(request);
        }
        for request in self.queue.drain(..) {
            let _ = request
                .reply
                .send(Err(SshError::session_closed(&self.session_id)));
        }

        self.state.send_replace(SessionState::Closed);

        let kind = match exit {
            WorkerExit::Requested => {
                info!("Session {} closed", self.session_id);
                SessionEventKind::Closed
            }
            WorkerExit::ChannelClosed => {
                info!("Session {} channel closed by remote", self.session_id);
                SessionEventKind::Closed
            }
            WorkerExit::IdleTimeout => {
                warn!(
                    "Session {} closed after {:?} without commands",
                    self.session_id, self.settings.idle_timeout
                );
                SessionEventKind::TimedOut
            }
            WorkerExit::Failed(message) => {
                error!("Session {} failed: {}", self.session_id, message);
                SessionEventKind::Failed(message)
            }
        };
        let _ = self.events.send(SessionEvent {
            session_id: self.session_id,
            instance: self.nonce,
            kind,
        });
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
