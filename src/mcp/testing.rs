//! In-process fake transport for tests.
//!
//! [`FakeConnector`] hands out [`FakeTransport`]s. Shell channels are backed
//! by a tiny line-oriented shell simulator that understands just enough to
//! exercise framing:
//!
//! | Input line | Behaviour |
//! |------------|-----------|
//! | `stty ...` | ignored |
//! | `echo X` / `echo "X"` | prints X (`$?` expands to the last status) |
//! | `true` / `false` | status 0 / 1 |
//! | `printf X` | prints X without a newline |
//! | `sleep_ms N` | blocks for N ms, then status 0 |
//! | `hang` | blocks until `^C`, then status 130 |
//! | `exit` | closes the channel |
//! | scripted command | prints the scripted stdout, scripted status |
//! | anything else | "command not found", status 127 |
//!
//! Input typed while a command blocks is discarded on `^C`, like a terminal
//! flushing its input queue on interrupt.
//!
//! Exec channels support `hang` (open until closed or killed), `killed`
//! (exit signal), `stream` (prints a line, then the event stream just ends
//! when the transport is killed), `echo X` and scripted commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{SshError, SshResult};
use super::transport::{
    ChannelEvent, ChannelPair, ChannelReader, ChannelWriter, Connector, TargetSpec, Transport,
};

pub(crate) const UNREACHABLE_HOST: &str = "unreachable.lab";

#[derive(Debug, Clone)]
pub(crate) struct Scripted {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

pub(crate) struct FakeConnector {
    connects: AtomicUsize,
    connect_delay: Duration,
    scripts: Arc<HashMap<String, Scripted>>,
    transports: StdMutex<Vec<Arc<FakeTransport>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            scripts: Arc::new(HashMap::new()),
            transports: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn script(mut self, command: &str, stdout: &str, stderr: &str, exit_code: u32) -> Self {
        Arc::make_mut(&mut self.scripts).insert(
            command.to_string(),
            Scripted {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
            },
        );
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &TargetSpec) -> SshResult<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if target.host == UNREACHABLE_HOST {
            return Err(SshError::connection(format!(
                "Failed to connect to {}:{}",
                target.host, target.port
            )));
        }
        let transport = Arc::new(FakeTransport {
            alive: AtomicBool::new(true),
            killed: CancellationToken::new(),
            scripts: self.scripts.clone(),
            input: Arc::new(StdMutex::new(Vec::new())),
            shells: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub(crate) struct FakeTransport {
    alive: AtomicBool,
    killed: CancellationToken,
    scripts: Arc<HashMap<String, Scripted>>,
    input: Arc<StdMutex<Vec<String>>>,
    shells: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeTransport {
    /// Drop the connection: every channel closes and `is_alive` turns false.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.killed.cancel();
    }

    /// Every line written to any shell on this transport; `^C` shows as "^C".
    pub fn input_lines(&self) -> Vec<String> {
        self.input.lock().unwrap().clone()
    }

    pub fn shells_opened(&self) -> usize {
        self.shells.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_shell(&self, echo: bool) -> SshResult<ChannelPair> {
        if !self.is_alive() {
            return Err(SshError::channel("Failed to open channel: transport closed"));
        }
        self.shells.fetch_add(1, Ordering::SeqCst);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shell = FakeShell {
            echo,
            status: 0,
            line: Vec::new(),
            blocked: None,
            scripts: self.scripts.clone(),
            transcript: self.input.clone(),
            events: events_tx,
        };
        tokio::spawn(shell.run(input_rx, self.killed.clone()));
        Ok(ChannelPair {
            writer: Box::new(FakeWriter { input: input_tx }),
            reader: Box::new(FakeReader { events: events_rx }),
        })
    }

    async fn open_exec(&self, command: &str) -> SshResult<ChannelPair> {
        if !self.is_alive() {
            return Err(SshError::channel("Failed to open channel: transport closed"));
        }
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<WriterMsg>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let script = self.scripts.get(command).cloned();
        let command = command.to_string();
        let killed = self.killed.clone();

        tokio::spawn(async move {
            let emit = |event| {
                let _ = events_tx.send(event);
            };
            if command == "hang" {
                tokio::select! {
                    _ = killed.cancelled() => {}
                    _ = async { while let Some(msg) = input_rx.recv().await {
                        if matches!(msg, WriterMsg::Close) { break; }
                    } } => {}
                }
                emit(ChannelEvent::Closed);
                return;
            }
            if command == "stream" {
                emit(ChannelEvent::Stdout(b"partial\n".to_vec()));
                killed.cancelled().await;
                return;
            }
            if command == "killed" {
                emit(ChannelEvent::ExitSignal("KILL".to_string()));
            } else if let Some(script) = script {
                emit(ChannelEvent::Stdout(script.stdout.into_bytes()));
                if !script.stderr.is_empty() {
                    emit(ChannelEvent::Stderr(script.stderr.into_bytes()));
                }
                emit(ChannelEvent::ExitStatus(script.exit_code));
            } else if let Some(text) = command.strip_prefix("echo ") {
                emit(ChannelEvent::Stdout(format!("{}\n", unquote(text)).into_bytes()));
                emit(ChannelEvent::ExitStatus(0));
            } else {
                emit(ChannelEvent::Stderr(
                    format!("bash: {}: command not found\n", command).into_bytes(),
                ));
                emit(ChannelEvent::ExitStatus(127));
            }
            emit(ChannelEvent::Eof);
            emit(ChannelEvent::Closed);
        });

        Ok(ChannelPair {
            writer: Box::new(FakeWriter { input: input_tx }),
            reader: Box::new(FakeReader { events: events_rx }),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.kill();
    }
}

enum WriterMsg {
    Data(Vec<u8>),
    Close,
}

struct FakeWriter {
    input: mpsc::UnboundedSender<WriterMsg>,
}

#[async_trait]
impl ChannelWriter for FakeWriter {
    async fn write(&self, data: &[u8]) -> SshResult<()> {
        self.input
            .send(WriterMsg::Data(data.to_vec()))
            .map_err(|_| SshError::channel("Failed to write to channel: channel closed"))
    }

    async fn close(&self) -> SshResult<()> {
        let _ = self.input.send(WriterMsg::Close);
        Ok(())
    }
}

struct FakeReader {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
impl ChannelReader for FakeReader {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}

struct FakeShell {
    echo: bool,
    status: u32,
    line: Vec<u8>,
    /// Lines typed while a `hang` command runs
    blocked: Option<Vec<String>>,
    scripts: Arc<HashMap<String, Scripted>>,
    transcript: Arc<StdMutex<Vec<String>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

enum ShellStep {
    Continue,
    Exit,
}

impl FakeShell {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<WriterMsg>, killed: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = killed.cancelled() => break,
                msg = input.recv() => msg,
            };
            match msg {
                Some(WriterMsg::Data(bytes)) => {
                    if let ShellStep::Exit = self.feed(&bytes).await {
                        self.print("logout");
                        self.emit(ChannelEvent::ExitStatus(0));
                        self.emit(ChannelEvent::Eof);
                        break;
                    }
                }
                Some(WriterMsg::Close) | None => {
                    self.emit(ChannelEvent::Eof);
                    break;
                }
            }
        }
        self.emit(ChannelEvent::Closed);
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn print(&self, text: &str) {
        self.emit(ChannelEvent::Stdout(format!("{}\r\n", text).into_bytes()));
    }

    async fn feed(&mut self, bytes: &[u8]) -> ShellStep {
        for &byte in bytes {
            match byte {
                0x03 => {
                    self.transcript.lock().unwrap().push("^C".to_string());
                    self.line.clear();
                    self.print("^C");
                    if self.blocked.take().is_some() {
                        self.status = 130;
                    }
                }
                b'\n' => {
                    let line = String::from_utf8_lossy(&std::mem::take(&mut self.line))
                        .trim_end_matches('\r')
                        .to_string();
                    self.transcript.lock().unwrap().push(line.clone());
                    if self.echo {
                        self.print(&line);
                    }
                    if let Some(pending) = self.blocked.as_mut() {
                        pending.push(line);
                        continue;
                    }
                    if let ShellStep::Exit = self.execute(&line).await {
                        return ShellStep::Exit;
                    }
                }
                other => self.line.push(other),
            }
        }
        ShellStep::Continue
    }

    async fn execute(&mut self, line: &str) -> ShellStep {
        let line = line.trim();
        if line.is_empty() || line.starts_with("stty ") {
            return ShellStep::Continue;
        }
        if line == "exit" {
            return ShellStep::Exit;
        }
        if let Some(script) = self.scripts.get(line).cloned() {
            for text in script.stdout.lines().chain(script.stderr.lines()) {
                self.print(text);
            }
            self.status = script.exit_code;
            return ShellStep::Continue;
        }

        let (program, rest) = line.split_once(' ').unwrap_or((line, ""));
        match program {
            "echo" => {
                let text = unquote(rest).replace("$?", &self.status.to_string());
                self.print(&text);
                self.status = 0;
            }
            "printf" => {
                self.emit(ChannelEvent::Stdout(unquote(rest).as_bytes().to_vec()));
                self.status = 0;
            }
            "true" => self.status = 0,
            "false" => self.status = 1,
            "sleep_ms" => {
                let millis = rest.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                self.status = 0;
            }
            "hang" => self.blocked = Some(Vec::new()),
            _ => {
                self.print(&format!("bash: {}: command not found", program));
                self.status = 127;
            }
        }
        ShellStep::Continue
    }
}
