//! MCP tool surface of the lab session manager.
//!
//! - `lab_info`: describe the configured lab target
//! - `run_command`: one-shot command on a fresh exec channel
//! - `create_session`: open a persistent interactive or background shell
//! - `session_command`: run a command inside a persistent session
//! - `list_sessions`: metadata of every live session
//! - `close_session` / `close_all_sessions`: tear sessions down
//! - `get_session_output`: read a session's buffered output
//!
//! Every tool answers with a JSON document. Failures are reported as
//! `{"success": false, "error": ...}` payloads, never as transport errors.

use std::sync::Arc;

use poem_mcpserver::{Tools, content::Text};
use serde::Serialize;
use tracing::{error, info, warn};

use super::config::{resolve_command_timeout, resolve_session_timeout};
use super::lab::LabConfig;
use super::registry::{CreateSession, SessionRegistry};
use super::types::{
    CloseAllSessionsResponse, CloseSessionResponse, CreateSessionResponse, LabInfoResponse,
    ListSessionsResponse, RunCommandResponse, SessionCommandResponse, SessionMode,
    SessionOutputResponse, SessionSummary, SessionType, ToolFailure,
};

/// MCP tools bound to one lab target and one session registry.
///
/// Cheap to clone; every MCP connection gets its own handle to the same
/// registry.
#[derive(Clone)]
pub struct LabTools {
    registry: Arc<SessionRegistry>,
    lab: Arc<LabConfig>,
}

impl LabTools {
    pub fn new(registry: Arc<SessionRegistry>, lab: Arc<LabConfig>) -> Self {
        Self { registry, lab }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn lab_info_response(&self) -> LabInfoResponse {
        let target = &self.lab.target;
        LabInfoResponse {
            success: true,
            lab_name: self.lab.lab.name.clone(),
            network: self.lab.lab.network.clone(),
            target: target.host.clone(),
            username: target.ssh_user.clone(),
            port: target.ssh_port,
            enabled: target.enabled,
        }
    }

    async fn handle_run_command(
        &self,
        command: String,
        timeout_ms: Option<u64>,
    ) -> Result<RunCommandResponse, ToolFailure> {
        let fail = |e: String| ToolFailure::new(e).command(command.clone());
        let target = self.lab.credentials().map_err(|e| fail(e.to_string()))?;
        let timeout = resolve_command_timeout(timeout_ms);

        info!("Running one-shot command on {}: {}", target.key(), command);
        let output = self
            .registry
            .run_once(&target, &command, timeout)
            .await
            .map_err(|e| {
                error!("One-shot command failed: {}", e);
                fail(e.to_string())
            })?;

        Ok(RunCommandResponse {
            target: target.host,
            username: target.username,
            success: true,
            output,
            command,
        })
    }

    async fn handle_create_session(
        &self,
        session_id: Option<String>,
        session_type: Option<SessionType>,
        raw: Option<bool>,
        timeout_ms: Option<u64>,
    ) -> Result<CreateSessionResponse, ToolFailure> {
        let fail = |e: String| {
            let failure = ToolFailure::new(e);
            match &session_id {
                Some(id) => failure.session(id.clone()),
                None => failure,
            }
        };
        let target = self.lab.credentials().map_err(|e| fail(e.to_string()))?;
        let session_type = session_type.unwrap_or_default();
        // Raw mode is only offered for background sessions
        let mode = match (session_type, raw.unwrap_or(false)) {
            (SessionType::Background, true) => SessionMode::Raw,
            _ => SessionMode::Normal,
        };

        let session = self
            .registry
            .create(CreateSession {
                session_id: session_id.clone(),
                target: target.clone(),
                session_type,
                mode,
                idle_timeout: Some(resolve_session_timeout(timeout_ms)),
            })
            .await
            .map_err(|e| {
                error!("Failed to create {} session: {}", session_type, e);
                fail(e.to_string())
            })?;

        let info = session.info().await;
        Ok(CreateSessionResponse {
            success: true,
            message: format!("Session '{}' created successfully", info.session_id),
            session_id: info.session_id,
            target: target.host,
            username: target.username,
            session_type: info.session_type,
            mode: info.mode,
            created_at: info.created_at,
        })
    }

    async fn handle_session_command(
        &self,
        session_id: String,
        command: String,
        timeout_ms: Option<u64>,
        raw: Option<bool>,
    ) -> Result<SessionCommandResponse, ToolFailure> {
        let timeout = resolve_command_timeout(timeout_ms);
        match self
            .registry
            .execute(&session_id, &command, timeout, raw)
            .await
        {
            Ok(result) => Ok(SessionCommandResponse {
                success: true,
                session_id,
                command,
                output: result.stdout,
                stderr: result.stderr,
                exit_code: result.exit_code,
            }),
            Err(e) => {
                warn!("Command in session {} failed: {}", session_id, e);
                Err(ToolFailure::new(e.to_string())
                    .session(session_id)
                    .command(command))
            }
        }
    }

    async fn handle_list_sessions(&self) -> ListSessionsResponse {
        let sessions: Vec<SessionSummary> = self
            .registry
            .list()
            .await
            .into_iter()
            .map(SessionSummary::from)
            .collect();
        ListSessionsResponse {
            success: true,
            total_sessions: sessions.len(),
            sessions,
        }
    }

    async fn handle_close_session(&self, session_id: String) -> CloseSessionResponse {
        if self.registry.close(&session_id).await {
            CloseSessionResponse {
                success: true,
                message: format!("Session '{}' closed successfully", session_id),
                session_id,
            }
        } else {
            CloseSessionResponse {
                success: false,
                message: format!("Session '{}' not found", session_id),
                session_id,
            }
        }
    }

    async fn handle_get_session_output(
        &self,
        session_id: String,
        lines: Option<usize>,
        clear: Option<bool>,
    ) -> Result<SessionOutputResponse, ToolFailure> {
        let clear = clear.unwrap_or(false);
        let output = self
            .registry
            .output(&session_id, lines, clear)
            .await
            .map_err(|e| ToolFailure::new(e.to_string()).session(session_id.clone()))?;
        Ok(SessionOutputResponse {
            success: true,
            session_id,
            lines_returned: output.len(),
            output: output.join("\n"),
            buffer_cleared: clear,
        })
    }

    async fn handle_close_all_sessions(&self) -> CloseAllSessionsResponse {
        let closed = self.registry.close_all().await;
        CloseAllSessionsResponse {
            success: true,
            sessions_closed: closed,
            message: format!("All {} sessions have been closed", closed),
        }
    }
}

#[Tools]
impl LabTools {
    /// Describe the lab target: host, SSH user, port, lab name and network.
    async fn lab_info(&self) -> Text<String> {
        render(Ok::<_, ToolFailure>(self.lab_info_response()))
    }

    /// Run a single command on the lab target over a fresh exec channel.
    ///
    /// Nothing persists between calls: no working directory, no environment.
    /// stdout and stderr are returned separately. Use `create_session` for
    /// stateful work.
    async fn run_command(
        &self,
        /// Shell command to execute
        command: String,
        /// Timeout in milliseconds (default: 30000, env: SSH_COMMAND_TIMEOUT_MS)
        timeout: Option<u64>,
    ) -> Text<String> {
        render(self.handle_run_command(command, timeout).await)
    }

    /// Open a persistent shell session on the lab target.
    ///
    /// `interactive` sessions keep working directory and environment between
    /// `session_command` calls. `background` sessions suit long-running tools;
    /// their output is buffered and read with `get_session_output`.
    async fn create_session(
        &self,
        /// Optional session identifier; generated when omitted
        session_id: Option<String>,
        /// Session type: "interactive" (default) or "background"
        session_type: Option<SessionType>,
        /// Raw mode for full-screen programs and REPLs (background sessions only)
        raw: Option<bool>,
        /// Idle timeout in milliseconds (default: 600000, env: SSH_SESSION_TIMEOUT_MS)
        timeout_ms: Option<u64>,
    ) -> Text<String> {
        render(
            self.handle_create_session(session_id, session_type, raw, timeout_ms)
                .await,
        )
    }

    /// Execute a command inside a persistent session.
    ///
    /// Commands run in order. In raw mode the input is written as typed and
    /// the output collected after a short settle delay; no exit code is
    /// reported.
    async fn session_command(
        &self,
        /// Session ID returned from create_session
        session_id: String,
        /// Command to execute
        command: String,
        /// Timeout in milliseconds (default: 30000, env: SSH_COMMAND_TIMEOUT_MS)
        timeout: Option<u64>,
        /// Override the session's raw mode for this command
        raw: Option<bool>,
    ) -> Text<String> {
        render(
            self.handle_session_command(session_id, command, timeout, raw)
                .await,
        )
    }

    /// List all live sessions with their metadata.
    async fn list_sessions(&self) -> Text<String> {
        render(Ok::<_, ToolFailure>(self.handle_list_sessions().await))
    }

    /// Close a persistent session and release its channel.
    async fn close_session(
        &self,
        /// Session ID to close
        session_id: String,
    ) -> Text<String> {
        render(Ok::<_, ToolFailure>(
            self.handle_close_session(session_id).await,
        ))
    }

    /// Read buffered output of a session, most recent lines last.
    async fn get_session_output(
        &self,
        /// Session ID
        session_id: String,
        /// Return only the last N lines (0 or omitted: all lines)
        lines: Option<usize>,
        /// Clear the buffer after reading (default: false)
        clear: Option<bool>,
    ) -> Text<String> {
        render(
            self.handle_get_session_output(session_id, lines, clear)
                .await,
        )
    }

    /// Close every session and every pooled SSH connection.
    async fn close_all_sessions(&self) -> Text<String> {
        render(Ok::<_, ToolFailure>(
            self.handle_close_all_sessions().await,
        ))
    }
}

/// Serialize a tool outcome; failures become `success: false` documents.
fn render<T: Serialize>(outcome: Result<T, ToolFailure>) -> Text<String> {
    let json = match outcome {
        Ok(response) => serde_json::to_string_pretty(&response),
        Err(failure) => serde_json::to_string_pretty(&failure),
    };
    match json {
        Ok(json) => Text(json),
        Err(e) => {
            error!("Failed to serialize tool response: {}", e);
            Text(r#"{"success": false, "error": "response serialization failed"}"#.to_string())
        }
    }
}
