//! Serializable types shared by the session manager and the MCP tools.
//!
//! All tool payloads implement `Serialize`, `Deserialize` and `JsonSchema`.
//! Timestamps are RFC3339 strings.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a session is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Stateful shell driven command by command
    #[default]
    Interactive,
    /// Long-running processes; all output is kept in a line buffer
    Background,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Interactive => write!(f, "interactive"),
            SessionType::Background => write!(f, "background"),
        }
    }
}

/// How commands are written to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Commands are wrapped in sentinels and return an exit code
    #[default]
    Normal,
    /// Commands are written as typed; for full-screen and interactive programs
    Raw,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Normal => write!(f, "normal"),
            SessionMode::Raw => write!(f, "raw"),
        }
    }
}

/// Metadata snapshot of a persistent session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub target: String,
    pub username: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub mode: SessionMode,
    pub created_at: String,
    pub last_activity: String,
    pub command_history: Vec<String>,
    pub is_active: bool,
}

/// Result of one command.
///
/// Framed session commands share one terminal stream, so `stderr` is always
/// empty for them. Raw-mode commands have no exit code.
///
/// Serialized as `{stdout, stderr, exitCode, signal}`, the shape nested in
/// `run_command` responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RunCommandResponse {
    pub target: String,
    pub command: String,
    pub username: String,
    pub success: bool,
    pub output: CommandResult,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub target: String,
    pub username: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub mode: SessionMode,
    pub created_at: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionCommandResponse {
    pub success: bool,
    pub session_id: String,
    pub command: String,
    pub output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// One row of `list_sessions`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub target: String,
    pub username: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub mode: SessionMode,
    pub created_at: String,
    pub last_activity: String,
    pub is_active: bool,
    pub command_count: usize,
}

impl From<SessionInfo> for SessionSummary {
    fn from(info: SessionInfo) -> Self {
        Self {
            command_count: info.command_history.len(),
            session_id: info.session_id,
            target: info.target,
            username: info.username,
            session_type: info.session_type,
            mode: info.mode,
            created_at: info.created_at,
            last_activity: info.last_activity,
            is_active: info.is_active,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListSessionsResponse {
    pub success: bool,
    pub sessions: Vec<SessionSummary>,
    pub total_sessions: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CloseSessionResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionOutputResponse {
    pub success: bool,
    pub session_id: String,
    pub output: String,
    pub lines_returned: usize,
    pub buffer_cleared: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CloseAllSessionsResponse {
    pub success: bool,
    pub sessions_closed: usize,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LabInfoResponse {
    pub success: bool,
    pub lab_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub target: String,
    pub username: String,
    pub port: u16,
    pub enabled: bool,
}

/// Failure payload; fields the failing tool knows about are echoed back.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolFailure {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub error: String,
}

impl ToolFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            command: None,
            error: error.into(),
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}
