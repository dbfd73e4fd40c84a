//! Configuration resolution for the lab session manager.
//!
//! Values follow a three-tier priority:
//!
//! 1. **Parameter** - explicitly provided by the tool call (highest priority)
//! 2. **Environment Variable** - value from the process environment (or `.env`)
//! 3. **Default** - built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connect + authenticate timeout in seconds |
//! | `SSH_KEEPALIVE_INTERVAL` | 30s | Transport keepalive and shell keepalive interval in seconds |
//! | `SSH_COMMAND_TIMEOUT_MS` | 30000ms | Per-command timeout for one-shot and session commands |
//! | `SSH_SESSION_TIMEOUT_MS` | 600000ms | Idle timeout for sessions created through the tools |
//! | `SSH_RAW_SETTLE_MS` | 1000ms | How long raw-mode writes collect output before returning |
//! | `SSH_READY_TIMEOUT` | 15s | How long a new shell may take to answer the readiness probe |
//! | `LAB_CONFIG_PATH` | `lab-config.json` | Location of the lab description |

use std::env;
use std::time::Duration;

/// Default connect + authentication timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default keepalive interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default per-command timeout in milliseconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Default session idle timeout in milliseconds for tool-created sessions
pub(crate) const DEFAULT_SESSION_TIMEOUT_MS: u64 = 600_000;

/// Default raw-mode settle delay in milliseconds
pub(crate) const DEFAULT_RAW_SETTLE_MS: u64 = 1_000;

/// Default shell readiness timeout in seconds
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 15;

/// Default lab description path
pub(crate) const DEFAULT_LAB_CONFIG_PATH: &str = "lab-config.json";

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const KEEPALIVE_INTERVAL_ENV_VAR: &str = "SSH_KEEPALIVE_INTERVAL";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT_MS";
pub(crate) const SESSION_TIMEOUT_ENV_VAR: &str = "SSH_SESSION_TIMEOUT_MS";
pub(crate) const RAW_SETTLE_ENV_VAR: &str = "SSH_RAW_SETTLE_MS";
pub(crate) const READY_TIMEOUT_ENV_VAR: &str = "SSH_READY_TIMEOUT";
pub(crate) const LAB_CONFIG_PATH_ENV_VAR: &str = "LAB_CONFIG_PATH";

/// Resolve a numeric setting with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall through to the default.
fn resolve_u64(param: Option<u64>, env_var: &str, default: u64) -> u64 {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<u64>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

pub(crate) fn resolve_connect_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

/// Zero disables keepalive, both in the SSH client and in sessions.
pub(crate) fn resolve_keepalive_interval(interval_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        interval_secs,
        KEEPALIVE_INTERVAL_ENV_VAR,
        DEFAULT_KEEPALIVE_INTERVAL_SECS,
    ))
}

pub(crate) fn resolve_command_timeout(timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve_u64(
        timeout_ms,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_MS,
    ))
}

pub(crate) fn resolve_session_timeout(timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve_u64(
        timeout_ms,
        SESSION_TIMEOUT_ENV_VAR,
        DEFAULT_SESSION_TIMEOUT_MS,
    ))
}

pub(crate) fn resolve_raw_settle(settle_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve_u64(
        settle_ms,
        RAW_SETTLE_ENV_VAR,
        DEFAULT_RAW_SETTLE_MS,
    ))
}

pub(crate) fn resolve_ready_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve_u64(
        timeout_secs,
        READY_TIMEOUT_ENV_VAR,
        DEFAULT_READY_TIMEOUT_SECS,
    ))
}

/// Resolve the lab description path with priority: parameter -> env var -> default
pub(crate) fn resolve_lab_config_path(path_param: Option<String>) -> String {
    if let Some(path) = path_param {
        return path;
    }

    if let Ok(path) = env::var(LAB_CONFIG_PATH_ENV_VAR)
        && !path.trim().is_empty()
    {
        return path;
    }

    DEFAULT_LAB_CONFIG_PATH.to_string()
}
