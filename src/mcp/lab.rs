//! Lab description: which host the agent may reach and with which credentials.
//!
//! The description is a small JSON document, located through `LAB_CONFIG_PATH`:
//!
//! ```json
//! {
//!   "lab": { "name": "red-team-lab", "network": "172.20.0.0/16" },
//!   "target": {
//!     "host": "172.20.0.30",
//!     "ssh_user": "kali",
//!     "ssh_key": "~/.ssh/lab_key",
//!     "ssh_port": 22,
//!     "enabled": true
//!   }
//! }
//! ```
//!
//! `public_ip` is accepted as an alias of `host`. A leading `~` in `ssh_key` is
//! expanded against `HOME` at load time.

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::resolve_lab_config_path;
use super::error::{SshError, SshResult};
use super::transport::TargetSpec;

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TargetConfig {
    #[serde(alias = "public_ip")]
    pub host: String,
    pub ssh_user: String,
    pub ssh_key: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabConfig {
    pub lab: LabInfo,
    pub target: TargetConfig,
}

impl LabConfig {
    /// Parse a lab description and expand `~` in the key path.
    pub fn from_json(raw: &str) -> SshResult<Self> {
        let mut config: LabConfig = serde_json::from_str(raw)
            .map_err(|e| SshError::config("Invalid lab configuration").with_source(e))?;
        let home = std::env::var_os("HOME").map(PathBuf::from);
        config.target.ssh_key = expand_tilde(&config.target.ssh_key, home.as_deref())
            .to_string_lossy()
            .into_owned();
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SshError::config(format!("Failed to read lab configuration {:?}", path)).with_source(e)
        })?;
        let config = Self::from_json(&raw)?;
        info!(
            "Loaded lab '{}' targeting {}@{}:{}",
            config.lab.name, config.target.ssh_user, config.target.host, config.target.ssh_port
        );
        Ok(config)
    }

    /// Load from `LAB_CONFIG_PATH`, falling back to `lab-config.json`.
    pub fn load_from_env() -> SshResult<Self> {
        Self::load(resolve_lab_config_path(None))
    }

    /// Credentials for the lab target. Fails when the target is disabled.
    pub fn credentials(&self) -> SshResult<TargetSpec> {
        let target = &self.target;
        if !target.enabled {
            return Err(SshError::config(format!(
                "Target {} is disabled in lab '{}'",
                target.host, self.lab.name
            )));
        }
        Ok(TargetSpec {
            host: target.host.clone(),
            username: target.ssh_user.clone(),
            key_path: PathBuf::from(&target.ssh_key),
            port: target.ssh_port,
        })
    }
}

/// Replace a leading `~` with `home`. Paths like `~user/...` are left alone.
pub(crate) fn expand_tilde(path: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(path);
    };
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}
