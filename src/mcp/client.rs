//! russh-backed implementation of the transport traits.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive every `keepalive_interval`, three
//!    unanswered keepalives drop the connection, no inactivity timeout (the
//!    session layer owns idle policy).
//!
//! 2. **Connection Establishment**: TCP connect and handshake, bounded by the
//!    connect timeout together with authentication.
//!
//! 3. **Authentication**: public key only. The key is read from the path in
//!    the [`TargetSpec`]; RSA keys are signed with the best hash the server
//!    supports.
//!
//! 4. **Channels**: shells get an `xterm` PTY (ECHO disabled on request);
//!    exec channels run a single command.
//!
//! No retry happens here. A failed connect is reported once and the caller
//! decides what to do next.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Pty, Sig, client, keys};
use tracing::{debug, info, warn};

use super::config::{resolve_connect_timeout, resolve_keepalive_interval};
use super::error::{SshError, SshResult};
use super::transport::{
    ChannelEvent, ChannelPair, ChannelReader, ChannelWriter, Connector, TargetSpec, Transport,
};

const PTY_TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// Client handler for russh that accepts all host keys.
///
/// Lab hosts are rebuilt often and their host keys change with them, so
/// host keys are accepted the way `StrictHostKeyChecking=no` would.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// Inactivity timeout is disabled; liveness is tracked with keepalives. A zero
/// interval turns keepalives off.
pub(crate) fn build_client_config(keepalive_interval: Duration) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: (!keepalive_interval.is_zero()).then_some(keepalive_interval),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Opens authenticated russh connections.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration, keepalive_interval: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive_interval,
        }
    }

    /// Timeouts from `SSH_CONNECT_TIMEOUT` / `SSH_KEEPALIVE_INTERVAL`.
    pub fn from_env() -> Self {
        Self::new(
            resolve_connect_timeout(None),
            resolve_keepalive_interval(None),
        )
    }

    async fn connect_and_authenticate(
        &self,
        target: &TargetSpec,
    ) -> SshResult<client::Handle<SshClientHandler>> {
        let config = build_client_config(self.keepalive_interval);
        let mut handle = client::connect(
            config,
            (target.host.as_str(), target.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| {
            SshError::connection(format!(
                "Failed to connect to {}:{}",
                target.host, target.port
            ))
            .with_source(e)
        })?;

        authenticate_with_key(&mut handle, &target.username, &target.key_path).await?;
        Ok(handle)
    }
}

async fn authenticate_with_key(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
    key_path: &Path,
) -> SshResult<()> {
    // Passphrase-less keys only
    let key_pair = keys::load_secret_key(key_path, None).map_err(|e| {
        SshError::connection(format!("Failed to load private key from {:?}", key_path))
            .with_source(e)
    })?;

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

    let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
    let result = handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(|e| SshError::connection("Key authentication failed").with_source(e))?;

    if result.success() {
        Ok(())
    } else {
        Err(SshError::connection(format!(
            "Authentication failed: server rejected key {:?} for user {}",
            key_path, username
        )))
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, target: &TargetSpec) -> SshResult<Arc<dyn Transport>> {
        info!(
            "Connecting to {}@{}:{} (timeout {:?})",
            target.username, target.host, target.port, self.connect_timeout
        );
        let handle = tokio::time::timeout(self.connect_timeout, self.connect_and_authenticate(target))
            .await
            .map_err(|_| {
                SshError::connection(format!(
                    "Connection to {}@{}:{} timed out after {:?}",
                    target.username, target.host, target.port, self.connect_timeout
                ))
            })??;

        info!(
            "Authenticated to {}@{}:{}",
            target.username, target.host, target.port
        );
        Ok(Arc::new(RusshTransport {
            handle: Arc::new(handle),
        }))
    }
}

/// One authenticated russh connection.
pub struct RusshTransport {
    handle: Arc<client::Handle<SshClientHandler>>,
}

impl RusshTransport {
    async fn open_channel(&self) -> SshResult<russh::Channel<client::Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::channel("Failed to open channel").with_source(e))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open_shell(&self, echo: bool) -> SshResult<ChannelPair> {
        let channel = self.open_channel().await?;

        let modes: &[(Pty, u32)] = if echo { &[] } else { &[(Pty::ECHO, 0)] };
        channel
            .request_pty(true, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, modes)
            .await
            .map_err(|e| SshError::channel("Failed to request PTY").with_source(e))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| SshError::channel("Failed to start shell").with_source(e))?;

        let (read_half, write_half) = channel.split();
        Ok(ChannelPair {
            writer: Box::new(RusshChannelWriter { write_half }),
            reader: Box::new(RusshChannelReader { read_half }),
        })
    }

    async fn open_exec(&self, command: &str) -> SshResult<ChannelPair> {
        let channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::channel("Failed to execute command").with_source(e))?;

        let (read_half, write_half) = channel.split();
        Ok(ChannelPair {
            writer: Box::new(RusshChannelWriter { write_half }),
            reader: Box::new(RusshChannelReader { read_half }),
        })
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Lab session manager shutdown", "en")
            .await
        {
            warn!("Error during disconnect: {}", e);
        }
    }
}

/// Write handle for a channel; wraps `russh::ChannelWriteHalf`.
pub struct RusshChannelWriter {
    write_half: ChannelWriteHalf<client::Msg>,
}

#[async_trait]
impl ChannelWriter for RusshChannelWriter {
    async fn write(&self, data: &[u8]) -> SshResult<()> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| SshError::channel("Failed to write to channel").with_source(e))
    }

    async fn close(&self) -> SshResult<()> {
        self.write_half
            .close()
            .await
            .map_err(|e| SshError::channel("Failed to close channel").with_source(e))
    }
}

pub struct RusshChannelReader {
    read_half: ChannelReadHalf,
}

#[async_trait]
impl ChannelReader for RusshChannelReader {
    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            let event = match self.read_half.wait().await? {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
                // ext == 1 is stderr in SSH protocol
                ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Stderr(data.to_vec()),
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    ChannelEvent::ExitSignal(signal_label(&signal_name))
                }
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => ChannelEvent::Closed,
                _ => continue,
            };
            return Some(event);
        }
    }
}

/// Signal name without the `SIG` prefix, as a shell would print it.
fn signal_label(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod client_config {
        use super::*;

        #[test]
        fn test_keepalive_follows_interval() {
            let config = build_client_config(Duration::from_secs(45));
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(45)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_zero_interval_disables_keepalive() {
            let config = build_client_config(Duration::ZERO);
            assert_eq!(config.keepalive_interval, None);
        }

        #[test]
        fn test_no_inactivity_timeout() {
            let config = build_client_config(Duration::from_secs(30));
            assert_eq!(config.inactivity_timeout, None);
        }
    }

    mod signals {
        use super::*;

        #[test]
        fn test_standard_signal_label() {
            assert_eq!(signal_label(&Sig::TERM), "TERM");
            assert_eq!(signal_label(&Sig::KILL), "KILL");
        }

        #[test]
        fn test_custom_signal_label() {
            assert_eq!(signal_label(&Sig::Custom("WINCH".to_string())), "WINCH");
        }
    }

    mod connector {
        use super::*;
        use std::path::PathBuf;

        #[tokio::test]
        async fn test_unreachable_host_is_connection_error() {
            let connector =
                RusshConnector::new(Duration::from_secs(2), Duration::from_secs(30));
            let target = TargetSpec {
                host: "127.0.0.1".to_string(),
                username: "nobody".to_string(),
                key_path: PathBuf::from("/nonexistent/key"),
                port: 1,
            };
            let err = match connector.connect(&target).await {
                Ok(_) => panic!("connect to a closed port should fail"),
                Err(e) => e,
            };
            assert_eq!(err.kind(), crate::mcp::error::ErrorKind::Connection);
        }
    }
}
