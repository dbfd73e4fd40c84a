//! Transport seam between the session manager and the SSH library.
//!
//! The pool, the persistent sessions and the one-shot executor only speak
//! these traits. The russh-backed implementation lives in `client`; tests
//! drive the same code through an in-process fake.
//!
//! # Model
//!
//! - A [`Connector`] authenticates a [`TargetSpec`] and yields a [`Transport`].
//! - A [`Transport`] is one authenticated connection carrying many channels.
//! - Each channel is split into a [`ChannelWriter`] (shared, `&self`) and a
//!   [`ChannelReader`] (owned by exactly one task).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::SshResult;

/// Validated credentials for one remote login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub host: String,
    pub username: String,
    pub key_path: PathBuf,
    pub port: u16,
}

impl TargetSpec {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            user: self.username.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Pool identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
}

#[async_trait]
pub trait ChannelReader: Send {
    /// Next event, or `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write(&self, data: &[u8]) -> SshResult<()>;

    /// Close our side of the channel.
    async fn close(&self) -> SshResult<()>;
}

pub struct ChannelPair {
    pub writer: Box<dyn ChannelWriter>,
    pub reader: Box<dyn ChannelReader>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an interactive shell on a PTY. With `echo` off the terminal does
    /// not reflect input back into the output stream.
    async fn open_shell(&self, echo: bool) -> SshResult<ChannelPair>;

    /// Open an exec channel running `command`.
    async fn open_exec(&self, command: &str) -> SshResult<ChannelPair>;

    fn is_alive(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetSpec) -> SshResult<Arc<dyn Transport>>;
}
