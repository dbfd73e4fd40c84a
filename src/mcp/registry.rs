//! Directory of live persistent sessions.
//!
//! The registry is an owned object shared behind an `Arc`. It owns the
//! transport pool and maps session ids to [`PersistentSession`]s. A reaper
//! task consumes the sessions' terminal [`SessionEvent`]s and removes the
//! matching session instance, so a session that closed on its own (idle
//! timeout, remote exit, dropped connection) disappears from `list`.
//!
//! Close operations never block indefinitely: `close` waits at most
//! [`CLOSE_WAIT`] and `close_all` waits at most [`CLOSE_ALL_WAIT`] per
//! session and per connection.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{SshError, SshResult};
use super::exec;
use super::pool::TransportPool;
use super::session::{
    PersistentSession, SessionConfig, SessionEvent, SessionEventKind, SessionSettings,
};
use super::transport::TargetSpec;
use super::types::{CommandResult, SessionInfo, SessionMode, SessionType};

pub(crate) const CLOSE_WAIT: Duration = Duration::from_secs(3);
pub(crate) const CLOSE_ALL_WAIT: Duration = Duration::from_secs(5);

/// Parameters of [`SessionRegistry::create`].
#[derive(Debug, Clone)]
pub struct CreateSession {
    /// Generated when absent
    pub session_id: Option<String>,
    pub target: TargetSpec,
    pub session_type: SessionType,
    pub mode: SessionMode,
    /// Overrides the registry's default idle timeout
    pub idle_timeout: Option<Duration>,
}

pub struct SessionRegistry {
    pool: Arc<TransportPool>,
    sessions: DashMap<String, Arc<PersistentSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    settings: SessionSettings,
}

impl SessionRegistry {
    /// Create the registry and start its reaper task.
    pub fn new(pool: Arc<TransportPool>, settings: SessionSettings) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            pool,
            sessions: DashMap::new(),
            events: events_tx,
            settings,
        });
        tokio::spawn(reap(Arc::downgrade(&registry), events_rx));
        registry
    }

    pub fn pool(&self) -> &Arc<TransportPool> {
        &self.pool
    }

    /// Open a new session. Fails if the id is already taken.
    pub async fn create(&self, request: CreateSession) -> SshResult<Arc<PersistentSession>> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| generate_session_id(request.session_type));
        if self.sessions.contains_key(&session_id) {
            return Err(SshError::session_exists(&session_id));
        }

        let mut settings = self.settings.clone();
        if let Some(idle_timeout) = request.idle_timeout {
            settings.idle_timeout = idle_timeout;
        }

        let transport = self.pool.acquire(&request.target).await?;
        let config = SessionConfig {
            session_id: session_id.clone(),
            target: request.target,
            session_type: request.session_type,
            mode: request.mode,
            settings,
        };
        let session = PersistentSession::start(config, transport, self.events.clone()).await?;

        // Another create may have claimed the id while this one was connecting
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Session id {} was taken during startup", session_id);
                session.close();
                Err(SshError::session_exists(&session_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                info!("Registered session {}", session_id);
                Ok(session)
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<PersistentSession>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Metadata snapshots of every registered session.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<PersistentSession>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        raw: Option<bool>,
    ) -> SshResult<CommandResult> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SshError::session_not_found(session_id))?;
        session.execute_command(command, timeout, raw).await
    }

    pub async fn output(
        &self,
        session_id: &str,
        max_lines: Option<usize>,
        clear: bool,
    ) -> SshResult<Vec<String>> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SshError::session_not_found(session_id))?;
        Ok(session.get_buffered_output(max_lines, clear).await)
    }

    /// Run a command on a fresh exec channel without a session.
    pub async fn run_once(
        &self,
        target: &TargetSpec,
        command: &str,
        timeout: Duration,
    ) -> SshResult<CommandResult> {
        exec::run(&self.pool, target, command, timeout).await
    }

    /// Close one session. Returns `false` when the id is unknown.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.close();
        if tokio::time::timeout(CLOSE_WAIT, session.wait_closed())
            .await
            .is_err()
        {
            warn!(
                "Session {} did not confirm close within {:?}",
                session_id, CLOSE_WAIT
            );
        }
        true
    }

    /// Close every session and every pooled connection. Returns the number
    /// of sessions that were registered.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<PersistentSession>> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect();
        let count = sessions.len();

        let closes = sessions.iter().map(|session| async move {
            session.close();
            if tokio::time::timeout(CLOSE_ALL_WAIT, session.wait_closed())
                .await
                .is_err()
            {
                warn!(
                    "Session {} did not confirm close within {:?}",
                    session.id(),
                    CLOSE_ALL_WAIT
                );
            }
        });
        join_all(closes).await;

        self.pool.disconnect_all(CLOSE_ALL_WAIT).await;
        self.sessions.clear();
        info!("Closed {} session(s)", count);
        count
    }

    fn reap_session(&self, event: &SessionEvent) {
        let removed = self
            .sessions
            .remove_if(&event.session_id, |_, s| s.nonce() == event.instance);
        match (&event.kind, removed.is_some()) {
            (SessionEventKind::TimedOut, true) => {
                info!("Session {} removed after idle timeout", event.session_id)
            }
            (SessionEventKind::Failed(message), true) => {
                warn!("Session {} removed after failure: {}", event.session_id, message)
            }
            (_, true) => info!("Session {} removed", event.session_id),
            (_, false) => debug!("Session {} was already unregistered", event.session_id),
        }
    }
}

async fn reap(registry: Weak<SessionRegistry>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.reap_session(&event);
    }
}

/// `session_<millis>_<6 random>` or `bg_session_<millis>_<6 random>`.
fn generate_session_id(session_type: SessionType) -> String {
    let prefix = match session_type {
        SessionType::Interactive => "session",
        SessionType::Background => "bg_session",
    };
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        prefix,
        Utc::now().timestamp_millis(),
        &random[..6]
    )
}
