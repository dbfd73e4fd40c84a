//! Connection pool keyed by `user@host:port`.
//!
//! Each key owns a slot guarded by an async mutex, so concurrent `acquire`
//! calls for one key share a single connect attempt while different keys
//! connect in parallel. A pooled transport is reused while it reports itself
//! alive and replaced on the next `acquire` once it is not.
//!
//! Failures are returned to the caller as-is; the pool never retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::SshResult;
use super::transport::{ConnectionKey, Connector, TargetSpec, Transport};

type Slot = Arc<Mutex<Option<Arc<dyn Transport>>>>;

pub struct TransportPool {
    connector: Arc<dyn Connector>,
    slots: DashMap<ConnectionKey, Slot>,
}

impl TransportPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: DashMap::new(),
        }
    }

    /// Live transport for `target`, connecting if there is none.
    pub async fn acquire(&self, target: &TargetSpec) -> SshResult<Arc<dyn Transport>> {
        let key = target.key();
        // Clone the slot out so no map guard is held across an await
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let mut pooled = slot.lock().await;

        if let Some(transport) = pooled.as_ref() {
            if transport.is_alive() {
                debug!("Reusing connection {}", key);
                return Ok(transport.clone());
            }
            warn!("Connection {} is closed, reconnecting", key);
            *pooled = None;
        }

        let transport = self.connector.connect(target).await?;
        info!("Pooled new connection {}", key);
        *pooled = Some(transport.clone());
        Ok(transport)
    }

    /// Number of pooled transports that are still alive.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut alive = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|t| t.is_alive()) {
                alive += 1;
            }
        }
        alive
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect every pooled transport, waiting at most `wait` for each.
    /// Returns how many were disconnected.
    pub async fn disconnect_all(&self, wait: Duration) -> usize {
        let keys: Vec<ConnectionKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        let slots: Vec<(ConnectionKey, Slot)> = keys
            .into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .collect();

        let closes = slots.into_iter().map(|(key, slot)| async move {
            // A connect in progress holds the slot; do not wait it out
            let transport = match tokio::time::timeout(wait, slot.lock()).await {
                Ok(mut pooled) => pooled.take(),
                Err(_) => {
                    warn!("Connection {} still connecting after {:?}, abandoned", key, wait);
                    None
                }
            };
            match transport {
                Some(transport) => {
                    if tokio::time::timeout(wait, transport.disconnect()).await.is_err() {
                        warn!("Disconnect of {} did not finish within {:?}", key, wait);
                    }
                    true
                }
                None => false,
            }
        });
        let closed = join_all(closes).await.into_iter().filter(|c| *c).count();
        info!("Disconnected {} pooled connection(s)", closed);
        closed
    }
}
