//! Live session registry
//!
//! Tracks every session between handshake and teardown so shutdown can
//! enumerate them. A slot is taken in two steps: [`SessionRegistry::reserve`]
//! during the WebSocket handshake (enforcing the session limit), then
//! [`Reservation::register`] once the upgrade succeeded. Both guards give
//! their slot back on drop, including when the owning task is aborted.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::BridgeError;
use crate::session::SessionHandle;

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Arc<SessionHandle>>,
    /// Reserved plus registered slots
    slots: AtomicUsize,
    next_id: AtomicU64,
    closing: AtomicBool,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot, failing when `limit` slots are in use (0 = unlimited)
    pub fn reserve(self: &Arc<Self>, limit: usize) -> Result<Reservation, BridgeError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BridgeError::Overloaded("bridge is shutting down".to_string()));
        }

        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (limit == 0 || n < limit).then_some(n + 1)
            })
            .map_err(|_| BridgeError::Overloaded(format!("session limit of {} reached", limit)))?;

        Ok(Reservation {
            registry: Some(self.clone()),
        })
    }

    /// Slots in use, including handshakes in progress
    pub fn len(&self) -> usize {
        self.slots.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Handles of all registered sessions
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stop admitting sessions and ask every live one to close.
    /// Returns the number of sessions notified.
    pub fn close_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let handles = self.handles();
        for handle in &handles {
            handle.request_close();
        }
        handles.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Wait until no slot is in use. Returns `false` on timeout.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn release(&self) {
        if self.slots.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.emptied.notify_waiters();
        }
    }
}

/// A slot held during the handshake
#[derive(Debug)]
pub struct Reservation {
    registry: Option<Arc<SessionRegistry>>,
}

impl Reservation {
    /// Turn the slot into a registered session with a fresh id
    pub fn register(mut self, peer: SocketAddr, topic: &str) -> Registration {
        let registry = match self.registry.take() {
            Some(registry) => registry,
            None => unreachable!("reservation already consumed"),
        };

        let id = registry.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = Arc::new(SessionHandle::new(id, peer, topic));
        registry.sessions.insert(id, handle.clone());

        // close_all may have run between reserve and now
        if registry.is_closing() {
            handle.request_close();
        }

        Registration { registry, handle }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.release();
        }
    }
}

/// A registered session; removed from the registry on drop
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.sessions.remove(&self.handle.id()).is_some() {
            self.registry.release();
        }
    }
}
