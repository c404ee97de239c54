//! Session registry, capacity enforcement, and idle reaping.
//!
//! The manager tracks live connections by id, rejects new connections once
//! the configured maximum is reached, and runs a background sweeper that
//! signals sessions idle past the TTL to close. The session itself is owned
//! by its connection task; the manager only holds the handle it needs to
//! observe activity and request shutdown.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

struct HandleInner {
    id: String,
    last_activity: RwLock<Instant>,
    close: Notify,
}

/// Handle to a registered session, shared between the connection task and
/// the manager.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Records inbound activity; the sweeper measures idleness from here.
    pub fn touch(&self) {
        *self.inner.last_activity.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.read().elapsed()
    }

    /// Completes when the manager asks this session to close (idle TTL or
    /// server shutdown). Intended for use inside the connection task's
    /// `select!`.
    pub async fn closed(&self) {
        self.inner.close.notified().await;
    }
}

/// Process-scoped registry of live sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<HandleInner>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_ttl,
        }
    }

    /// Registers a new connection, enforcing the session cap. Returns the
    /// handle with a fresh 128-bit id.
    pub fn register(&self) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(Error::ServerBusy);
        }

        let id = Uuid::new_v4().simple().to_string();
        let inner = Arc::new(HandleInner {
            id: id.clone(),
            last_activity: RwLock::new(Instant::now()),
            close: Notify::new(),
        });
        sessions.insert(id.clone(), inner.clone());
        tracing::info!(session = %id, total = sessions.len(), "session registered");

        Ok(SessionHandle { inner })
    }

    /// Removes a session from the registry. Called by the connection task
    /// on its way out; unknown ids are ignored (the sweeper may have
    /// removed it already).
    pub fn retire(&self, id: &str) {
        if self.sessions.write().remove(id).is_some() {
            tracing::info!(session = %id, "session retired");
        }
    }

    /// Looks up a live session's handle by id.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .get(id)
            .map(|inner| SessionHandle {
                inner: inner.clone(),
            })
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Signals every session idle past the TTL to close and drops it from
    /// the registry. Returns how many were reaped.
    pub fn sweep_idle(&self) -> usize {
        let mut sessions = self.sessions.write();
        let ttl = self.idle_ttl;
        let before = sessions.len();

        sessions.retain(|id, handle| {
            let idle = handle.last_activity.read().elapsed();
            if idle > ttl {
                tracing::info!(session = %id, idle_secs = idle.as_secs(), "closing idle session");
                // notify_one stores a permit, so the close is not lost if
                // the connection task is mid-message rather than waiting.
                handle.close.notify_one();
                false
            } else {
                true
            }
        });

        before - sessions.len()
    }

    /// Signals every live session to close (server shutdown).
    pub fn shutdown_all(&self) {
        let sessions = self.sessions.read();
        for handle in sessions.values() {
            handle.close.notify_one();
        }
    }

    /// Spawns the periodic idle sweeper. Returns a sender; send `true` (or
    /// drop it) to stop the task.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) -> watch::Sender<bool> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = manager.sweep_idle();
                        if reaped > 0 {
                            tracing::info!(reaped, remaining = manager.count(), "idle sweep");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        stop_tx
    }
}
