//! C3: session store.
//!
//! Keyed record of `(sessionId -> SessionRecord)` with TTL. This is the
//! only component allowed to invalidate a session; removing the record
//! is the sole way to do it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{Clock, IdGenerator};
use crate::error::Result;
use crate::events::{CoreEvent, EventBus};

/// Default tick for [`SessionStore::purge`] when driven by a background loop.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// A single authenticated principal's handle. Owns contexts.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub roles: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Parameters for creating a new session, before IDs/timestamps are minted.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub username: String,
    pub roles: HashSet<String>,
    pub duration: Duration,
    pub metadata: serde_json::Value,
}

/// `(sessionId -> SessionRecord)` with a secondary `userId` index.
///
/// All operations are safe under concurrent callers. A `Get` after a
/// `Delete` always returns nothing; there is no separate invalidation
/// path. `Touch` only ever moves `lastActivityAt` forward; it never
/// extends `expiresAt`.
pub struct SessionStore {
    sessions: DashMap<String, SessionRecord>,
    by_user: DashMap<String, HashSet<String>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: EventBus,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, events: EventBus) -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            clock,
            ids,
            events,
        }
    }

    /// Mint a new session record and store it.
    pub fn create(&self, new: NewSession) -> SessionRecord {
        let now = self.clock.now_utc();
        let record = SessionRecord {
            session_id: self.ids.new_id(),
            user_id: new.user_id.clone(),
            username: new.username,
            roles: new.roles,
            created_at: now,
            last_activity_at: now,
            expires_at: now + new.duration,
            metadata: new.metadata,
        };
        self.insert(record.clone());
        self.events.publish(CoreEvent::SessionCreated {
            session_id: record.session_id.clone(),
            user_id: new.user_id,
        });
        record
    }

    /// Insert an already-constructed record (used for admin-provisioned
    /// sessions, "provisioned out of band" path).
    pub fn insert(&self, record: SessionRecord) {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.session_id.clone());
        self.sessions.insert(record.session_id.clone(), record);
    }

    /// Live, unexpired lookup. An expired-but-not-yet-purged record is
    /// treated as absent.
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let record = self.sessions.get(session_id)?;
        if record.is_expired(self.clock.now_utc()) {
            return None;
        }
        Some(record.clone())
    }

    /// Move `lastActivityAt` to now. Never touches `expiresAt`.
    pub fn touch(&self, session_id: &str) {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            record.last_activity_at = self.clock.now_utc();
        }
    }

    /// Remove the record. Returns whether one existed.
    pub fn delete(&self, session_id: &str) -> bool {
        if let Some((_, record)) = self.sessions.remove(session_id) {
            if let Some(mut ids) = self.by_user.get_mut(&record.user_id) {
                ids.remove(session_id);
            }
            self.events.publish(CoreEvent::SessionDeleted {
                session_id: session_id.to_string(),
            });
            true
        } else {
            false
        }
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionRecord> {
        let now = self.clock.now_utc();
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id).map(|r| r.clone()))
                    .filter(|r| !r.is_expired(now))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every record past its `expiresAt`, emitting `SessionExpired`
    /// for each. Safe to call concurrently with any other operation.
    pub fn purge(&self) -> usize {
        let now = self.clock.now_utc();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for session_id in &expired {
            if let Some((_, record)) = self.sessions.remove(session_id) {
                if let Some(mut ids) = self.by_user.get_mut(&record.user_id) {
                    ids.remove(session_id);
                }
            }
            self.events.publish(CoreEvent::SessionExpired {
                session_id: session_id.clone(),
            });
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Spawns the background purge loop (default tick [`DEFAULT_PURGE_INTERVAL`]).
///
/// Runs on the tokio runtime rather than a dedicated OS thread, since the
/// purge itself never talks to a driver subprocess.
pub fn spawn_purge_loop(
    store: Arc<SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge();
                    if purged > 0 {
                        log::debug!("session purge removed {purged} expired session(s)");
                    }
                }
                _ = shutdown.changed() => {
                    log::debug!("session purge loop shutting down");
                    break;
                }
            }
        }
    })
}

/// Write-through replica seam for durable session storage. The
/// in-memory [`SessionStore`] remains authoritative; a persistence
/// implementation is consulted only to replay state on startup.
pub trait SessionPersistence: Send + Sync {
    fn save(&self, record: &SessionRecord) -> Result<()>;
    fn load_all(&self) -> Result<Vec<SessionRecord>>;
}

/// Default no-op persistence: nothing durable backs the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl SessionPersistence for NoPersistence {
    fn save(&self, _record: &SessionRecord) -> Result<()> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(Vec::new())
    }
}
