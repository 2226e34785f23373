//! Conversation session store.
//!
//! Front ends (a CLI loop, an HTTP layer) keep one [`Session`] per user
//! conversation. The store is an explicit object handed to whoever needs it;
//! expiry is a background task owned by the caller via [`spawn_sweeper`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sessions idle longer than this are swept.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// One entry in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A single conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub history: Vec<SessionTurn>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_active: now,
            history: Vec::new(),
        }
    }

    /// Append a turn and refresh `last_active`.
    pub fn push_turn(&mut self, role: TurnRole, content: impl Into<String>) {
        let now = Utc::now();
        self.history.push(SessionTurn {
            role,
            content: content.into(),
            at: now,
        });
        self.last_active = now;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// Storage for sessions, keyed by id.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<Session>;
    fn put(&self, session: Session);
    fn remove(&self, id: &Uuid) -> Option<Session>;
    /// Drop sessions idle past the TTL as of `now`. Returns how many went.
    fn sweep_expired(&self, now: DateTime<Utc>) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local session store with idle expiry.
pub struct InMemorySessionStore {
    ttl: chrono::Duration,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, id: &Uuid) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn put(&self, session: Session) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id, session);
    }

    fn remove(&self, id: &Uuid) -> Option<Session> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| now.signed_duration_since(s.last_active) < self.ttl);
        before - sessions.len()
    }

    fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Run `sweep_expired` every `interval` until the returned handle is aborted.
pub fn spawn_sweeper(store: Arc<dyn SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep_expired(Utc::now());
            if removed > 0 {
                tracing::info!(removed, remaining = store.len(), "swept expired sessions");
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let store = InMemorySessionStore::default();
        let mut session = Session::new();
        session.push_turn(TurnRole::User, "how many bookings in May?");
        let id = session.id;
        store.put(session);

        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].role, TurnRole::User);
        assert_eq!(store.len(), 1);

        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_expired_keeps_fresh_sessions() {
        let store = InMemorySessionStore::new(Duration::from_secs(3600));
        let now = Utc::now();

        let mut stale = Session::new();
        stale.last_active = now - chrono::Duration::hours(2);
        let fresh = Session::new();
        let fresh_id = fresh.id;

        store.put(stale);
        store.put(fresh);

        assert_eq!(store.sweep_expired(now), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&fresh_id).is_some());
        assert_eq!(store.sweep_expired(now), 0);
    }

    #[test]
    fn test_push_turn_refreshes_activity() {
        let mut session = Session::new();
        session.last_active = Utc::now() - chrono::Duration::hours(5);
        session.push_turn(TurnRole::Assistant, "There were 12 bookings.");
        assert!(Utc::now().signed_duration_since(session.last_active) < chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_sweeper_task_removes_expired() {
        let store = Arc::new(InMemorySessionStore::new(Duration::from_millis(10)));
        let mut old = Session::new();
        old.last_active = Utc::now() - chrono::Duration::seconds(1);
        store.put(old);

        let handle = spawn_sweeper(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(store.is_empty());
    }
}
