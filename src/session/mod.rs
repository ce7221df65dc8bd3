// Session Registry - connected clients, their identities, and their
// broadcast subscriptions. Process-local, never persisted.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;

pub type SessionId = Uuid;

/// Per-session lifecycle. `Disconnected` is terminal. `Connecting` is the
/// pre-authentication socket phase; such connections are not yet registered,
/// so a stored `Session` starts at `Authenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Disconnected,
}

/// A broadcast event pushed to a subscribed session.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub topic: String,
    pub payload: Value,
}

/// State for a single connected client. Shared between the connection task
/// and the inbound router, so mutable bits sit behind their own locks.
pub struct Session {
    pub session_id: SessionId,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    last_seen_at: RwLock<DateTime<Utc>>,
    state: RwLock<SessionState>,
    subscriptions: RwLock<HashSet<String>>,
    sender: mpsc::UnboundedSender<PushEvent>,
}

impl Session {
    /// A session is created once authentication has succeeded.
    pub fn new(identity: Identity, sender: mpsc::UnboundedSender<PushEvent>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            identity,
            connected_at: now,
            last_seen_at: RwLock::new(now),
            state: RwLock::new(SessionState::Authenticated),
            subscriptions: RwLock::new(HashSet::new()),
            sender,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("session state poisoned")
    }

    /// Authenticated -> Active. Only Active sessions receive broadcasts or
    /// may dispatch.
    pub fn activate(&self) {
        let mut state = self.state.write().expect("session state poisoned");
        if *state == SessionState::Authenticated {
            *state = SessionState::Active;
        }
    }

    /// Terminal transition; idempotent.
    pub fn disconnect(&self) {
        let mut state = self.state.write().expect("session state poisoned");
        *state = SessionState::Disconnected;
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn touch(&self) {
        let mut last_seen = self.last_seen_at.write().expect("session clock poisoned");
        *last_seen = Utc::now();
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        *self.last_seen_at.read().expect("session clock poisoned")
    }

    pub fn subscribe(&self, topics: impl IntoIterator<Item = String>) {
        let mut subs = self.subscriptions.write().expect("subscriptions poisoned");
        subs.extend(topics);
    }

    pub fn unsubscribe(&self, topics: &[String]) {
        let mut subs = self.subscriptions.write().expect("subscriptions poisoned");
        for topic in topics {
            subs.remove(topic);
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        let subs = self.subscriptions.read().expect("subscriptions poisoned");
        subs.contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let subs = self.subscriptions.read().expect("subscriptions poisoned");
        subs.iter().cloned().collect()
    }

    /// Whether this session may see events for a given tenant scope.
    /// Sessions without a tenant (super admins) match every scope.
    pub fn matches_scope(&self, scope: &str) -> bool {
        match &self.identity.tenant {
            Some(tenant) => tenant == scope,
            None => true,
        }
    }

    /// Queue a broadcast for delivery. Returns `false` when the connection
    /// side has gone away; callers must not treat that as fatal.
    pub fn push(&self, event: PushEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Owns the live session map. All reads take a snapshot so iteration never
/// observes concurrent mutation.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        tracing::info!(
            session_id = %session.session_id,
            user = %session.identity.email,
            "session registered"
        );
        sessions.insert(session.session_id, session);
    }

    /// Remove a session and mark it disconnected.
    pub fn unregister(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let removed = {
            let mut sessions = self.sessions.write().expect("session registry poisoned");
            sessions.remove(&session_id)
        };
        if let Some(session) = &removed {
            session.disconnect();
            tracing::info!(
                session_id = %session_id,
                user = %session.identity.email,
                "session unregistered"
            );
        }
        removed
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("session registry poisoned");
        sessions.get(&session_id).cloned()
    }

    /// Snapshot of the Active sessions subscribed to `topic` with a
    /// matching scope.
    pub fn sessions_for(&self, topic: &str, scope: &str) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().expect("session registry poisoned");
        sessions
            .values()
            .filter(|s| s.is_active() && s.is_subscribed(topic) && s.matches_scope(scope))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().expect("session registry poisoned");
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
