// Correlation Table - pending-request store bridging the push-based bus
// and the pull-based per-call await
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::DispatchError;

// A pending request is terminal exactly once: resolved, timed out, or
// cancelled. Terminal entries are removed immediately, so the table only
// ever holds pending records.
struct PendingEntry {
    session_id: Option<Uuid>,
    subject: String,
    deadline: Instant,
    tx: oneshot::Sender<Result<Value, DispatchError>>,
}

/// Handle returned to the dispatcher; completes when the entry reaches a
/// terminal state.
pub struct Waiter {
    rx: oneshot::Receiver<Result<Value, DispatchError>>,
}

impl Waiter {
    pub async fn wait(self) -> Result<Value, DispatchError> {
        // Sender dropped without a verdict means the entry was aborted
        self.rx.await.unwrap_or(Err(DispatchError::Cancelled))
    }
}

/// Pending-request store keyed by correlation id. All transitions go through
/// one lock, so each id sees exactly one terminal transition.
pub struct CorrelationTable {
    entries: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a pending request and hand back its waiter.
    pub fn insert(
        &self,
        correlation_id: Uuid,
        session_id: Option<Uuid>,
        subject: &str,
        timeout: Duration,
    ) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            session_id,
            subject: subject.to_string(),
            deadline: Instant::now() + timeout,
            tx,
        };

        let mut entries = self.entries.lock().expect("correlation table poisoned");
        // UUID v4 collisions are not expected; an old entry under the same
        // id would be a bug, so replace it and let its waiter see Cancelled.
        entries.insert(correlation_id, entry);
        Waiter { rx }
    }

    /// Deliver a response. Returns `false` (and does nothing) when the id is
    /// unknown or already terminal - duplicate and late responses are no-ops.
    pub fn resolve(&self, correlation_id: Uuid, response: Value) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("correlation table poisoned");
            entries.remove(&correlation_id)
        };

        match entry {
            Some(entry) => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    subject = %entry.subject,
                    "resolving pending request"
                );
                // The waiter may already be gone (caller dropped); the
                // terminal transition still happened exactly once.
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop an entry without notifying its waiter. Used when a publish
    /// fails after insert - the dispatcher reports the error itself.
    pub fn abort(&self, correlation_id: Uuid) {
        let mut entries = self.entries.lock().expect("correlation table poisoned");
        entries.remove(&correlation_id);
    }

    /// Cancel every pending request owned by a disconnecting session.
    /// Returns the number of requests cancelled.
    pub fn cancel_session(&self, session_id: Uuid) -> usize {
        let cancelled: Vec<(Uuid, PendingEntry)> = {
            let mut entries = self.entries.lock().expect("correlation table poisoned");
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(_, e)| e.session_id == Some(session_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in &cancelled {
            tracing::debug!(
                correlation_id = %id,
                subject = %entry.subject,
                session_id = %session_id,
                "cancelled pending request for disconnected session"
            );
        }
        let count = cancelled.len();
        for (_, entry) in cancelled {
            let _ = entry.tx.send(Err(DispatchError::Cancelled));
        }
        count
    }

    /// Transition every entry past its deadline to `TimedOut` and fail its
    /// waiter. Returns the number of entries expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(Uuid, PendingEntry)> = {
            let mut entries = self.entries.lock().expect("correlation table poisoned");
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::warn!(
                correlation_id = %id,
                subject = %entry.subject,
                "pending request timed out"
            );
            let _ = entry.tx.send(Err(DispatchError::Timeout));
        }
        count
    }

    pub fn contains(&self, correlation_id: &Uuid) -> bool {
        let entries = self.entries.lock().expect("correlation table poisoned");
        entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("correlation table poisoned");
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background timeout sweep.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                table.sweep(Instant::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_to_the_waiter() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        let waiter = table.insert(id, None, "admin.organizations.list", Duration::from_secs(5));

        assert!(table.resolve(id, json!({"success": true, "data": []})));
        assert!(table.is_empty());

        let result = waiter.wait().await.unwrap();
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn resolve_succeeds_at_most_once() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        let waiter = table.insert(id, None, "admin.claims.get", Duration::from_secs(5));

        assert!(table.resolve(id, json!({"n": 1})));
        // Duplicate and late responses are silent no-ops
        assert!(!table.resolve(id, json!({"n": 2})));
        assert!(!table.resolve(Uuid::new_v4(), json!({})));

        // First writer wins: the delivered result is untouched
        let result = waiter.wait().await.unwrap();
        assert_eq!(result["n"], 1);
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries_exactly_once() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        let waiter = table.insert(id, None, "admin.claims.list", Duration::from_millis(10));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(table.sweep(later), 1);
        // Second sweep finds nothing; resolution after timeout is a no-op
        assert_eq!(table.sweep(later), 0);
        assert!(!table.resolve(id, json!({"late": true})));

        assert!(matches!(waiter.wait().await, Err(DispatchError::Timeout)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn sweep_leaves_unexpired_entries_alone() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        let _waiter = table.insert(id, None, "admin.claims.list", Duration::from_secs(60));

        assert_eq!(table.sweep(Instant::now()), 0);
        assert!(table.contains(&id));
    }

    #[tokio::test]
    async fn cancel_session_only_touches_that_sessions_requests() {
        let table = CorrelationTable::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        let id_a1 = Uuid::new_v4();
        let id_a2 = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let waiter_a1 = table.insert(id_a1, Some(session_a), "admin.claims.list", Duration::from_secs(5));
        let waiter_a2 = table.insert(id_a2, Some(session_a), "admin.claims.get", Duration::from_secs(5));
        let waiter_b = table.insert(id_b, Some(session_b), "admin.users.list", Duration::from_secs(5));

        assert_eq!(table.cancel_session(session_a), 2);
        assert!(matches!(waiter_a1.wait().await, Err(DispatchError::Cancelled)));
        assert!(matches!(waiter_a2.wait().await, Err(DispatchError::Cancelled)));

        // Late responses for cancelled ids are dropped without error
        assert!(!table.resolve(id_a1, json!({})));

        // The other session's request is still live
        assert!(table.resolve(id_b, json!({"ok": true})));
        assert_eq!(waiter_b.wait().await.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn abort_removes_without_notifying() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        let waiter = table.insert(id, None, "admin.claims.list", Duration::from_secs(5));

        table.abort(id);
        assert!(table.is_empty());
        // The waiter observes a cancelled request, not a hang
        assert!(matches!(waiter.wait().await, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn background_sweeper_fails_the_waiter() {
        let table = Arc::new(CorrelationTable::new());
        let sweeper = table.spawn_sweeper(Duration::from_millis(10));

        let id = Uuid::new_v4();
        let waiter = table.insert(id, None, "admin.organizations.list", Duration::from_millis(30));

        let result = tokio::time::timeout(Duration::from_secs(2), waiter.wait())
            .await
            .expect("sweeper should have fired");
        assert!(matches!(result, Err(DispatchError::Timeout)));
        assert!(table.is_empty());

        sweeper.abort();
    }
}
