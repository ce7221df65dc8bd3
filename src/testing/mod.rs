// Test utilities: an in-memory bus and identity/session fixtures
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::bus::{subjects, BusError, BusMessage, MessageBus};
use crate::session::{PushEvent, Session};

pub const TEST_USER_ID: &str = "user-ada";

/// Broadcast-channel bus standing in for NATS. Supports the same wildcard
/// subscriptions, records everything published, and can simulate an outage.
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
    published: Mutex<Vec<BusMessage>>,
    connected: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Everything the relay published, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    /// Deliver a message to subscribers as if a backend published it.
    pub fn inject(&self, subject: &str, payload: Bytes) {
        let _ = self.tx.send(BusMessage {
            subject: subject.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Publish {
                subject: subject.to_string(),
                reason: "connection closed".to_string(),
            });
        }
        let msg = BusMessage {
            subject: subject.to_string(),
            payload,
        };
        self.published.lock().unwrap().push(msg.clone());
        let _ = self.tx.send(msg);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let rx = self.tx.subscribe();
        let pattern = pattern.to_string();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg: &BusMessage| {
            futures::future::ready(subjects::subject_matches(&pattern, &msg.subject))
        });
        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Spawn a scripted backend: answers every request matching `pattern` by
/// publishing `reply(request)` on the conventional response subject.
pub async fn spawn_responder<F>(
    bus: Arc<MemoryBus>,
    pattern: &str,
    reply: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
{
    let mut subscription = bus
        .subscribe(pattern)
        .await
        .expect("memory bus subscribe cannot fail");

    tokio::spawn(async move {
        while let Some(msg) = subscription.next().await {
            let Ok(request) = serde_json::from_slice::<Value>(&msg.payload) else {
                continue;
            };
            let Some(correlation_id) = request["request_id"]
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let mut tokens = msg.subject.split('.');
            let (Some(namespace), Some(service)) = (tokens.next(), tokens.next()) else {
                continue;
            };

            if let Some(body) = reply(request.clone()) {
                let subject = subjects::response_subject(namespace, service, &correlation_id);
                let payload = Bytes::from(serde_json::to_vec(&body).unwrap());
                let _ = bus.publish(&subject, payload).await;
            }
        }
    })
}

pub fn identity_with(tenant: &str, permissions: &[&str]) -> Identity {
    Identity {
        user_id: TEST_USER_ID.to_string(),
        email: "ada@htpi.io".to_string(),
        name: "Ada Admin".to_string(),
        role: Role::Admin,
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        tenant: Some(tenant.to_string()),
    }
}

pub fn super_admin_identity() -> Identity {
    Identity {
        user_id: "user-root".to_string(),
        email: "root@htpi.io".to_string(),
        name: "Platform Root".to_string(),
        role: Role::SuperAdmin,
        permissions: Default::default(),
        tenant: None,
    }
}

pub fn session_for_tenant(tenant: &str) -> (Session, mpsc::UnboundedReceiver<PushEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(identity_with(tenant, &[]), tx), rx)
}

pub fn super_admin_session() -> (Session, mpsc::UnboundedReceiver<PushEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(super_admin_identity(), tx), rx)
}

/// An already-Active session with the given permissions.
pub fn active_session(
    tenant: &str,
    permissions: &[&str],
) -> (Session, mpsc::UnboundedReceiver<PushEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(identity_with(tenant, permissions), tx);
    session.activate();
    (session, rx)
}
