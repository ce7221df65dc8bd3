// Relay wiring - shared state handed to the HTTP/WebSocket layer
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthGate;
use crate::bus::{BusError, MessageBus};
use crate::config;
use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatcher;
use crate::router::InboundRouter;
use crate::session::SessionRegistry;

/// Everything a connection needs: the registry, the correlation table, the
/// dispatcher, and the auth gate, all sharing one bus client.
pub struct RelayState {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<SessionRegistry>,
    pub table: Arc<CorrelationTable>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: AuthGate,
}

impl RelayState {
    pub fn new(bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let cfg = config::config();
        let registry = Arc::new(SessionRegistry::new());
        let table = Arc::new(CorrelationTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&table),
            &cfg.bus.namespace,
        ));
        let auth = AuthGate::new(Arc::clone(&dispatcher));

        Arc::new(Self {
            bus,
            registry,
            table,
            dispatcher,
            auth,
        })
    }

    /// Start the background machinery: inbound router loops and the
    /// correlation timeout sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<(), BusError> {
        let cfg = config::config();

        let router = Arc::new(InboundRouter::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.table),
            Arc::clone(&self.registry),
            &cfg.bus.namespace,
        ));
        router.run().await?;

        let _sweeper = self
            .table
            .spawn_sweeper(Duration::from_millis(cfg.relay.sweep_interval_ms));
        Ok(())
    }

    /// Default deadline for dispatched requests.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(config::config().relay.default_timeout_secs)
    }

    /// Tear down a session: drop it from the registry and cancel its
    /// pending requests so late responses become no-ops.
    pub fn drop_session(&self, session_id: uuid::Uuid) {
        let cancelled = self.table.cancel_session(session_id);
        if cancelled > 0 {
            tracing::debug!(
                session_id = %session_id,
                cancelled,
                "cancelled pending requests on disconnect"
            );
        }
        let _ = self.registry.unregister(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::error::{AuthError, DispatchError};
    use crate::testing::{self, MemoryBus};
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    async fn started_relay(bus: &Arc<MemoryBus>) -> Arc<RelayState> {
        let state = RelayState::new(Arc::clone(bus) as Arc<dyn MessageBus>);
        state.start().await.unwrap();
        state
    }

    #[tokio::test]
    async fn login_round_trip_through_the_identity_backend() -> anyhow::Result<()> {
        let bus = Arc::new(MemoryBus::new());
        let state = started_relay(&bus).await;

        let _identity_backend =
            testing::spawn_responder(Arc::clone(&bus), "admin.auth.login", |request| {
                if request["email"] == "ada@htpi.io" && request["password"] == "correct" {
                    Some(json!({
                        "success": true,
                        "data": {
                            "user_id": "user-ada",
                            "email": "ada@htpi.io",
                            "name": "Ada Admin",
                            "role": "admin",
                            "permissions": ["organizations:read"],
                            "tenant": "tenant-1"
                        }
                    }))
                } else {
                    Some(json!({
                        "success": false,
                        "error": {"code": "INVALID_CREDENTIALS", "message": "bad login"}
                    }))
                }
            })
            .await;

        let identity = state
            .auth
            .authenticate(Credentials::Password {
                email: "ada@htpi.io".to_string(),
                password: "correct".to_string(),
            })
            .await?;
        assert_eq!(identity.user_id, "user-ada");
        assert_eq!(identity.tenant.as_deref(), Some("tenant-1"));

        let denied = state
            .auth
            .authenticate(Credentials::Password {
                email: "ada@htpi.io".to_string(),
                password: "wrong".to_string(),
            })
            .await;
        assert!(matches!(denied, Err(AuthError::InvalidCredentials)));
        Ok(())
    }

    #[tokio::test]
    async fn bus_outage_makes_the_identity_backend_unreachable() {
        let bus = Arc::new(MemoryBus::new());
        let state = started_relay(&bus).await;
        bus.set_connected(false);

        let result = state
            .auth
            .authenticate(Credentials::Password {
                email: "ada@htpi.io".to_string(),
                password: "correct".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AuthError::Unreachable(_))));
        assert!(state.table.is_empty());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_and_late_responses_are_dropped() {
        let bus = Arc::new(MemoryBus::new());
        let state = started_relay(&bus).await;

        let (session, _rx) = testing::active_session("tenant-1", &["claims:read"]);
        let session = Arc::new(session);
        state.registry.register(Arc::clone(&session));

        // Dispatch a request nobody will answer, then drop the session
        let dispatcher = Arc::clone(&state.dispatcher);
        let s = Arc::clone(&session);
        let pending = tokio::spawn(async move {
            dispatcher
                .dispatch(&s, "claims.get", json!({"claim_id": "c-1"}), Duration::from_secs(30))
                .await
        });

        // Wait for the request to hit the wire
        let request = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(msg) = bus.published().first().cloned() {
                    break msg;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        state.drop_session(session.session_id);
        assert!(matches!(
            pending.await.unwrap(),
            Err(DispatchError::Cancelled)
        ));
        assert!(state.table.is_empty());
        assert!(state.registry.is_empty());

        // A late backend response for the cancelled id is a silent no-op
        let parsed: serde_json::Value = serde_json::from_slice(&request.payload).unwrap();
        let correlation_id = parsed["request_id"].as_str().unwrap();
        bus.inject(
            &format!("admin.claims.response.{}", correlation_id),
            Bytes::from(serde_json::to_vec(&json!({"success": true})).unwrap()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.table.is_empty());
    }

    #[tokio::test]
    async fn two_subscribers_same_scope_both_receive_a_broadcast() {
        let bus = Arc::new(MemoryBus::new());
        let state = started_relay(&bus).await;

        let subscribe = |tenant: &str| {
            let (session, rx) = testing::session_for_tenant(tenant);
            session.activate();
            session.subscribe(vec!["organization_updates".to_string()]);
            let session = Arc::new(session);
            state.registry.register(Arc::clone(&session));
            (session, rx)
        };

        let (_s1, mut rx1) = subscribe("tenant-1");
        let (_s2, mut rx2) = subscribe("tenant-1");
        let (_s3, mut rx3) = subscribe("tenant-2");

        bus.inject(
            "admin.broadcast.organization_updates.tenant-1",
            Bytes::from(serde_json::to_vec(&json!({"org": "o-1"})).unwrap()),
        );

        let e1 = tokio::time::timeout(Duration::from_secs(2), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let e2 = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1.payload["org"], "o-1");
        assert_eq!(e2.payload["org"], "o-1");

        // Other tenant saw nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx3.try_recv().is_err());
    }
}
