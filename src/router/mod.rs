// Inbound Router - consumes bus responses and broadcast events
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;

use crate::bus::{subjects, BusError, MessageBus};
use crate::correlation::CorrelationTable;
use crate::session::{PushEvent, SessionRegistry};

pub struct InboundRouter {
    bus: Arc<dyn MessageBus>,
    table: Arc<CorrelationTable>,
    registry: Arc<SessionRegistry>,
    namespace: String,
}

impl InboundRouter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        table: Arc<CorrelationTable>,
        registry: Arc<SessionRegistry>,
        namespace: &str,
    ) -> Self {
        Self {
            bus,
            table,
            registry,
            namespace: namespace.to_string(),
        }
    }

    /// Subscribe to the response and broadcast wildcards and spawn one
    /// consuming task per stream.
    pub async fn run(self: Arc<Self>) -> Result<(), BusError> {
        let response_pattern = subjects::response_pattern(&self.namespace);
        let broadcast_pattern = subjects::broadcast_pattern(&self.namespace);

        let mut responses = self.bus.subscribe(&response_pattern).await?;
        let mut broadcasts = self.bus.subscribe(&broadcast_pattern).await?;
        tracing::info!(
            "inbound router listening on {} and {}",
            response_pattern,
            broadcast_pattern
        );

        let router = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(msg) = responses.next().await {
                router.on_response(&msg.subject, &msg.payload);
            }
            tracing::warn!("response subscription closed");
        });

        let router = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(msg) = broadcasts.next().await {
                router.on_broadcast(&msg.subject, &msg.payload);
            }
            tracing::warn!("broadcast subscription closed");
        });

        Ok(())
    }

    /// Resolve a backend response against the correlation table. Unknown or
    /// late ids are dropped - the caller already timed out or disconnected.
    pub fn on_response(&self, subject: &str, payload: &Bytes) {
        let Some(correlation_id) = subjects::parse_response_subject(&self.namespace, subject)
        else {
            tracing::warn!("response on unconventional subject {}, dropping", subject);
            return;
        };

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "undecodable response payload on {}: {}",
                    subject,
                    e
                );
                return;
            }
        };

        if !self.table.resolve(correlation_id, value) {
            tracing::debug!(
                correlation_id = %correlation_id,
                "late or unknown response on {}, dropping",
                subject
            );
        }
    }

    /// Fan a broadcast out to every Active session subscribed to its topic
    /// with a matching scope. One dead session never blocks the rest.
    pub fn on_broadcast(&self, subject: &str, payload: &Bytes) {
        let Some((topic, scope)) = subjects::parse_broadcast_subject(&self.namespace, subject)
        else {
            tracing::warn!("broadcast on unconventional subject {}, dropping", subject);
            return;
        };

        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("undecodable broadcast payload on {}: {}", subject, e);
                return;
            }
        };

        let sessions = self.registry.sessions_for(&topic, &scope);
        tracing::debug!(
            topic = %topic,
            scope = %scope,
            recipients = sessions.len(),
            "fanning out broadcast"
        );

        for session in sessions {
            let delivered = session.push(PushEvent {
                topic: topic.clone(),
                payload: value.clone(),
            });
            if !delivered {
                tracing::debug!(
                    session_id = %session.session_id,
                    "broadcast push failed, connection closing"
                );
            }
        }
    }
}
