// Message bus boundary - the relay's only transport to backend services
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

pub mod subjects;

/// A raw message received from a bus subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },
}

/// Publish/subscribe transport. The production implementation is NATS;
/// tests swap in an in-memory bus behind the same trait.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a subject pattern (NATS wildcards: `*` one token,
    /// `>` the remainder).
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError>;

    fn is_connected(&self) -> bool;
}

/// NATS-backed bus client.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect with user/password auth. The bus is a hard dependency:
    /// callers are expected to abort startup on failure rather than fall
    /// back to canned data.
    pub async fn connect(url: &str, user: &str, password: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .user_and_password(user.to_string(), password.to_string())
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        tracing::info!("Connected to NATS at {}", url);
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        // Publishes are buffered client-side; flush so a dead connection
        // surfaces here instead of silently queueing.
        self.client.flush().await.map_err(|e| BusError::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!("Published to {}", subject);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError> {
        let subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        Ok(subscriber
            .map(|msg| BusMessage {
                subject: msg.subject.to_string(),
                payload: msg.payload,
            })
            .boxed())
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}
