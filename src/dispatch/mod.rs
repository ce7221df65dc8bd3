// Outbound Dispatcher - turns a UI action into an addressed bus request and
// hands back the eventual response
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::auth::Identity;
use crate::bus::{subjects, MessageBus};
use crate::correlation::CorrelationTable;
use crate::error::DispatchError;
use crate::session::Session;

/// Fields the relay stamps itself. A client supplying any of these is
/// trying to spoof identity context and is rejected before publish.
pub const RESERVED_FIELDS: [&str; 6] = [
    "created_by",
    "createdBy",
    "request_id",
    "requestId",
    "tenant_id",
    "tenantId",
];

/// Identity fields merged into every dispatched payload.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant: Option<String>,
}

impl From<&Identity> for AuthContext {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            tenant: identity.tenant.clone(),
        }
    }
}

pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    table: Arc<CorrelationTable>,
    namespace: String,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, table: Arc<CorrelationTable>, namespace: &str) -> Self {
        Self {
            bus,
            table,
            namespace: namespace.to_string(),
        }
    }

    /// Dispatch a session-originated action and await the response.
    pub async fn dispatch(
        &self,
        session: &Session,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        if !session.is_active() {
            tracing::debug!(session_id = %session.session_id, "dispatch from non-active session");
            return Err(DispatchError::Cancelled);
        }

        let ctx = AuthContext::from(&session.identity);
        self.request(Some(session.session_id), Some(&ctx), action, payload, timeout)
            .await
    }

    /// Low-level request path, also used pre-session by the Auth Gate.
    /// Validates shape, merges auth context, publishes, and awaits the
    /// correlation table verdict.
    pub async fn request(
        &self,
        session_id: Option<Uuid>,
        auth: Option<&AuthContext>,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        validate_action(action)?;
        let mut body = into_object(payload)?;

        for field in RESERVED_FIELDS {
            if body.contains_key(field) {
                return Err(DispatchError::InvalidRequestShape(format!(
                    "field '{}' is reserved and set by the relay",
                    field
                )));
            }
        }

        let correlation_id = Uuid::new_v4();
        body.insert("request_id".to_string(), json!(correlation_id));
        body.insert("issued_at".to_string(), json!(Utc::now().to_rfc3339()));
        if let Some(ctx) = auth {
            body.insert("created_by".to_string(), json!(ctx.user_id));
            if let Some(tenant) = &ctx.tenant {
                body.insert("tenant_id".to_string(), json!(tenant));
            }
        }

        let bytes = serde_json::to_vec(&Value::Object(body))
            .map(Bytes::from)
            .map_err(|e| DispatchError::InvalidRequestShape(e.to_string()))?;

        let subject = subjects::request_subject(&self.namespace, action);
        let waiter = self.table.insert(correlation_id, session_id, &subject, timeout);

        tracing::debug!(
            correlation_id = %correlation_id,
            subject = %subject,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching request"
        );

        if let Err(e) = self.bus.publish(&subject, bytes).await {
            // Not queued: surface immediately and drop the pending entry
            self.table.abort(correlation_id);
            tracing::error!("publish to {} failed: {}", subject, e);
            return Err(DispatchError::BusUnavailable(e.to_string()));
        }

        waiter.wait().await
    }
}

/// Actions must be `service.verb`, both tokens `[a-z0-9_]`.
fn validate_action(action: &str) -> Result<(), DispatchError> {
    let valid = action.split_once('.').is_some_and(|(service, verb)| {
        !service.is_empty()
            && !verb.is_empty()
            && !verb.contains('.')
            && service
                .chars()
                .chain(verb.chars())
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    });

    if valid {
        Ok(())
    } else {
        Err(DispatchError::InvalidRequestShape(format!(
            "action '{}' is not of the form service.verb",
            action
        )))
    }
}

fn into_object(payload: Value) -> Result<Map<String, Value>, DispatchError> {
    match payload {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(DispatchError::InvalidRequestShape(format!(
            "payload must be a JSON object, got {}",
            match other {
                Value::Array(_) => "array",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                Value::Bool(_) => "boolean",
                _ => "null",
            }
        ))),
    }
}
