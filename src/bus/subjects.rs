//! Subject naming conventions shared with the backend services.
//!
//! Requests:   `<namespace>.<service>.<action>`        e.g. `admin.organizations.list`
//! Responses:  `<namespace>.<service>.response.<id>`   e.g. `admin.organizations.response.<uuid>`
//! Broadcasts: `<namespace>.broadcast.<topic>.<scope>` e.g. `admin.broadcast.organization_updates.tenant-1`

use uuid::Uuid;

/// Build the request subject for a validated `service.verb` action.
pub fn request_subject(namespace: &str, action: &str) -> String {
    format!("{}.{}", namespace, action)
}

/// Subject a backend replies on for a given correlation id.
pub fn response_subject(namespace: &str, service: &str, correlation_id: &Uuid) -> String {
    format!("{}.{}.response.{}", namespace, service, correlation_id)
}

/// Wildcard pattern covering every service's responses.
pub fn response_pattern(namespace: &str) -> String {
    format!("{}.*.response.*", namespace)
}

/// Wildcard pattern covering all broadcast topics and scopes.
pub fn broadcast_pattern(namespace: &str) -> String {
    format!("{}.broadcast.>", namespace)
}

/// Extract the correlation id from a response subject. Returns `None` for
/// subjects that do not follow the convention.
pub fn parse_response_subject(namespace: &str, subject: &str) -> Option<Uuid> {
    let rest = subject.strip_prefix(namespace)?.strip_prefix('.')?;
    let mut tokens = rest.split('.');
    let _service = tokens.next()?;
    if tokens.next()? != "response" {
        return None;
    }
    let id = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    Uuid::parse_str(id).ok()
}

/// Extract `(topic, scope)` from a broadcast subject.
pub fn parse_broadcast_subject(namespace: &str, subject: &str) -> Option<(String, String)> {
    let rest = subject.strip_prefix(namespace)?.strip_prefix('.')?;
    let rest = rest.strip_prefix("broadcast.")?;
    let (topic, scope) = rest.split_once('.')?;
    if topic.is_empty() || scope.is_empty() {
        return None;
    }
    Some((topic.to_string(), scope.to_string()))
}

/// NATS-style wildcard match: `*` matches exactly one token, `>` matches
/// one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            _ => return false,
        }
    }
}
