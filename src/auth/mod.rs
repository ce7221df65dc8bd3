// Auth Gate: identity, permissions, and the relay-issued session token.
//
// Credential checks are never performed here - password logins are forwarded
// to the identity backend over the bus. The relay only issues and verifies
// its own reconnect JWT and evaluates permissions locally.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config;
use crate::dispatch::Dispatcher;
use crate::error::{AuthError, DispatchError, PermissionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Admin,
    SuperAdmin,
}

/// Authenticated principal attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub permissions: HashSet<String>,
    /// Tenant scope; `None` means platform-wide (super admins)
    #[serde(default)]
    pub tenant: Option<String>,
}

impl Identity {
    pub fn is_super_admin(&self) -> bool {
        self.role == Role::SuperAdmin
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub tenant: Option<String>,
    pub permissions: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(identity: &Identity) -> Self {
        let now = Utc::now();
        let expiry_hours = config::config().security.jwt_expiry_hours;
        let exp = (now + ChronoDuration::hours(expiry_hours as i64)).timestamp();

        Self {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            role: identity.role,
            tenant: identity.tenant.clone(),
            permissions: identity.permissions.iter().cloned().collect(),
            exp,
            iat: now.timestamp(),
        }
    }

    pub fn into_identity(self) -> Identity {
        Identity {
            user_id: self.sub,
            email: self.email,
            name: self.name,
            role: self.role,
            permissions: self.permissions.into_iter().collect(),
            tenant: self.tenant,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("JWT generation error: {0}")]
    Generation(String),
    #[error("JWT secret not configured")]
    MissingSecret,
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// Issue the relay's own reconnect token for an authenticated identity.
pub fn generate_token(identity: &Identity) -> Result<String, TokenError> {
    let secret = &config::config().security.jwt_secret;
    if secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }

    let claims = Claims::new(identity);
    let encoding_key = EncodingKey::from_secret(secret.as_bytes());

    encode(&Header::default(), &claims, &encoding_key)
        .map_err(|e| TokenError::Generation(e.to_string()))
}

/// Verify a relay-issued token and recover the identity it carries.
pub fn verify_token(token: &str) -> Result<Identity, TokenError> {
    let secret = &config::config().security.jwt_secret;
    if secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }

    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let token_data =
        decode::<Claims>(token, &decoding_key, &Validation::default()).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;

    Ok(token_data.claims.into_identity())
}

/// Verbs that only read state; everything else requires write permission.
const READ_VERBS: [&str; 5] = ["list", "get", "status", "stats", "search"];

/// Permission required for a `service.verb` action, e.g.
/// `organizations.create` -> `organizations:write`. Malformed actions return
/// `None`; the dispatcher rejects those with `InvalidRequestShape`.
pub fn required_permission(action: &str) -> Option<String> {
    let (service, verb) = action.split_once('.')?;
    if service.is_empty() || verb.is_empty() || verb.contains('.') {
        return None;
    }
    let level = if READ_VERBS.contains(&verb) { "read" } else { "write" };
    Some(format!("{}:{}", service, level))
}

/// Credentials accepted at the connection handshake.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Password { email: String, password: String },
    Token { token: String },
}

/// Front door for connections: delegates credential checks to the identity
/// backend, evaluates permissions locally.
pub struct AuthGate {
    dispatcher: Arc<Dispatcher>,
}

impl AuthGate {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Validate credentials. Passwords go to the identity backend over the
    /// bus (`admin.auth.login`); relay-issued tokens are checked locally.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<Identity, AuthError> {
        match credentials {
            Credentials::Token { token } => verify_token(&token).map_err(|e| match e {
                TokenError::Expired => AuthError::ExpiredToken,
                TokenError::MissingSecret => {
                    AuthError::Unreachable("token verification unavailable".to_string())
                }
                _ => AuthError::InvalidCredentials,
            }),
            Credentials::Password { email, password } => {
                let timeout = Duration::from_secs(config::config().relay.auth_timeout_secs);
                let response = self
                    .dispatcher
                    .request(
                        None,
                        None,
                        "auth.login",
                        json!({ "email": email, "password": password }),
                        timeout,
                    )
                    .await
                    .map_err(|e| match e {
                        DispatchError::Timeout | DispatchError::BusUnavailable(_) => {
                            AuthError::Unreachable(e.to_string())
                        }
                        other => AuthError::Unreachable(other.to_string()),
                    })?;

                if response["success"].as_bool() == Some(true) {
                    serde_json::from_value::<Identity>(response["data"].clone()).map_err(|e| {
                        tracing::error!("identity backend returned malformed identity: {}", e);
                        AuthError::Unreachable("malformed identity response".to_string())
                    })
                } else {
                    tracing::warn!("failed login attempt for {}", email);
                    Err(AuthError::InvalidCredentials)
                }
            }
        }
    }

    /// Pure, local permission check. Super admins bypass the permission set.
    pub fn authorize(identity: &Identity, action: &str) -> Result<(), PermissionError> {
        if identity.is_super_admin() {
            return Ok(());
        }

        let Some(required) = required_permission(action) else {
            // Shape errors are the dispatcher's to report
            return Ok(());
        };

        if identity.permissions.contains(&required) {
            Ok(())
        } else {
            Err(PermissionError {
                action: action.to_string(),
                required,
            })
        }
    }
}
