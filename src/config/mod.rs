use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub bus: BusConfig,
    pub relay: RelayConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Subject namespace prefix, e.g. `admin` in `admin.organizations.list`
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Default deadline for a dispatched request, in seconds
    pub default_timeout_secs: u64,
    /// How often the correlation table scans for expired entries
    pub sweep_interval_ms: u64,
    /// How long a fresh WebSocket connection may wait before authenticating
    pub handshake_timeout_secs: u64,
    /// Timeout for identity backend calls (login / token verify)
    pub auth_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Bus overrides
        if let Ok(v) = env::var("NATS_URL") {
            self.bus.url = v;
        }
        if let Ok(v) = env::var("NATS_USER") {
            self.bus.user = v;
        }
        if let Ok(v) = env::var("NATS_PASSWORD") {
            self.bus.password = v;
        }
        if let Ok(v) = env::var("NATS_NAMESPACE") {
            self.bus.namespace = v;
        }

        // Relay overrides
        if let Ok(v) = env::var("RELAY_DEFAULT_TIMEOUT_SECS") {
            self.relay.default_timeout_secs = v.parse().unwrap_or(self.relay.default_timeout_secs);
        }
        if let Ok(v) = env::var("RELAY_SWEEP_INTERVAL_MS") {
            self.relay.sweep_interval_ms = v.parse().unwrap_or(self.relay.sweep_interval_ms);
        }
        if let Ok(v) = env::var("RELAY_HANDSHAKE_TIMEOUT_SECS") {
            self.relay.handshake_timeout_secs =
                v.parse().unwrap_or(self.relay.handshake_timeout_secs);
        }
        if let Ok(v) = env::var("RELAY_AUTH_TIMEOUT_SECS") {
            self.relay.auth_timeout_secs = v.parse().unwrap_or(self.relay.auth_timeout_secs);
        }

        // Security overrides
        if let Ok(v) = env::var("SECURITY_JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            bus: BusConfig {
                url: "nats://localhost:4222".to_string(),
                user: "admin".to_string(),
                password: "htpi_nats_dev".to_string(),
                namespace: "admin".to_string(),
            },
            relay: RelayConfig {
                default_timeout_secs: 5,
                sweep_interval_ms: 250,
                handshake_timeout_secs: 10,
                auth_timeout_secs: 5,
            },
            security: SecurityConfig {
                jwt_secret: "dev-secret-key-change-in-production".to_string(),
                jwt_expiry_hours: 24,
                enable_cors: true,
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5001".to_string(),
                ],
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            bus: BusConfig {
                url: "nats://localhost:4222".to_string(),
                user: "admin".to_string(),
                password: String::new(),
                namespace: "admin".to_string(),
            },
            relay: RelayConfig {
                default_timeout_secs: 5,
                sweep_interval_ms: 250,
                handshake_timeout_secs: 10,
                auth_timeout_secs: 5,
            },
            security: SecurityConfig {
                // Must be supplied via SECURITY_JWT_SECRET
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
                enable_cors: true,
                cors_origins: vec!["https://admin-staging.htpi.example.com".to_string()],
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            bus: BusConfig {
                url: "nats://localhost:4222".to_string(),
                user: "admin".to_string(),
                password: String::new(),
                namespace: "admin".to_string(),
            },
            relay: RelayConfig {
                default_timeout_secs: 5,
                sweep_interval_ms: 250,
                handshake_timeout_secs: 5,
                auth_timeout_secs: 3,
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
                enable_cors: true,
                cors_origins: vec!["https://admin.htpi.example.com".to_string()],
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}
