use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::websocket::{DeliveryPolicy, RetryPolicy};

/// Prefix shared by every environment variable the service reads
pub const ENV_PREFIX: &str = "NOTIFY_";

const MIN_JWT_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// HS256 secret shared with the auth routes that issue tokens
    pub jwt_secret: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before each resend, in milliseconds (comma separated in the environment)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: Vec<u64>,
    /// Events pushed with `requireAck = true`
    #[serde(default = "default_ack_events")]
    pub ack_events: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> Vec<u64> {
    vec![1_000, 3_000, 10_000]
}

fn default_ack_events() -> Vec<String> {
    vec![
        "notification".to_string(),
        "result:published".to_string(),
        "exam:auto-submitted".to_string(),
    ]
}

impl Config {
    /// Load from `NOTIFY_*` environment variables, reading `.env` first when present
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let config: Config = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(AppError::Config(format!(
                "NOTIFY_JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_LEN
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(AppError::Config(
                "NOTIFY_HEARTBEAT_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.retry_backoff_ms.is_empty() {
            return Err(AppError::Config(
                "NOTIFY_RETRY_BACKOFF_MS must list at least one delay".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::new(self.ack_events.iter().cloned())
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}
