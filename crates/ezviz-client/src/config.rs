//! Session configuration

use crate::reconnect::ReconnectConfig;
use ezviz_proto::MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and retry settings for the session orchestrator
///
/// Every field has a default, so a config file only needs to name the values
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A media session with no packet for this long is treated as closed
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// TCP connect bound, for both relay tiers and the directory probe
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Overall wait for the directory server's redirect
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,
    /// Pause between a media session ending and the next negotiation
    #[serde(rename = "reconnect_delay_ms", with = "duration_millis")]
    pub reconnect_delay: Duration,
    /// Random extra added to `reconnect_delay`
    #[serde(rename = "reconnect_jitter_ms", with = "duration_millis")]
    pub reconnect_jitter: Duration,
    pub auth_backoff: ReconnectConfig,
    pub negotiation_backoff: ReconnectConfig,
    /// Log in again once the session token is this old
    #[serde(with = "duration_secs")]
    pub max_token_age: Duration,
    /// Bound on every cloud API request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Largest accepted packet payload
    pub max_payload: usize,
}

/// Helper module for serializing Duration as seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for serializing Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_millis(500),
            reconnect_jitter: Duration::from_millis(500),
            auth_backoff: ReconnectConfig::default(),
            negotiation_backoff: ReconnectConfig {
                max_backoff: Duration::from_secs(15),
                ..ReconnectConfig::default()
            },
            max_token_age: Duration::from_secs(6 * 60 * 60),
            request_timeout: Duration::from_secs(15),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Check values that would make the orchestrator misbehave
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than zero".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        if self.negotiation_timeout.is_zero() {
            return Err("negotiation_timeout must be greater than zero".to_string());
        }
        if self.max_token_age.is_zero() {
            return Err("max_token_age must be greater than zero".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than zero".to_string());
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_SIZE {
            return Err(format!(
                "max_payload must be between 1 and {}",
                MAX_PAYLOAD_SIZE
            ));
        }
        validate_backoff("auth_backoff", &self.auth_backoff)?;
        validate_backoff("negotiation_backoff", &self.negotiation_backoff)?;
        Ok(())
    }
}

fn validate_backoff(name: &str, backoff: &ReconnectConfig) -> Result<(), String> {
    if backoff.initial_backoff > backoff.max_backoff {
        return Err(format!("{}: initial backoff exceeds max backoff", name));
    }
    if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
        return Err(format!("{}: multiplier must be at least 1.0", name));
    }
    Ok(())
}

/// Builder for SessionConfig
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration, jitter: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self.config.reconnect_jitter = jitter;
        self
    }

    pub fn auth_backoff(mut self, backoff: ReconnectConfig) -> Self {
        self.config.auth_backoff = backoff;
        self
    }

    pub fn negotiation_backoff(mut self, backoff: ReconnectConfig) -> Self {
        self.config.negotiation_backoff = backoff;
        self
    }

    pub fn max_token_age(mut self, age: Duration) -> Self {
        self.config.max_token_age = age;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    pub fn build(self) -> Result<SessionConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
