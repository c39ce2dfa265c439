//! Reconnection pacing with exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(rename = "initial_backoff_ms", with = "crate::config::duration_millis")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(rename = "max_backoff_ms", with = "crate::config::duration_millis")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of attempts in a row (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt, or return early if `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {}ms before attempt {}",
            self.current_backoff.as_millis(),
            self.attempt
        );

        pause(self.current_backoff, cancel).await?;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);

        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a successful attempt)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting backoff after {} attempts", self.attempt);
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

/// `base` plus a uniformly random extra of up to `jitter`
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Sleep for `delay` unless cancelled first
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), ReconnectError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}
