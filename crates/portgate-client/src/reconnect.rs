//! Reconnection backoff
//!
//! The agent reconnects when the relay goes away. Delays grow
//! geometrically up to a cap; a successful session resets the schedule.

use crate::error::AgentError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None means keep trying forever.
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Tracks the delay schedule between connection attempts.
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Sleep out the current delay, then escalate it for next time.
    pub async fn wait(&mut self) -> Result<(), AgentError> {
        self.attempt += 1;
        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return Err(AgentError::AttemptsExhausted(max));
            }
        }

        debug!(
            attempt = self.attempt,
            delay_ms = self.delay.as_millis() as u64,
            "waiting before reconnect"
        );
        sleep(self.delay).await;

        let next = Duration::from_secs_f64(self.delay.as_secs_f64() * self.config.multiplier);
        self.delay = next.min(self.config.max_delay);
        Ok(())
    }

    /// Call once a session is established so a later drop starts fresh.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
