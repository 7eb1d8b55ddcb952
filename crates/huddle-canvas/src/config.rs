//! Collaboration settings
//!
//! Tunables for batching, limits and idle handling. The server binary
//! deserializes this from its `[collaboration]` config table.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Collaboration core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationConfig {
    /// Debounce window for update batches in milliseconds
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Pending updates that force an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum concurrently live sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum participants in one session
    #[serde(default = "default_max_participants")]
    pub max_participants_per_session: usize,
    /// Silence after which a participant is treated as disconnected
    #[serde(default = "default_participant_timeout")]
    pub participant_timeout_secs: u64,
    /// Idle time after which an empty session is evicted
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    /// Interval of the idle sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long ended session ids are refused by `join`
    #[serde(default = "default_ended_retention")]
    pub ended_session_retention_secs: u64,
    /// Capacity of the broadcast channel feeding connections
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Largest inbound text frame accepted, in KiB
    #[serde(default = "default_max_message_size_kb")]
    pub max_message_size_kb: usize,
    /// Unsaved persistence writes kept per canvas before the oldest is dropped
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// Interval at which failed persistence writes are retried
    #[serde(default = "default_persistence_retry")]
    pub persistence_retry_secs: u64,
}

fn default_batch_window_ms() -> u64 {
    100
}

fn default_max_batch_size() -> usize {
    256
}

fn default_max_sessions() -> usize {
    100
}

fn default_max_participants() -> usize {
    50
}

fn default_participant_timeout() -> u64 {
    90
}

fn default_session_idle_timeout() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_ended_retention() -> u64 {
    3600
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_max_message_size_kb() -> usize {
    256
}

fn default_outbox_capacity() -> usize {
    512
}

fn default_persistence_retry() -> u64 {
    5
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            max_sessions: default_max_sessions(),
            max_participants_per_session: default_max_participants(),
            participant_timeout_secs: default_participant_timeout(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            ended_session_retention_secs: default_ended_retention(),
            broadcast_capacity: default_broadcast_capacity(),
            max_message_size_kb: default_max_message_size_kb(),
            outbox_capacity: default_outbox_capacity(),
            persistence_retry_secs: default_persistence_retry(),
        }
    }
}

impl CollaborationConfig {
    /// Configure the batch debounce window
    #[must_use]
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Configure the forced-flush batch size
    #[must_use]
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Configure maximum live sessions
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Configure maximum participants per session
    #[must_use]
    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants_per_session = max;
        self
    }

    /// Configure participant inactivity timeout
    #[must_use]
    pub fn with_participant_timeout(mut self, secs: u64) -> Self {
        self.participant_timeout_secs = secs;
        self
    }

    /// Configure the per-canvas persistence backlog limit
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Configure empty-session eviction timeout
    #[must_use]
    pub fn with_session_idle_timeout(mut self, secs: u64) -> Self {
        self.session_idle_timeout_secs = secs;
        self
    }

    /// Batch debounce window
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Sweeper interval
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Persistence retry interval
    #[must_use]
    pub fn persistence_retry(&self) -> Duration {
        Duration::from_secs(self.persistence_retry_secs)
    }

    /// Inbound frame limit in bytes
    #[must_use]
    pub fn max_message_bytes(&self) -> usize {
        self.max_message_size_kb.saturating_mul(1024)
    }

    /// Check settings that would stall or disable the pipeline
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_window_ms == 0 {
            return Err("collaboration.batch_window_ms must be greater than 0".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("collaboration.max_batch_size must be greater than 0".to_string());
        }
        if self.max_participants_per_session == 0 {
            return Err(
                "collaboration.max_participants_per_session must be greater than 0".to_string(),
            );
        }
        if self.broadcast_capacity == 0 {
            return Err("collaboration.broadcast_capacity must be greater than 0".to_string());
        }
        if self.outbox_capacity == 0 {
            return Err("collaboration.outbox_capacity must be greater than 0".to_string());
        }
        if self.persistence_retry_secs == 0 {
            return Err("collaboration.persistence_retry_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollaborationConfig::default();
        assert_eq!(config.batch_window(), Duration::from_millis(100));
        assert_eq!(config.max_message_bytes(), 256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: CollaborationConfig =
            serde_json::from_str(r#"{"batch_window_ms": 40}"#).unwrap();
        assert_eq!(config.batch_window_ms, 40);
        assert_eq!(config.max_sessions, 100);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = CollaborationConfig::default().with_batch_window(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
