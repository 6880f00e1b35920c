//! Session configuration loaded from environment variables.
//!
//! All settings have sensible defaults so a session can start with zero
//! configuration for local development.

use std::time::Duration;

use aparte_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, NEGOTIATION_TIMEOUT_SECS, POLL_INTERVAL_SECS, SUGGESTION_FLOOR,
    THRESHOLD_DECAY_PER_SEC, THRESHOLD_EPSILON, THRESHOLD_FLOOR, THRESHOLD_START,
    TYPING_IDLE_SECS,
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Embedding service endpoint (`POST {text} -> {embedding}`).
    /// Env: `EMBEDDING_URL`
    /// Default: `http://127.0.0.1:8091/embed`
    pub embedding_url: String,

    /// ICE provisioning endpoint (`GET -> ice server list`).
    /// Env: `ICE_URL`
    /// Default: none (STUN-only fallback configuration).
    pub ice_url: Option<String>,

    /// Block-list provider endpoint (`GET ?user=<hex>`).
    /// Env: `BLOCKLIST_URL`
    /// Default: none (block sets read from the shared store).
    pub blocklist_url: Option<String>,

    /// Similarity threshold when entering the queue.
    pub threshold_start: f32,

    /// Similarity threshold floor.
    pub threshold_floor: f32,

    /// Linear threshold decay per second of waiting.
    pub threshold_decay_per_sec: f32,

    /// Minimum similarity for a fallback suggestion.
    pub suggestion_floor: f32,

    /// Matchmaking poll interval.
    pub poll_interval: Duration,

    /// Queue-entry heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Typing indicator idle timeout.
    pub typing_idle: Duration,

    /// How long a room may negotiate before it is abandoned and the user
    /// returns to the queue.
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            embedding_url: "http://127.0.0.1:8091/embed".to_string(),
            ice_url: None,
            blocklist_url: None,
            threshold_start: THRESHOLD_START,
            threshold_floor: THRESHOLD_FLOOR,
            threshold_decay_per_sec: THRESHOLD_DECAY_PER_SEC,
            suggestion_floor: SUGGESTION_FLOOR,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            typing_idle: Duration::from_secs(TYPING_IDLE_SECS),
            negotiation_timeout: Duration::from_secs(NEGOTIATION_TIMEOUT_SECS),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("EMBEDDING_URL") {
            if !url.is_empty() {
                config.embedding_url = url;
            }
        }

        if let Ok(url) = std::env::var("ICE_URL") {
            if !url.is_empty() {
                config.ice_url = Some(url);
            }
        }

        if let Ok(url) = std::env::var("BLOCKLIST_URL") {
            if !url.is_empty() {
                config.blocklist_url = Some(url);
            }
        }

        if let Ok(val) = std::env::var("NEGOTIATION_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.negotiation_timeout = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid NEGOTIATION_TIMEOUT_SECS, using default")
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The acceptance threshold after `elapsed` time in the queue: linear
    /// decay from the strict start value to the floor. Never goes below
    /// the floor.
    pub fn acceptance_threshold(&self, elapsed: Duration) -> f32 {
        let decayed = self.threshold_start - elapsed.as_secs_f32() * self.threshold_decay_per_sec;
        decayed.max(self.threshold_floor)
    }

    /// Whether the threshold has decayed all the way down (within the
    /// comparison epsilon), which is when suggestion queries start.
    pub fn at_floor(&self, threshold: f32) -> bool {
        threshold <= self.threshold_floor + THRESHOLD_EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_decays_monotonically_to_floor() {
        let config = SessionConfig::default();

        let mut previous = f32::MAX;
        for secs in 0..120 {
            let t = config.acceptance_threshold(Duration::from_secs(secs));
            assert!(t <= previous, "threshold must never increase");
            assert!(
                t >= config.threshold_floor,
                "threshold must never drop below the floor"
            );
            previous = t;
        }

        assert_eq!(
            config.acceptance_threshold(Duration::ZERO),
            config.threshold_start
        );
        assert_eq!(
            config.acceptance_threshold(Duration::from_secs(3600)),
            config.threshold_floor
        );
    }

    #[test]
    fn floor_detection_uses_epsilon() {
        let config = SessionConfig::default();
        assert!(config.at_floor(config.threshold_floor));
        assert!(config.at_floor(config.threshold_floor + THRESHOLD_EPSILON / 2.0));
        assert!(!config.at_floor(config.threshold_start));
    }

    #[test]
    fn default_reaches_floor_in_thirty_seconds() {
        let config = SessionConfig::default();
        let t = config.acceptance_threshold(Duration::from_secs(30));
        assert!((t - config.threshold_floor).abs() < 1e-4);
    }
}
