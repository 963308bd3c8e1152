//! Runtime configuration for hubs, presence tracking and the server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use labsync_core::CollabError;

/// Heartbeat and liveness thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Interval clients are expected to `touch` at
    pub heartbeat_interval: Duration,
    /// Silence after which a member is considered offline
    pub timeout: Duration,
    /// How often the maintenance task sweeps (≤ heartbeat_interval)
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90), // 3 missed heartbeats
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl PresenceConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(50),
        }
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(CollabError::InvalidConfig(
                "presence intervals must be non-zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval > self.heartbeat_interval {
            return Err(CollabError::InvalidConfig(
                "sweep_interval must be in (0, heartbeat_interval]".into(),
            ));
        }
        Ok(())
    }
}

/// Per-session hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Durable event channel capacity (events buffered per subscriber)
    pub durable_capacity: usize,
    /// Ephemeral event channel capacity; lagging subscribers drop silently
    pub ephemeral_capacity: usize,
    /// Maximum actions fetched from the store in one forward-fill
    pub refetch_batch: usize,
    pub presence: PresenceConfig,
    /// Run the sweep/autosave task when a hub is created by the registry
    pub spawn_maintenance: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            durable_capacity: 256,
            ephemeral_capacity: 64,
            refetch_batch: 10_000,
            presence: PresenceConfig::default(),
            spawn_maintenance: true,
        }
    }
}

impl HubConfig {
    /// Small buffers, fast presence, no background task.
    pub fn for_testing() -> Self {
        Self {
            durable_capacity: 16,
            ephemeral_capacity: 8,
            refetch_batch: 1000,
            presence: PresenceConfig::for_testing(),
            spawn_maintenance: false,
        }
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.durable_capacity == 0 || self.ephemeral_capacity == 0 {
            return Err(CollabError::InvalidConfig("channel capacity must be > 0".into()));
        }
        if self.refetch_batch == 0 {
            return Err(CollabError::InvalidConfig("refetch_batch must be > 0".into()));
        }
        self.presence.validate()
    }
}

/// WebSocket server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
    /// Largest voice-note / annotation upload in bytes. Must leave room for
    /// the frame header inside `max_frame_bytes`.
    pub max_upload_bytes: usize,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_bytes: 16 * 1024 * 1024, // 16MB
            max_upload_bytes: 8 * 1024 * 1024, // 8MB
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_frame_bytes: 256 * 1024,
            max_upload_bytes: 64 * 1024,
            hub: HubConfig::for_testing(),
        }
    }

    pub fn validate(&self) -> Result<(), CollabError> {
        if self.max_upload_bytes >= self.max_frame_bytes {
            return Err(CollabError::InvalidConfig(format!(
                "max_upload_bytes ({}) must be below max_frame_bytes ({})",
                self.max_upload_bytes, self.max_frame_bytes
            )));
        }
        self.hub.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_defaults() {
        let p = PresenceConfig::default();
        assert_eq!(p.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(p.timeout, Duration::from_secs(90));
        assert!(p.sweep_interval <= p.heartbeat_interval);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_presence_rejects_slow_sweep() {
        let p = PresenceConfig {
            sweep_interval: Duration::from_secs(60),
            ..PresenceConfig::default()
        };
        assert!(matches!(p.validate(), Err(CollabError::InvalidConfig(_))));
    }

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.durable_capacity, 256);
        assert_eq!(config.ephemeral_capacity, 64);
        assert!(config.spawn_maintenance);
        assert!(config.validate().is_ok());
        assert!(HubConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_hub_config_rejects_zero_capacity() {
        let config = HubConfig { durable_capacity: 0, ..HubConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert!(config.validate().is_ok());
        assert!(ServerConfig::for_testing("127.0.0.1:0").validate().is_ok());
    }

    #[test]
    fn test_server_config_upload_must_fit_in_frame() {
        let config = ServerConfig {
            max_upload_bytes: 2 * 1024 * 1024,
            max_frame_bytes: 1024 * 1024,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(CollabError::InvalidConfig(_))));
    }
}
