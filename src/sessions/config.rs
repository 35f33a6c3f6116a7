//! Runtime tuning for sessions.
//!
//! | Config Type | Purpose | Presets |
//! |-------------|---------|---------|
//! | `SyncConfig` | handshake and resend timing | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | per-connection housekeeping | `deterministic(seed)` |
//! | `SpectatorConfig` | spectator input buffering | |
//!
//! ```
//! use rollback_netplay::{ProtocolConfig, SyncConfig};
//!
//! let sync = SyncConfig::lan();
//! assert!(sync.validate().is_ok());
//! let protocol = ProtocolConfig::deterministic(7);
//! assert_eq!(protocol.protocol_rng_seed, Some(7));
//! ```

use web_time::Duration;

use crate::NetplayError;

fn out_of_range(field: &str, range: &str, actual: impl std::fmt::Display) -> NetplayError {
    NetplayError::InvalidRequest {
        info: format!("{field} must be within {range}, got {actual}"),
    }
}

/// Handshake and resend timing of every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Handshake round trips required before a connection is synchronized.
    pub num_sync_packets: u32,
    /// Delay before an unanswered handshake request is repeated.
    pub sync_retry_interval: Duration,
    /// Emit `NetplayEvent::SyncTimeout` once if the handshake takes longer than
    /// this. The handshake keeps retrying either way.
    pub sync_timeout: Option<Duration>,
    /// Unacknowledged input is resent after this long without receiving input.
    pub running_retry_interval: Duration,
    /// A keep-alive is sent after this long without sending anything.
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            sync_timeout: None,
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Same as [`SyncConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Fewer round trips and faster retries for local networks.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_retry_interval: Duration::from_millis(100),
            sync_timeout: Some(Duration::from_secs(5)),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// Slower retries for connections with 100ms+ round trips.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(400),
            sync_timeout: Some(Duration::from_secs(10)),
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// More round trips so a lucky streak of delivered packets is not mistaken
    /// for a healthy link.
    pub fn lossy() -> Self {
        Self {
            num_sync_packets: 8,
            sync_timeout: Some(Duration::from_secs(10)),
            ..Self::default()
        }
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if !(1..=100).contains(&self.num_sync_packets) {
            return Err(out_of_range(
                "num_sync_packets",
                "1..=100",
                self.num_sync_packets,
            ));
        }
        let intervals = [
            ("sync_retry_interval", self.sync_retry_interval),
            ("running_retry_interval", self.running_retry_interval),
            ("keepalive_interval", self.keepalive_interval),
        ];
        for (field, interval) in intervals {
            if interval < Duration::from_millis(1) || interval > Duration::from_secs(10) {
                return Err(out_of_range(
                    field,
                    "1ms..=10s",
                    format!("{}ms", interval.as_millis()),
                ));
            }
        }
        if self.sync_timeout == Some(Duration::ZERO) {
            return Err(out_of_range("sync_timeout", "None or > 0ms", "0ms"));
        }
        Ok(())
    }
}

/// Per-connection housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// How often a running connection measures round-trip time.
    pub quality_report_interval: Duration,
    /// How often the send rate in [`NetworkStats`](crate::NetworkStats) is
    /// recomputed.
    pub network_stats_interval: Duration,
    /// How long a disconnected connection lingers before it stops sending
    /// altogether.
    pub shutdown_delay: Duration,
    /// A peer with more unacknowledged input frames than this is disconnected.
    pub pending_output_limit: usize,
    /// Seed for handshake nonces and the connection magic. `None` draws from
    /// process entropy.
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(200),
            network_stats_interval: Duration::from_millis(1000),
            shutdown_delay: Duration::from_millis(5000),
            pending_output_limit: 128,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Same as [`ProtocolConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with a fixed random seed, for reproducible tests.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Checks every field against its allowed range.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] naming the first offending field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        let intervals = [
            (
                "quality_report_interval",
                self.quality_report_interval,
                Duration::from_secs(10),
            ),
            (
                "network_stats_interval",
                self.network_stats_interval,
                Duration::from_secs(60),
            ),
            (
                "shutdown_delay",
                self.shutdown_delay,
                Duration::from_secs(300),
            ),
        ];
        for (field, interval, max) in intervals {
            if interval < Duration::from_millis(1) || interval > max {
                return Err(out_of_range(
                    field,
                    &format!("1ms..={}ms", max.as_millis()),
                    format!("{}ms", interval.as_millis()),
                ));
            }
        }
        if !(1..=4096).contains(&self.pending_output_limit) {
            return Err(out_of_range(
                "pending_output_limit",
                "1..=4096",
                self.pending_output_limit,
            ));
        }
        Ok(())
    }
}

/// Input buffering on the spectator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SpectatorConfig has no effect unless passed to SessionBuilder::with_spectator_config()"]
pub struct SpectatorConfig {
    /// Capacity of the ring of confirmed frames received from the host. The
    /// spectator can fall at most this many frames behind.
    pub buffer_size: usize,
}

impl Default for SpectatorConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

impl SpectatorConfig {
    /// Checks that the ring is usable.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if `buffer_size` is zero or unreasonably large.
    pub fn validate(&self) -> Result<(), NetplayError> {
        if !(1..=4096).contains(&self.buffer_size) {
            return Err(out_of_range("buffer_size", "1..=4096", self.buffer_size));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn sync_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.num_sync_packets, 5);
        assert_eq!(config.sync_retry_interval, Duration::from_millis(200));
        assert_eq!(config.sync_timeout, None);
        assert_eq!(config, SyncConfig::new());
    }

    #[test]
    fn presets_are_valid() {
        for config in [
            SyncConfig::default(),
            SyncConfig::lan(),
            SyncConfig::high_latency(),
            SyncConfig::lossy(),
        ] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        assert!(ProtocolConfig::default().validate().is_ok());
        assert!(ProtocolConfig::deterministic(1).validate().is_ok());
        assert!(SpectatorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_sync_packets_rejected() {
        let config = SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("num_sync_packets"));
    }

    #[test]
    fn zero_interval_rejected() {
        let config = SyncConfig {
            keepalive_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keepalive_interval"));
    }

    #[test]
    fn zero_sync_timeout_rejected() {
        let config = SyncConfig {
            sync_timeout: Some(Duration::ZERO),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn protocol_limits() {
        let config = ProtocolConfig {
            pending_output_limit: 0,
            ..ProtocolConfig::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("pending_output_limit"));

        let config = ProtocolConfig {
            network_stats_interval: Duration::from_secs(61),
            ..ProtocolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_spectator_ring_rejected() {
        assert!(SpectatorConfig { buffer_size: 0 }.validate().is_err());
    }
}
