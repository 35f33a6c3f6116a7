//! Integration tests for the configuration structs and how the builder
//! applies them.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::stubs::{LockstepEngine, StubConfig};
use common::{test_addr, MemoryNetwork};
use rollback_netplay::{
    NetplayError, ProtocolConfig, SessionBuilder, SessionState, SpectatorConfig, SyncConfig,
    TimeSyncConfig,
};

fn start_with(builder: SessionBuilder<StubConfig>) -> Result<SessionState, NetplayError> {
    let network = MemoryNetwork::new();
    let (engine, _probe) = LockstepEngine::new(2);
    builder
        .start_p2p_session(network.socket(test_addr(9100)), engine)
        .map(|s| s.current_state())
}

#[test]
fn every_preset_is_valid() {
    for sync in [
        SyncConfig::default(),
        SyncConfig::lan(),
        SyncConfig::high_latency(),
        SyncConfig::lossy(),
    ] {
        sync.validate().unwrap();
    }
    ProtocolConfig::default().validate().unwrap();
    ProtocolConfig::deterministic(3).validate().unwrap();
    SpectatorConfig::default().validate().unwrap();
}

#[test]
fn sessions_start_with_custom_configs() {
    let builder = SessionBuilder::new()
        .with_sync_config(SyncConfig::lan())
        .with_protocol_config(ProtocolConfig::deterministic(9))
        .with_spectator_config(SpectatorConfig { buffer_size: 16 })
        .with_time_sync_config(TimeSyncConfig::lan())
        .with_disconnect_timeout(Duration::from_secs(2))
        .with_disconnect_notify_delay(Duration::from_millis(500))
        .with_max_spectators(2)
        .with_fps(30)
        .unwrap();
    assert_eq!(start_with(builder), Ok(SessionState::Synchronizing));
}

#[test]
fn builder_rejects_out_of_range_sync_config() {
    let cases = [
        SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        },
        SyncConfig {
            num_sync_packets: 101,
            ..SyncConfig::default()
        },
        SyncConfig {
            sync_retry_interval: Duration::ZERO,
            ..SyncConfig::default()
        },
        SyncConfig {
            keepalive_interval: Duration::from_secs(11),
            ..SyncConfig::default()
        },
        SyncConfig {
            sync_timeout: Some(Duration::ZERO),
            ..SyncConfig::default()
        },
    ];
    for sync in cases {
        let result = start_with(SessionBuilder::new().with_sync_config(sync));
        assert!(
            matches!(result, Err(NetplayError::InvalidRequest { .. })),
            "{sync:?} was accepted"
        );
    }
}

#[test]
fn builder_rejects_out_of_range_protocol_and_spectator_config() {
    let protocol = ProtocolConfig {
        pending_output_limit: 0,
        ..ProtocolConfig::default()
    };
    assert!(matches!(
        start_with(SessionBuilder::new().with_protocol_config(protocol)),
        Err(NetplayError::InvalidRequest { .. })
    ));

    let network = MemoryNetwork::new();
    let spectator = SessionBuilder::<StubConfig>::new()
        .with_spectator_config(SpectatorConfig { buffer_size: 0 })
        .start_spectator_session(test_addr(9101), network.socket(test_addr(9102)));
    assert!(matches!(
        spectator,
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn builder_rejects_impossible_player_counts_and_rates() {
    assert!(SessionBuilder::<StubConfig>::new().with_num_players(0).is_err());
    assert!(SessionBuilder::<StubConfig>::new().with_num_players(65).is_err());
    assert!(SessionBuilder::<StubConfig>::new().with_num_players(64).is_ok());
    assert!(SessionBuilder::<StubConfig>::new().with_fps(0).is_err());
}
