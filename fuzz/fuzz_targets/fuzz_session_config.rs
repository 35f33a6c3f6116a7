//! Arbitrary builder settings.
//!
//! Every combination must either start a session or be rejected with an
//! error, never panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use rollback_netplay::{
    Config, DatagramSocket, Frame, GameInput, InputStatus, InputVec, NetplayError,
    ProtocolConfig, RollbackEngine, SessionBuilder, SpectatorConfig, SyncConfig,
};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct FuzzConfig {
    num_players: u8,
    fps: u16,
    disconnect_timeout_ms: u16,
    notify_ms: u16,
    num_sync_packets: u8,
    sync_retry_ms: u16,
    sync_timeout_ms: Option<u16>,
    keepalive_ms: u16,
    pending_output_limit: u16,
    spectator_buffer: u16,
    spectator: bool,
}

struct FuzzInputConfig;

impl Config for FuzzInputConfig {
    type Input = u8;
    type Address = SocketAddr;
}

struct NullSocket;

impl DatagramSocket<SocketAddr> for NullSocket {
    fn send_datagram(&mut self, _bytes: &[u8], _dest: &SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn poll_datagram(&mut self, _buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        Ok(None)
    }
}

struct NullEngine;

impl RollbackEngine<FuzzInputConfig> for NullEngine {
    fn current_frame(&self) -> Frame {
        Frame::new(0)
    }

    fn in_rollback(&self) -> bool {
        false
    }

    fn add_local_input(&mut self, _queue: usize, _input: u8) -> Result<Frame, NetplayError> {
        Ok(Frame::new(0))
    }

    fn add_remote_input(&mut self, _queue: usize, _input: GameInput<u8>) {}

    fn synchronize_inputs(
        &mut self,
        connect_status: &[rollback_netplay::ConnectionStatus],
    ) -> Vec<(u8, InputStatus)> {
        vec![(0, InputStatus::Predicted); connect_status.len()]
    }

    fn confirmed_inputs(
        &self,
        _frame: Frame,
        connect_status: &[rollback_netplay::ConnectionStatus],
    ) -> Result<InputVec<u8>, NetplayError> {
        Ok(connect_status.iter().map(|_| 0).collect())
    }

    fn increment_frame(&mut self) {}

    fn adjust_simulation(&mut self, _seek_to: Frame) {}

    fn set_last_confirmed_frame(&mut self, _frame: Frame) {}

    fn set_frame_delay(&mut self, _queue: usize, _delay: usize) {}
}

fuzz_target!(|config: FuzzConfig| {
    let Ok(builder) = SessionBuilder::<FuzzInputConfig>::new()
        .with_num_players(usize::from(config.num_players))
        .and_then(|b| b.with_fps(usize::from(config.fps)))
    else {
        return;
    };
    let builder = builder
        .with_disconnect_timeout(Duration::from_millis(u64::from(config.disconnect_timeout_ms)))
        .with_disconnect_notify_delay(Duration::from_millis(u64::from(config.notify_ms)))
        .with_sync_config(SyncConfig {
            num_sync_packets: u32::from(config.num_sync_packets),
            sync_retry_interval: Duration::from_millis(u64::from(config.sync_retry_ms)),
            sync_timeout: config
                .sync_timeout_ms
                .map(|ms| Duration::from_millis(u64::from(ms))),
            running_retry_interval: Duration::from_millis(u64::from(config.sync_retry_ms)),
            keepalive_interval: Duration::from_millis(u64::from(config.keepalive_ms)),
        })
        .with_protocol_config(ProtocolConfig {
            pending_output_limit: usize::from(config.pending_output_limit),
            ..ProtocolConfig::deterministic(0)
        })
        .with_spectator_config(SpectatorConfig {
            buffer_size: usize::from(config.spectator_buffer),
        });

    let host: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    if config.spectator {
        if let Ok(mut session) = builder.start_spectator_session(host, NullSocket) {
            session.poll_remote_clients();
            let _ = session.synchronize_input();
        }
    } else if let Ok(mut session) = builder.start_p2p_session(NullSocket, NullEngine) {
        session.poll_remote_clients();
        let _ = session.advance_frame();
    }
});
