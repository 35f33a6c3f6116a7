//! Arbitrary datagrams delivered to a session that is mid-handshake with a
//! remote player and a spectator.

#![no_main]

use libfuzzer_sys::fuzz_target;

use rollback_netplay::{
    Config, ConnectionStatus, DatagramSocket, Frame, GameInput, InputStatus, InputVec,
    NetplayError, Player, ProtocolConfig, RollbackEngine, SessionBuilder,
};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

struct FuzzInputConfig;

impl Config for FuzzInputConfig {
    type Input = u16;
    type Address = SocketAddr;
}

/// Hands out the fuzzer's datagrams, alternating between the two peers.
struct ScriptedSocket {
    datagrams: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl DatagramSocket<SocketAddr> for ScriptedSocket {
    fn send_datagram(&mut self, _bytes: &[u8], _dest: &SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((bytes, from)) = self.datagrams.pop_front() else {
            return Ok(None);
        };
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(Some((len, from)))
    }
}

struct CountingEngine {
    frame: i32,
}

impl RollbackEngine<FuzzInputConfig> for CountingEngine {
    fn current_frame(&self) -> Frame {
        Frame::new(self.frame)
    }

    fn in_rollback(&self) -> bool {
        false
    }

    fn add_local_input(&mut self, _queue: usize, _input: u16) -> Result<Frame, NetplayError> {
        Ok(Frame::new(self.frame))
    }

    fn add_remote_input(&mut self, _queue: usize, _input: GameInput<u16>) {}

    fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Vec<(u16, InputStatus)> {
        vec![(0, InputStatus::Predicted); connect_status.len()]
    }

    fn confirmed_inputs(
        &self,
        _frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<InputVec<u16>, NetplayError> {
        Ok(connect_status.iter().map(|_| 0).collect())
    }

    fn increment_frame(&mut self) {
        self.frame += 1;
    }

    fn adjust_simulation(&mut self, _seek_to: Frame) {}

    fn set_last_confirmed_frame(&mut self, _frame: Frame) {}

    fn set_frame_delay(&mut self, _queue: usize, _delay: usize) {}
}

fuzz_target!(|data: &[u8]| {
    let remote: SocketAddr = "127.0.0.1:7001".parse().unwrap();
    let spectator: SocketAddr = "127.0.0.1:7002".parse().unwrap();

    // the first byte of each chunk picks the sender
    let datagrams = data
        .split(|b| *b == 0xff)
        .filter_map(|chunk| {
            let (first, rest) = chunk.split_first()?;
            let from = if first % 2 == 0 { remote } else { spectator };
            Some((rest.to_vec(), from))
        })
        .collect();

    let Ok(mut session) = SessionBuilder::<FuzzInputConfig>::new()
        .with_protocol_config(ProtocolConfig::deterministic(1))
        .start_p2p_session(ScriptedSocket { datagrams }, CountingEngine { frame: 0 })
    else {
        return;
    };
    let local = session.add_player(Player::local(1)).unwrap();
    session.add_player(Player::remote(2, remote)).unwrap();
    session.add_player(Player::spectator(spectator)).unwrap();

    session.poll_remote_clients();
    if session.add_local_input(local, 7).is_ok() {
        let _ = session.synchronize_input();
        let _ = session.advance_frame();
    }
    let _ = session.events().count();
});
