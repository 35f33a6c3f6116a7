//! Loopback network and a minimal engine shared by the benchmarks.

#![allow(dead_code, clippy::unwrap_used, clippy::indexing_slicing)]

use parking_lot::Mutex;
use rollback_netplay::{
    Config, ConnectionStatus, DatagramSocket, Frame, GameInput, InputStatus, InputVec,
    NetplayError, P2PSession, Player, RollbackEngine, SessionBuilder, SessionState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

#[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
pub struct BenchInput {
    pub buttons: u8,
    pub stick_x: i8,
    pub stick_y: i8,
}

pub struct BenchConfig;

impl Config for BenchConfig {
    type Input = BenchInput;
    type Address = SocketAddr;
}

type Queues = BTreeMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>;

/// Delivers every datagram, in order, without touching the OS.
#[derive(Clone, Default)]
pub struct Loopback {
    queues: Arc<Mutex<Queues>>,
    /// Copies of every datagram sent, when capturing.
    captured: Option<Arc<Mutex<Vec<Vec<u8>>>>>,
}

impl Loopback {
    pub fn capturing() -> Self {
        Self {
            captured: Some(Arc::default()),
            ..Self::default()
        }
    }

    pub fn socket(&self, addr: SocketAddr) -> LoopbackSocket {
        LoopbackSocket {
            addr,
            net: self.clone(),
        }
    }

    pub fn captured(&self) -> Vec<Vec<u8>> {
        self.captured
            .as_ref()
            .map(|c| c.lock().clone())
            .unwrap_or_default()
    }
}

pub struct LoopbackSocket {
    addr: SocketAddr,
    net: Loopback,
}

impl DatagramSocket<SocketAddr> for LoopbackSocket {
    fn send_datagram(&mut self, bytes: &[u8], dest: &SocketAddr) -> io::Result<()> {
        if let Some(captured) = &self.net.captured {
            captured.lock().push(bytes.to_vec());
        }
        self.net
            .queues
            .lock()
            .entry(*dest)
            .or_default()
            .push_back((bytes.to_vec(), self.addr));
        Ok(())
    }

    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((bytes, from)) = self
            .net
            .queues
            .lock()
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(Some((bytes.len(), from)))
    }
}

const MAX_PREDICTION: i32 = 8;

/// Keeps only unconfirmed frames and never resimulates.
pub struct BenchEngine {
    frame: i32,
    last_confirmed: i32,
    inputs: Vec<BTreeMap<i32, BenchInput>>,
}

impl BenchEngine {
    pub fn new(num_players: usize) -> Self {
        Self {
            frame: 0,
            last_confirmed: -1,
            inputs: vec![BTreeMap::new(); num_players],
        }
    }
}

impl RollbackEngine<BenchConfig> for BenchEngine {
    fn current_frame(&self) -> Frame {
        Frame::new(self.frame)
    }

    fn in_rollback(&self) -> bool {
        false
    }

    fn add_local_input(&mut self, queue: usize, input: BenchInput) -> Result<Frame, NetplayError> {
        if self.frame >= self.last_confirmed + 1 + MAX_PREDICTION {
            return Err(NetplayError::PredictionThreshold);
        }
        self.inputs[queue].insert(self.frame, input);
        Ok(Frame::new(self.frame))
    }

    fn add_remote_input(&mut self, queue: usize, input: GameInput<BenchInput>) {
        let value = input.inputs.first().copied().unwrap_or_default();
        self.inputs[queue].insert(input.frame.as_i32(), value);
    }

    fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Vec<(BenchInput, InputStatus)> {
        (0..connect_status.len())
            .map(|queue| match self.inputs[queue].get(&self.frame) {
                Some(input) => (*input, InputStatus::Confirmed),
                None => (BenchInput::default(), InputStatus::Predicted),
            })
            .collect()
    }

    fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<InputVec<BenchInput>, NetplayError> {
        Ok((0..connect_status.len())
            .map(|queue| {
                self.inputs[queue]
                    .get(&frame.as_i32())
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    fn increment_frame(&mut self) {
        self.frame += 1;
    }

    fn adjust_simulation(&mut self, _seek_to: Frame) {}

    fn set_last_confirmed_frame(&mut self, frame: Frame) {
        self.last_confirmed = frame.as_i32();
        for inputs in &mut self.inputs {
            *inputs = inputs.split_off(&(frame.as_i32() - 1));
        }
    }

    fn set_frame_delay(&mut self, _queue: usize, _delay: usize) {}
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Two sessions that know each other; the handshake has not run yet.
pub fn session_pair(net: &Loopback) -> [P2PSession<BenchConfig>; 2] {
    let addrs = [addr(1), addr(2)];
    [0, 1].map(|me| {
        let mut session = SessionBuilder::<BenchConfig>::new()
            .start_p2p_session(net.socket(addrs[me]), BenchEngine::new(2))
            .unwrap();
        session.add_player(Player::local(me + 1)).unwrap();
        let other = 1 - me;
        session
            .add_player(Player::remote(other + 1, addrs[other]))
            .unwrap();
        session
    })
}

/// Polls both sessions until they run.
pub fn handshake(sessions: &mut [P2PSession<BenchConfig>; 2]) {
    while sessions
        .iter()
        .any(|s| s.current_state() != SessionState::Running)
    {
        for session in sessions.iter_mut() {
            session.poll_remote_clients();
        }
    }
}
