//! Shared test utilities for integration tests.
//!
//! # Port Allocation
//!
//! UDP tests take their ports from `PortAllocator`, which hands out a
//! process-specific range so parallel test binaries do not collide:
//!
//! ```ignore
//! let (port1, port2) = PortAllocator::next_pair();
//! ```
//!
//! # In-memory network
//!
//! Most tests run over `MemoryNetwork`, a shared datagram queue with seeded
//! loss and reordering. Sessions on it behave exactly as on UDP but never
//! touch the OS.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rollback_netplay::rng::Pcg32;
use rollback_netplay::{
    Config, DatagramSocket, NetplayError, NetplayEvent, P2PSession, PlayerHandle, ProtocolConfig,
    SessionState, SyncConfig,
};

// ============================================================================
// Port Allocation System
// ============================================================================

/// Starting port of the allocator. Stays clear of well-known, registered
/// and ephemeral ranges.
const PORT_ALLOCATOR_START: u16 = 30000;

/// Ports reserved for each test process.
const PORTS_PER_PROCESS: u16 = 20;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);
static PORT_COUNTER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Thread-safe port allocator for integration tests.
pub struct PortAllocator;

impl PortAllocator {
    fn initialize_counter() {
        if PORT_COUNTER_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // nextest runs every test in its own process
            let max_offsets = (60000 - PORT_ALLOCATOR_START) / PORTS_PER_PROCESS;
            let offset_index = (std::process::id() as u16) % max_offsets;
            PORT_COUNTER.store(
                PORT_ALLOCATOR_START + offset_index * PORTS_PER_PROCESS,
                Ordering::SeqCst,
            );
        }
    }

    /// Allocates the next available port.
    #[must_use]
    pub fn next_port() -> u16 {
        Self::initialize_counter();
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(
            port < 60000,
            "Port allocator exhausted. This indicates a test suite issue."
        );
        port
    }

    /// Allocates a pair of ports for a 2-player session.
    #[must_use]
    pub fn next_pair() -> (u16, u16) {
        (Self::next_port(), Self::next_port())
    }
}

// ============================================================================
// Common Test Constants
// ============================================================================

/// Maximum iterations to wait for synchronization before giving up.
pub const MAX_SYNC_ITERATIONS: usize = 500;

/// Time to sleep between poll iterations so resend timers can fire.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Creates a test socket address with localhost IP and the given port.
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Routes library logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Short retry intervals so lossy tests finish quickly.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        num_sync_packets: 5,
        sync_retry_interval: Duration::from_millis(5),
        sync_timeout: None,
        running_retry_interval: Duration::from_millis(5),
        keepalive_interval: Duration::from_millis(5),
    }
}

/// Fixed nonces and magic numbers for reproducible runs.
pub fn seeded_protocol_config(seed: u64) -> ProtocolConfig {
    ProtocolConfig::deterministic(seed)
}

// ============================================================================
// In-memory network
// ============================================================================

#[derive(Default)]
struct NetworkState {
    queues: BTreeMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>,
    /// Endpoints whose traffic is dropped in both directions.
    cut_off: BTreeSet<SocketAddr>,
    loss_percent: u32,
    reorder_percent: u32,
    delivered: usize,
    dropped: usize,
    rng: Option<Pcg32>,
}

impl NetworkState {
    fn roll(&mut self, percent: u32) -> bool {
        if percent == 0 {
            return false;
        }
        let rng = self.rng.get_or_insert_with(|| Pcg32::seed_from_u64(0));
        rng.next_u32() % 100 < percent
    }
}

/// A datagram network shared by every socket created from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork(Arc<Mutex<NetworkState>>);

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops `loss_percent` and reorders `reorder_percent` of all datagrams,
    /// decided by a generator seeded with `seed`.
    pub fn lossy(seed: u64, loss_percent: u32, reorder_percent: u32) -> Self {
        let network = Self::default();
        {
            let mut state = network.0.lock();
            state.rng = Some(Pcg32::seed_from_u64(seed));
            state.loss_percent = loss_percent;
            state.reorder_percent = reorder_percent;
        }
        network
    }

    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    /// Silences an endpoint, as if its cable was pulled.
    pub fn cut_off(&self, addr: SocketAddr) {
        self.0.lock().cut_off.insert(addr);
    }

    pub fn reconnect(&self, addr: SocketAddr) {
        self.0.lock().cut_off.remove(&addr);
    }

    pub fn delivered(&self) -> usize {
        self.0.lock().delivered
    }

    pub fn dropped(&self) -> usize {
        self.0.lock().dropped
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl DatagramSocket<SocketAddr> for MemorySocket {
    fn send_datagram(&mut self, bytes: &[u8], dest: &SocketAddr) -> io::Result<()> {
        let mut state = self.network.0.lock();
        if state.cut_off.contains(&self.addr) || state.cut_off.contains(dest) {
            state.dropped += 1;
            return Ok(());
        }
        let loss = state.loss_percent;
        if state.roll(loss) {
            state.dropped += 1;
            return Ok(());
        }
        let reorder = state.reorder_percent;
        let swap = state.roll(reorder);
        let queue = state.queues.entry(*dest).or_default();
        if swap && !queue.is_empty() {
            let at = queue.len() - 1;
            queue.insert(at, (bytes.to_vec(), self.addr));
        } else {
            queue.push_back((bytes.to_vec(), self.addr));
        }
        Ok(())
    }

    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.network.0.lock();
        let Some((bytes, from)) = state
            .queues
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        if bytes.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram larger than receive buffer",
            ));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        state.delivered += 1;
        Ok(Some((bytes.len(), from)))
    }
}

// ============================================================================
// Synchronization Helpers
// ============================================================================

/// Polls every session until all of them run.
#[track_caller]
pub fn synchronize_sessions<T: Config>(sessions: &mut [&mut P2PSession<T>]) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        for session in sessions.iter_mut() {
            session.poll_remote_clients();
        }
        if sessions
            .iter()
            .all(|s| s.current_state() == SessionState::Running)
        {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    panic!("sessions did not synchronize within {MAX_SYNC_ITERATIONS} iterations");
}

/// Polls all sessions `rounds` times, sleeping between rounds.
pub fn poll_all<T: Config>(sessions: &mut [&mut P2PSession<T>], rounds: usize) {
    for _ in 0..rounds {
        for session in sessions.iter_mut() {
            session.poll_remote_clients();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Drains and returns a session's events.
pub fn drain_events<T: Config>(session: &mut P2PSession<T>) -> Vec<NetplayEvent> {
    session.events().collect()
}

/// Runs one game-loop tick: poll, add local input, read inputs, advance.
///
/// Returns `false` without advancing when the engine is too far ahead of
/// the confirmed frame.
#[track_caller]
pub fn step<T: Config>(session: &mut P2PSession<T>, handle: PlayerHandle, input: T::Input) -> bool {
    session.poll_remote_clients();
    match session.add_local_input(handle, input) {
        Ok(()) => (),
        Err(NetplayError::PredictionThreshold) => return false,
        Err(e) => panic!("add_local_input failed: {e}"),
    }
    session.synchronize_input().unwrap();
    session.advance_frame().unwrap();
    true
}
