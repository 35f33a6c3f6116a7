//! # Rollback Netplay
//!
//! Peer-to-peer transport for rollback netcode. Every participant runs the same
//! deterministic simulation and exchanges only per-frame player inputs; this crate
//! moves those inputs between peers over an unreliable datagram transport that
//! the host application supplies.
//!
//! The crate is organised in three layers:
//!
//! - a **transport adapter** that encodes messages and drains the host's
//!   non-blocking socket ([`DatagramSocket`]),
//! - one **connection protocol** instance per remote participant, which performs
//!   the handshake, sequences messages, resends unacknowledged input, measures
//!   round-trip time and detects disconnects,
//! - **sessions** ([`P2PSession`], [`SpectatorSession`]) that own the protocol
//!   instances, decide when the whole group is synchronized and feed confirmed
//!   input into a [`RollbackEngine`] supplied by the application.
//!
//! Everything is poll driven. Call `poll_remote_clients()` once per game-loop
//! tick; nothing ever blocks and no threads are spawned.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{fmt::Debug, hash::Hash};

pub use engine::RollbackEngine;
pub use error::NetplayError;
pub use frame_info::{GameInput, InputVec};
pub use network::messages::{ConnectionStatus, Message};
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolConfig, SpectatorConfig, SyncConfig};
pub use sessions::event_drain::EventDrain;
pub use sessions::p2p_session::P2PSession;
pub use sessions::p2p_spectator_session::SpectatorSession;
pub use sessions::session_slot::SessionSlot;
pub use sessions::session_trait::Session;
pub use time_sync::TimeSyncConfig;

use serde::{de::DeserializeOwned, Serialize};

pub mod engine;
pub mod error;
pub mod frame_info;
pub mod prelude;
pub mod rng;
pub mod telemetry;
pub mod time_sync;

#[doc(hidden)]
pub mod sessions {
    pub mod builder;
    pub mod config;
    pub mod event_drain;
    pub mod p2p_session;
    pub mod p2p_spectator_session;
    pub(crate) mod player_registry;
    pub mod session_slot;
    pub mod session_trait;
}

#[doc(hidden)]
pub mod network {
    /// Binary codec for wire messages.
    pub mod codec;
    pub mod messages;
    pub mod network_stats;
    pub mod protocol;
    pub mod transport;
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Spectator handles start here. Player handles are `1..=num_players`, so a
/// session may have at most `SPECTATOR_HANDLE_OFFSET - 1` players.
pub const SPECTATOR_HANDLE_OFFSET: usize = 1000;

/// A frame is a single step of game execution.
///
/// Frame numbers start at 0 and increase by one per simulated step.
/// [`Frame::NULL`] stands for "no frame".
///
/// ```
/// use rollback_netplay::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame, representing "no frame".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a frame from a raw number. Negative values other than -1 are
    /// representable but never valid.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` for [`Frame::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if the frame is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_sub(rhs))
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// Identifies a player or spectator towards the application.
///
/// Handles are derived from internal queue indices but live in separate
/// ranges so they never collide:
///
/// - **Players**: `queue + 1`, i.e. `1..=num_players`
/// - **Spectators**: `queue + SPECTATOR_HANDLE_OFFSET`
/// - [`PlayerHandle::HOST`] (0) tags events coming from a spectator's host
///
/// ```
/// use rollback_netplay::PlayerHandle;
///
/// let player = PlayerHandle::for_player_queue(0);
/// assert_eq!(player.as_usize(), 1);
/// assert_eq!(player.player_queue(2), Some(0));
///
/// let spectator = PlayerHandle::for_spectator_queue(3);
/// assert!(spectator.is_spectator());
/// assert_eq!(spectator.spectator_queue(), Some(3));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// The upstream host of a spectator session.
    pub const HOST: PlayerHandle = PlayerHandle(0);

    /// Wraps a raw handle value without validating it.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The handle of the player occupying `queue`.
    #[inline]
    #[must_use]
    pub const fn for_player_queue(queue: usize) -> Self {
        PlayerHandle(queue + 1)
    }

    /// The handle of the spectator occupying spectator slot `queue`.
    #[inline]
    #[must_use]
    pub const fn for_spectator_queue(queue: usize) -> Self {
        PlayerHandle(queue + SPECTATOR_HANDLE_OFFSET)
    }

    /// Returns `true` if the handle lies in the spectator range.
    #[inline]
    #[must_use]
    pub const fn is_spectator(self) -> bool {
        self.0 >= SPECTATOR_HANDLE_OFFSET
    }

    /// Maps a player handle back to its queue index, or `None` if the handle is
    /// not a player handle of a session with `num_players` slots.
    #[inline]
    #[must_use]
    pub const fn player_queue(self, num_players: usize) -> Option<usize> {
        if self.0 >= 1 && self.0 <= num_players && !self.is_spectator() {
            Some(self.0 - 1)
        } else {
            None
        }
    }

    /// Maps a spectator handle back to its spectator slot.
    #[inline]
    #[must_use]
    pub const fn spectator_queue(self) -> Option<usize> {
        if self.is_spectator() {
            Some(self.0 - SPECTATOR_HANDLE_OFFSET)
        } else {
            None
        }
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Where a participant plays.
///
/// Both [`PlayerType::Remote`] and [`PlayerType::Spectator`] carry the
/// host-defined address of the remote endpoint.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// Plays on this device.
    #[default]
    Local,
    /// Plays on another device.
    Remote(A),
    /// Watches from another device without contributing input.
    Spectator(A),
}

/// A participant to register with [`P2PSession::add_player`].
///
/// Player numbers are 1-based; spectators have no player number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Player<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// Local, remote or spectator.
    pub player_type: PlayerType<A>,
    /// 1-based player slot. Ignored for spectators.
    pub player_num: usize,
}

impl<A> Player<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// A player on this device.
    #[must_use]
    pub const fn local(player_num: usize) -> Self {
        Self {
            player_type: PlayerType::Local,
            player_num,
        }
    }

    /// A player on another device reachable at `addr`.
    #[must_use]
    pub const fn remote(player_num: usize, addr: A) -> Self {
        Self {
            player_type: PlayerType::Remote(addr),
            player_num,
        }
    }

    /// A spectator reachable at `addr`.
    #[must_use]
    pub const fn spectator(addr: A) -> Self {
        Self {
            player_type: PlayerType::Spectator(addr),
            player_num: 0,
        }
    }
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// At least one required peer has not finished its handshake. Frames cannot
    /// be advanced.
    Synchronizing,
    /// Every required peer is synchronized.
    Running,
}

/// Accompanies every input returned by `synchronize_input`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input was received from its player.
    Confirmed,
    /// The input is a prediction and may be corrected by a rollback.
    Predicted,
    /// The player is disconnected; the input is the default value.
    Disconnected,
}

/// Notifications produced by a session. Drain them after every poll.
///
/// Connection events carry the handle of the participant they concern.
/// Events about a spectator's upstream host use [`PlayerHandle::HOST`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// Always the first event of a session.
    SessionStarted {
        /// The name given to the builder.
        game_name: String,
    },
    /// The first handshake reply from a peer arrived.
    Connected {
        /// The peer.
        player: PlayerHandle,
    },
    /// Handshake progress. After `total` round trips the peer is synchronized.
    Synchronizing {
        /// The peer.
        player: PlayerHandle,
        /// Completed round trips.
        count: u32,
        /// Required round trips.
        total: u32,
    },
    /// The handshake with a peer completed.
    Synchronized {
        /// The peer.
        player: PlayerHandle,
    },
    /// Every required peer is synchronized; frames may be advanced.
    Running,
    /// Nothing has been received from a peer for a while. It will be
    /// disconnected after `disconnect_timeout` more milliseconds of silence.
    NetworkInterrupted {
        /// The peer.
        player: PlayerHandle,
        /// Milliseconds left until the peer is disconnected.
        disconnect_timeout: u128,
    },
    /// A peer that was reported as interrupted is sending again.
    NetworkResumed {
        /// The peer.
        player: PlayerHandle,
    },
    /// A peer was disconnected.
    Disconnected {
        /// The peer.
        player: PlayerHandle,
    },
    /// This peer is ahead; consider waiting `skip_frames` frames so the others
    /// can catch up.
    WaitRecommendation {
        /// Suggested number of frames to wait.
        skip_frames: u32,
    },
    /// The handshake with a peer has been running longer than the configured
    /// sync timeout. The handshake keeps retrying.
    SyncTimeout {
        /// The peer.
        player: PlayerHandle,
        /// Milliseconds since the handshake started.
        elapsed_ms: u128,
    },
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// ```
/// use rollback_netplay::Config;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct Buttons {
///     pressed: u16,
/// }
///
/// struct GameConfig;
///
/// impl Config for GameConfig {
///     type Input = Buttons;
///     type Address = SocketAddr;
/// }
/// ```
#[cfg(feature = "sync-send")]
pub trait Config: 'static + Send + Sync {
    /// Per-player, per-frame input. [`Default`] stands for "no input", which is
    /// also what disconnected players produce.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync;

    /// Identifies a remote endpoint. Compared by equality only.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Send + Sync + Debug;
}

/// The host's datagram transport.
///
/// Datagrams are unordered and unreliable; the connection protocol makes up for
/// both. Neither method may block.
#[cfg(feature = "sync-send")]
pub trait DatagramSocket<A>: Send + Sync
where
    A: Clone + PartialEq + Eq + Hash + Send + Sync,
{
    /// Hands one datagram to the transport. Failures are logged and otherwise
    /// ignored; nothing is retried.
    fn send_datagram(&mut self, bytes: &[u8], dest: &A) -> std::io::Result<()>;

    /// Copies the next available datagram into `buf` and returns its length
    /// and sender, or `Ok(None)` when nothing is pending.
    fn poll_datagram(&mut self, buf: &mut [u8]) -> std::io::Result<Option<(usize, A)>>;
}

/// Compile time parameterization for sessions.
#[cfg(not(feature = "sync-send"))]
pub trait Config: 'static {
    /// Per-player, per-frame input. [`Default`] stands for "no input", which is
    /// also what disconnected players produce.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// Identifies a remote endpoint. Compared by equality only.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The host's datagram transport.
///
/// Datagrams are unordered and unreliable; the connection protocol makes up for
/// both. Neither method may block.
#[cfg(not(feature = "sync-send"))]
pub trait DatagramSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Hands one datagram to the transport. Failures are logged and otherwise
    /// ignored; nothing is retried.
    fn send_datagram(&mut self, bytes: &[u8], dest: &A) -> std::io::Result<()>;

    /// Copies the next available datagram into `buf` and returns its length
    /// and sender, or `Ok(None)` when nothing is pending.
    fn poll_datagram(&mut self, buf: &mut [u8]) -> std::io::Result<Option<(usize, A)>>;
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
    use proptest::prelude::*;

    #[test]
    fn frame_arithmetic() {
        let frame = Frame::new(10);
        assert_eq!(frame + 5, Frame::new(15));
        assert_eq!(frame - 3, Frame::new(7));
        assert_eq!(Frame::new(15) - frame, 5);
        let mut f = frame;
        f += 1;
        assert_eq!(f, Frame::new(11));
    }

    #[test]
    fn frame_display() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn frame_add_saturates() {
        assert_eq!(Frame::new(i32::MAX) + 1, Frame::new(i32::MAX));
    }

    #[test]
    fn handle_zero_is_never_a_player() {
        assert_eq!(PlayerHandle::HOST.player_queue(4), None);
        assert_eq!(PlayerHandle::HOST.spectator_queue(), None);
    }

    #[test]
    fn player_handle_out_of_range() {
        assert_eq!(PlayerHandle::new(3).player_queue(2), None);
        assert_eq!(PlayerHandle::new(2).player_queue(2), Some(1));
    }

    #[test]
    fn spectator_handles_are_not_players() {
        let spectator = PlayerHandle::for_spectator_queue(0);
        assert_eq!(spectator.as_usize(), SPECTATOR_HANDLE_OFFSET);
        assert_eq!(spectator.player_queue(usize::MAX), None);
    }

    #[test]
    fn player_constructors() {
        let local: Player<u32> = Player::local(1);
        assert_eq!(local.player_type, PlayerType::Local);
        let remote = Player::remote(2, 7u32);
        assert_eq!(remote.player_type, PlayerType::Remote(7));
        assert_eq!(remote.player_num, 2);
        let spectator = Player::spectator(9u32);
        assert_eq!(spectator.player_type, PlayerType::Spectator(9));
    }

    proptest! {
        #[test]
        fn player_handles_round_trip(queue in 0usize..(SPECTATOR_HANDLE_OFFSET - 1)) {
            let handle = PlayerHandle::for_player_queue(queue);
            prop_assert_eq!(handle.player_queue(SPECTATOR_HANDLE_OFFSET - 1), Some(queue));
            prop_assert!(!handle.is_spectator());
        }

        #[test]
        fn spectator_handles_round_trip(queue in 0usize..10_000) {
            let handle = PlayerHandle::for_spectator_queue(queue);
            prop_assert_eq!(handle.spectator_queue(), Some(queue));
            prop_assert_eq!(handle.player_queue(SPECTATOR_HANDLE_OFFSET - 1), None);
        }
    }
}
