//! The operations every session kind offers.

use web_time::Duration;

use crate::{
    Config, EventDrain, InputStatus, NetplayError, NetworkStats, PlayerHandle, SessionState,
};

/// The operations every session kind supports.
///
/// [`P2PSession`] and [`SpectatorSession`] share little state, but a game loop
/// usually does not care which one it drives. Operations a session kind cannot
/// perform fall back to the defaults below.
///
/// | Method | [`P2PSession`] | [`SpectatorSession`] |
/// |--------|:-:|:-:|
/// | [`add_local_input`](Session::add_local_input) | ✅ | `Unsupported` |
/// | [`disconnect_player`](Session::disconnect_player) | ✅ | `Unsupported` |
/// | [`set_frame_delay`](Session::set_frame_delay) | ✅ | `Unsupported` |
/// | everything else | ✅ | ✅ |
///
/// ```no_run
/// use rollback_netplay::{Config, NetplayError, PlayerHandle, Session};
///
/// fn tick<T: Config>(
///     session: &mut impl Session<T>,
///     me: PlayerHandle,
///     input: T::Input,
/// ) -> Result<(), NetplayError> {
///     session.poll_remote_clients();
///     session.add_local_input(me, input)?;
///     let _inputs = session.synchronize_input()?;
///     session.advance_frame()
/// }
/// ```
///
/// [`P2PSession`]: crate::P2PSession
/// [`SpectatorSession`]: crate::SpectatorSession
pub trait Session<T: Config> {
    /// Receives and handles everything that arrived, runs connection timers and
    /// sends what is queued. Call once per game-loop tick.
    fn poll_remote_clients(&mut self);

    /// Submits local input for the current frame.
    fn add_local_input(
        &mut self,
        _player_handle: PlayerHandle,
        _input: T::Input,
    ) -> Result<(), NetplayError> {
        Err(NetplayError::Unsupported {
            operation: "add_local_input",
        })
    }

    /// Returns one input per player for the frame about to be simulated.
    fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError>;

    /// Marks the current frame as simulated.
    fn advance_frame(&mut self) -> Result<(), NetplayError>;

    /// Disconnects a participant.
    fn disconnect_player(&mut self, _player_handle: PlayerHandle) -> Result<(), NetplayError> {
        Err(NetplayError::Unsupported {
            operation: "disconnect_player",
        })
    }

    /// Connection quality towards a remote participant.
    fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError>;

    /// Delays the input of a local player by `frame_delay` frames.
    fn set_frame_delay(
        &mut self,
        _player_handle: PlayerHandle,
        _frame_delay: usize,
    ) -> Result<(), NetplayError> {
        Err(NetplayError::Unsupported {
            operation: "set_frame_delay",
        })
    }

    /// Silence after which a peer is disconnected. Zero disables the check.
    fn set_disconnect_timeout(&mut self, timeout: Duration);

    /// Silence after which `NetworkInterrupted` is reported. Zero disables the
    /// check.
    fn set_disconnect_notify_start(&mut self, notify_start: Duration);

    /// Drains the queued events.
    fn events(&mut self) -> EventDrain<'_> {
        EventDrain::empty()
    }

    /// Whether the session is still synchronizing.
    fn current_state(&self) -> SessionState;
}
