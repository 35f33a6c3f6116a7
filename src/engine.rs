//! The boundary to the rollback engine.
//!
//! Sessions never touch game state. They hand inputs to a [`RollbackEngine`],
//! which owns the per-player input queues, predicts missing input, and rolls the
//! simulation back when a prediction turns out wrong. The application supplies
//! the engine together with the socket when it starts a session.

use crate::error::NetplayError;
use crate::frame_info::{GameInput, InputVec};
use crate::network::messages::ConnectionStatus;
use crate::{Config, Frame, InputStatus};

/// Input queues, prediction and rollback for one local simulation.
///
/// Player queues are indexed `0..num_players`, matching player number minus
/// one. All methods are called from the session's poll loop and must not block.
pub trait RollbackEngine<T: Config> {
    /// The frame the simulation will run next.
    fn current_frame(&self) -> Frame;

    /// `true` while the engine is resimulating after a rollback. Local input is
    /// refused during that time.
    fn in_rollback(&self) -> bool;

    /// Records local input for the current frame.
    ///
    /// Returns the frame the input was scheduled for, which is later than the
    /// current frame when the queue has a frame delay, or [`Frame::NULL`] if the
    /// input was dropped because a frame delay change already covers it.
    ///
    /// # Errors
    /// [`NetplayError::PredictionThreshold`] when the engine is too far ahead of
    /// the confirmed frame to accept more input.
    fn add_local_input(&mut self, queue: usize, input: T::Input) -> Result<Frame, NetplayError>;

    /// Records confirmed input received from a remote player.
    fn add_remote_input(&mut self, queue: usize, input: GameInput<T::Input>);

    /// Returns one input per player for the current frame, predicting missing
    /// remote input. Players marked disconnected in `connect_status` get the
    /// default input.
    fn synchronize_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Vec<(T::Input, InputStatus)>;

    /// Returns the confirmed inputs of every player for `frame`, for forwarding
    /// to spectators. Disconnected players contribute the default input.
    ///
    /// # Errors
    /// [`NetplayError::GeneralFailure`] if `frame` is no longer (or not yet)
    /// available.
    fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<InputVec<T::Input>, NetplayError>;

    /// Moves the simulation one frame forward.
    fn increment_frame(&mut self);

    /// Rolls back to `seek_to` and resimulates to the current frame.
    fn adjust_simulation(&mut self, seek_to: Frame);

    /// Gives the engine a chance to detect mispredictions and roll back.
    fn check_simulation(&mut self) {}

    /// Inputs up to and including `frame` are confirmed by every peer and may be
    /// discarded.
    fn set_last_confirmed_frame(&mut self, frame: Frame);

    /// Delays the inputs of `queue` by `delay` frames.
    fn set_frame_delay(&mut self, queue: usize, delay: usize);
}
