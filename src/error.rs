//! Errors returned by session operations.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::PlayerHandle;

/// Every error a session operation can return. Most API functions return a
/// [`Result<(), NetplayError>`].
///
/// Network conditions never produce an error here: malformed or out-of-protocol
/// datagrams are dropped and logged, and connection lifecycle changes are
/// reported as [`NetplayEvent`]s instead.
///
/// [`Result<(), NetplayError>`]: std::result::Result
/// [`NetplayEvent`]: crate::NetplayEvent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// The operation was forwarded to a slot that holds no session.
    InvalidSession,
    /// The handle is not registered with this session, or belongs to a spectator
    /// where a player was expected.
    InvalidPlayerHandle {
        /// The offending handle.
        handle: PlayerHandle,
    },
    /// A player number outside `1..=num_players` was used during registration.
    PlayerOutOfRange {
        /// The requested (1-based) player number.
        player_num: usize,
        /// The number of player slots in the session.
        num_players: usize,
    },
    /// The session is still synchronizing with at least one peer. Retry after
    /// polling for a while.
    NotSynchronized,
    /// The requested input is not available yet. Wait, poll and retry.
    PredictionThreshold,
    /// The player has already been disconnected.
    PlayerDisconnected {
        /// The handle of the disconnected player.
        handle: PlayerHandle,
    },
    /// All spectator slots are in use.
    TooManySpectators {
        /// The configured spectator capacity.
        max: usize,
    },
    /// The rollback engine is resimulating and cannot take local input right now.
    InRollback,
    /// The request is not valid in the current configuration or state.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The operation is not available for this kind of session.
    Unsupported {
        /// Name of the operation.
        operation: &'static str,
    },
    /// An unrecoverable condition, such as a spectator asking for a frame that has
    /// already been evicted from its buffer.
    GeneralFailure {
        /// A description of what went wrong.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidSession => write!(f, "No session is active."),
            NetplayError::InvalidPlayerHandle { handle } => {
                write!(f, "Invalid player handle {}.", handle)
            },
            NetplayError::PlayerOutOfRange {
                player_num,
                num_players,
            } => {
                write!(
                    f,
                    "Player number {} is out of range: must be between 1 and {}.",
                    player_num, num_players
                )
            },
            NetplayError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            },
            NetplayError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            },
            NetplayError::PlayerDisconnected { handle } => {
                write!(f, "Player {} is already disconnected.", handle)
            },
            NetplayError::TooManySpectators { max } => {
                write!(f, "All {} spectator slots are in use.", max)
            },
            NetplayError::InRollback => {
                write!(f, "The session is currently rolling back.")
            },
            NetplayError::InvalidRequest { info } => write!(f, "Invalid Request: {}", info),
            NetplayError::Unsupported { operation } => {
                write!(f, "Operation `{}` is not supported by this session.", operation)
            },
            NetplayError::GeneralFailure { context } => {
                write!(f, "General failure: {}", context)
            },
        }
    }
}

impl Error for NetplayError {}

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
    fn display_mentions_the_handle() {
        let err = NetplayError::InvalidPlayerHandle {
            handle: PlayerHandle::new(7),
        };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn display_out_of_range_lists_bounds() {
        let err = NetplayError::PlayerOutOfRange {
            player_num: 5,
            num_players: 2,
        };
        let text = err.to_string();
        assert!(text.contains('5'));
        assert!(text.contains('2'));
    }

    #[test]
    fn errors_are_std_errors() {
        let err: Box<dyn Error> = Box::new(NetplayError::NotSynchronized);
        assert!(err.to_string().contains("synchronized"));
    }
}
