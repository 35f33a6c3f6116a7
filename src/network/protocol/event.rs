use crate::frame_info::GameInput;
use crate::Config;

/// What a connection reports to its session. Drained once per poll, in
/// emission order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event<T>
where
    T: Config,
{
    /// The first valid handshake reply arrived.
    Connected,
    /// `count` of `total` handshake round trips are complete.
    Synchronizing { total: u32, count: u32 },
    /// The handshake is complete; the connection is running.
    Synchronized,
    /// Confirmed input for one frame. Frames arrive strictly in order. Never
    /// forwarded to the application.
    Input { input: GameInput<T::Input> },
    /// The peer went silent for the disconnect timeout, asked to disconnect, or
    /// stopped acknowledging input.
    Disconnected,
    /// The peer went silent for the notify-start delay.
    NetworkInterrupted { disconnect_timeout: u128 },
    /// The peer is sending again after an interruption.
    NetworkResumed,
    /// The handshake has been running longer than the configured sync timeout.
    SyncTimeout { elapsed_ms: u128 },
}
