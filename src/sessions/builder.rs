//! Configuring and starting sessions.

use std::sync::Arc;

use web_time::Duration;

use crate::{
    engine::RollbackEngine,
    network::transport::Transport,
    sessions::p2p_session::ConnectionSettings,
    telemetry::ViolationObserver,
    time_sync::TimeSyncConfig,
    Config, DatagramSocket, NetplayError, P2PSession, SpectatorSession,
};

pub use crate::sessions::config::{ProtocolConfig, SpectatorConfig, SyncConfig};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(750);
const DEFAULT_FPS: usize = 60;
const DEFAULT_MAX_SPECTATORS: usize = 32;
/// Upper bound on player slots; player handles must stay below the spectator range.
const MAX_PLAYERS: usize = 64;

/// Collects the settings of a session and starts it.
///
/// ```no_run
/// use rollback_netplay::{
///     Config, P2PSession, RollbackEngine, SessionBuilder, SyncConfig, UdpNonBlockingSocket,
/// };
/// # struct MyConfig;
/// # impl Config for MyConfig {
/// #     type Input = u8;
/// #     type Address = std::net::SocketAddr;
/// # }
///
/// fn start(
///     engine: impl RollbackEngine<MyConfig> + 'static,
/// ) -> Result<P2PSession<MyConfig>, Box<dyn std::error::Error>> {
///     let socket = UdpNonBlockingSocket::bind_to_port(7000)?;
///     let session = SessionBuilder::<MyConfig>::new()
///         .with_num_players(2)?
///         .with_sync_config(SyncConfig::lan())
///         .with_game_name("arena")
///         .start_p2p_session(socket, engine)?;
///     Ok(session)
/// }
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_*_session method"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    fps: usize,
    /// Silence after which a remote peer is disconnected.
    disconnect_timeout: Duration,
    /// Silence after which the application is warned about a coming disconnect.
    disconnect_notify_start: Duration,
    max_spectators: usize,
    game_name: String,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    spectator_config: SpectatorConfig,
    time_sync_config: TimeSyncConfig,
    _config: std::marker::PhantomData<T>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            num_players,
            fps,
            disconnect_timeout,
            disconnect_notify_start,
            max_spectators,
            game_name,
            violation_observer,
            sync_config,
            protocol_config,
            spectator_config,
            time_sync_config,
            _config,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("num_players", num_players)
            .field("fps", fps)
            .field("disconnect_timeout", disconnect_timeout)
            .field("disconnect_notify_start", disconnect_notify_start)
            .field("max_spectators", max_spectators)
            .field("game_name", game_name)
            .field("has_violation_observer", &violation_observer.is_some())
            .field("sync_config", sync_config)
            .field("protocol_config", protocol_config)
            .field("spectator_config", spectator_config)
            .field("time_sync_config", time_sync_config)
            .finish()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// A builder with two players, 60 fps, a 5000 ms disconnect timeout and a
    /// 750 ms interruption notice.
    pub fn new() -> Self {
        Self {
            num_players: DEFAULT_PLAYERS,
            fps: DEFAULT_FPS,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            max_spectators: DEFAULT_MAX_SPECTATORS,
            game_name: String::new(),
            violation_observer: None,
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            spectator_config: SpectatorConfig::default(),
            time_sync_config: TimeSyncConfig::default(),
            _config: std::marker::PhantomData,
        }
    }

    /// Change number of total players. Default is 2.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if `num_players` is 0 or above 64.
    pub fn with_num_players(mut self, num_players: usize) -> Result<Self, NetplayError> {
        if !(1..=MAX_PLAYERS).contains(&num_players) {
            return Err(NetplayError::InvalidRequest {
                info: format!("num_players must be within 1..={MAX_PLAYERS}, got {num_players}"),
            });
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Sets the FPS this session runs at, used to convert frame advantages into time.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if `fps` is 0.
    pub fn with_fps(mut self, fps: usize) -> Result<Self, NetplayError> {
        if fps == 0 {
            return Err(NetplayError::InvalidRequest {
                info: "fps must be at least 1".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Zero disables disconnecting silent peers.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Zero disables `NetworkInterrupted` notices.
    pub fn with_disconnect_notify_delay(mut self, notify_delay: Duration) -> Self {
        self.disconnect_notify_start = notify_delay;
        self
    }

    /// Spectator slots of a P2P session. Default is 32.
    pub fn with_max_spectators(mut self, max_spectators: usize) -> Self {
        self.max_spectators = max_spectators;
        self
    }

    /// Handshake and resend timing.
    ///
    /// ```
    /// use rollback_netplay::{SessionBuilder, SyncConfig};
    /// # struct MyConfig;
    /// # impl rollback_netplay::Config for MyConfig {
    /// #     type Input = u8;
    /// #     type Address = std::net::SocketAddr;
    /// # }
    /// let builder = SessionBuilder::<MyConfig>::new().with_sync_config(SyncConfig::high_latency());
    /// ```
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Quality reports, statistics and pending-output limits.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Ring size on the spectator side.
    pub fn with_spectator_config(mut self, spectator_config: SpectatorConfig) -> Self {
        self.spectator_config = spectator_config;
        self
    }

    /// Averaging window of the frame-advantage recommendation.
    pub fn with_time_sync_config(mut self, time_sync_config: TimeSyncConfig) -> Self {
        self.time_sync_config = time_sync_config;
        self
    }

    /// Delivered as the first event of the session.
    pub fn with_game_name(mut self, game_name: impl Into<String>) -> Self {
        self.game_name = game_name.into();
        self
    }

    /// Receives every protocol violation the session reports, in addition to
    /// the `tracing` output.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    fn validate(&self) -> Result<(), NetplayError> {
        self.sync_config.validate()?;
        self.protocol_config.validate()?;
        self.spectator_config.validate()
    }

    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            num_players: self.num_players,
            fps: self.fps,
            disconnect_timeout: self.disconnect_timeout,
            disconnect_notify_start: self.disconnect_notify_start,
            sync_config: self.sync_config,
            protocol_config: self.protocol_config,
            time_sync_config: self.time_sync_config,
        }
    }

    fn transport(&self, socket: Box<dyn DatagramSocket<T::Address>>) -> Transport<T> {
        Transport::new(socket).with_violation_observer(self.violation_observer.clone())
    }

    /// Starts a [`P2PSession`] on `socket`. Register players with
    /// [`P2PSession::add_player`]; the handshake with each remote player starts
    /// when it is added.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if a configuration is out of range.
    pub fn start_p2p_session(
        self,
        socket: impl DatagramSocket<T::Address> + 'static,
        engine: impl RollbackEngine<T> + 'static,
    ) -> Result<P2PSession<T>, NetplayError> {
        self.validate()?;
        let transport = self.transport(Box::new(socket));
        Ok(P2PSession::new(
            self.settings(),
            self.max_spectators,
            self.game_name,
            transport,
            Box::new(engine),
            self.violation_observer,
        ))
    }

    /// Starts a [`SpectatorSession`] that watches the P2P session running at
    /// `host_addr`. The handshake with the host starts right away.
    ///
    /// # Errors
    /// [`NetplayError::InvalidRequest`] if a configuration is out of range.
    pub fn start_spectator_session(
        self,
        host_addr: T::Address,
        socket: impl DatagramSocket<T::Address> + 'static,
    ) -> Result<SpectatorSession<T>, NetplayError> {
        self.validate()?;
        let transport = self.transport(Box::new(socket));
        SpectatorSession::new(
            self.settings(),
            self.spectator_config.buffer_size,
            self.game_name,
            host_addr,
            transport,
            self.violation_observer,
        )
    }
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
    use crate::frame_info::{GameInput, InputVec};
    use crate::network::messages::ConnectionStatus;
    use crate::{Frame, InputStatus, NetplayEvent, SessionState};
    use std::io;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = u8;
    }

    struct SilentSocket;

    impl DatagramSocket<u8> for SilentSocket {
        fn send_datagram(&mut self, _bytes: &[u8], _dest: &u8) -> io::Result<()> {
            Ok(())
        }

        fn poll_datagram(&mut self, _buf: &mut [u8]) -> io::Result<Option<(usize, u8)>> {
            Ok(None)
        }
    }

    struct IdleEngine;

    impl RollbackEngine<TestConfig> for IdleEngine {
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

        fn synchronize_inputs(&mut self, status: &[ConnectionStatus]) -> Vec<(u8, InputStatus)> {
            vec![(0, InputStatus::Confirmed); status.len()]
        }

        fn confirmed_inputs(
            &self,
            _frame: Frame,
            _status: &[ConnectionStatus],
        ) -> Result<InputVec<u8>, NetplayError> {
            Ok(InputVec::new())
        }

        fn increment_frame(&mut self) {}

        fn adjust_simulation(&mut self, _seek_to: Frame) {}

        fn set_last_confirmed_frame(&mut self, _frame: Frame) {}

        fn set_frame_delay(&mut self, _queue: usize, _delay: usize) {}
    }

    #[test]
    fn rejects_zero_players_and_fps() {
        assert!(SessionBuilder::<TestConfig>::new().with_num_players(0).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_num_players(65).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_fps(0).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_num_players(4).is_ok());
    }

    #[test]
    fn invalid_sync_config_fails_at_start() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_sync_config(SyncConfig {
                num_sync_packets: 0,
                ..SyncConfig::default()
            })
            .start_p2p_session(SilentSocket, IdleEngine);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn invalid_spectator_buffer_fails_at_start() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_spectator_config(SpectatorConfig { buffer_size: 0 })
            .start_spectator_session(1, SilentSocket);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
    }

    #[test]
    fn p2p_session_starts_synchronizing_with_game_name() {
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_num_players(3)
            .unwrap()
            .with_game_name("duel")
            .start_p2p_session(SilentSocket, IdleEngine)
            .unwrap();
        assert_eq!(session.num_players(), 3);
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert_eq!(
            session.events().next(),
            Some(NetplayEvent::SessionStarted {
                game_name: "duel".to_owned()
            })
        );
    }

    #[test]
    fn max_spectators_is_enforced() {
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_max_spectators(1)
            .start_p2p_session(SilentSocket, IdleEngine)
            .unwrap();
        session.add_player(crate::Player::spectator(10)).unwrap();
        assert_eq!(
            session.add_player(crate::Player::spectator(11)),
            Err(NetplayError::TooManySpectators { max: 1 })
        );
    }

    #[test]
    fn debug_lists_settings() {
        let builder = SessionBuilder::<TestConfig>::new().with_game_name("x");
        let text = format!("{builder:?}");
        assert!(text.contains("game_name: \"x\""));
        assert!(text.contains("max_spectators: 32"));
    }
}
