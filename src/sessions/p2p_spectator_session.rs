//! The spectator session.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, trace};
use web_time::{Duration, Instant};

use crate::{
    frame_info::GameInput,
    network::{
        messages::ConnectionStatus,
        protocol::{Event, PeerProtocol},
        transport::Transport,
    },
    report_violation_to,
    sessions::p2p_session::ConnectionSettings,
    telemetry::{ViolationKind, ViolationObserver, ViolationSeverity},
    Config, EventDrain, Frame, InputStatus, NetplayError, NetplayEvent, NetworkStats,
    PlayerHandle, Session, SessionState,
};

const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Watches a running [`P2PSession`](crate::P2PSession) from a single host.
///
/// The host forwards every frame once all players confirmed it. The spectator
/// keeps the most recent frames in a ring and hands them out one at a time.
/// It never contributes input and never rolls back.
pub struct SpectatorSession<T>
where
    T: Config,
{
    state: SessionState,
    num_players: usize,
    host: PeerProtocol<T>,
    transport: Transport<T>,
    /// Confirmed frames from the host, indexed by `frame % len`.
    inputs: Vec<GameInput<T::Input>>,
    next_input_to_send: Frame,
    /// Set by the first frame from the host. A spectator that joined a
    /// running match starts watching there.
    received_input: bool,
    /// Spectators send no input, so this table never changes.
    local_connect_status: Vec<ConnectionStatus>,
    event_queue: VecDeque<NetplayEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for SpectatorSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectatorSession")
            .field("state", &self.state)
            .field("num_players", &self.num_players)
            .field("host", self.host.peer_addr())
            .field("buffer_size", &self.inputs.len())
            .field("next_input_to_send", &self.next_input_to_send)
            .finish_non_exhaustive()
    }
}

impl<T: Config> SpectatorSession<T> {
    pub(crate) fn new(
        settings: ConnectionSettings,
        buffer_size: usize,
        game_name: String,
        host_addr: T::Address,
        transport: Transport<T>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Result<Self, NetplayError> {
        let now = Instant::now();
        let mut host =
            settings.connect(PlayerHandle::HOST, host_addr, violation_observer.clone(), now);
        host.synchronize(now)?;

        let mut event_queue = VecDeque::new();
        event_queue.push_back(NetplayEvent::SessionStarted { game_name });

        Ok(Self {
            state: SessionState::Synchronizing,
            num_players: settings.num_players,
            host,
            transport,
            inputs: vec![GameInput::empty(); buffer_size.max(1)],
            next_input_to_send: Frame::new(0),
            received_input: false,
            local_connect_status: vec![ConnectionStatus::default(); settings.num_players],
            event_queue,
            violation_observer,
        })
    }

    /// Returns every player's confirmed input for the next frame and moves the
    /// cursor forward by one.
    ///
    /// # Errors
    /// - [`NetplayError::NotSynchronized`] while the handshake with the host runs.
    /// - [`NetplayError::PredictionThreshold`] if the host has not sent the frame
    ///   yet. Poll and try again.
    /// - [`NetplayError::GeneralFailure`] if the frame was already overwritten
    ///   in the ring. The spectator cannot recover from this.
    pub fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError> {
        if self.state == SessionState::Synchronizing {
            return Err(NetplayError::NotSynchronized);
        }

        let frame = self.next_input_to_send;
        let slot = self.slot(frame);
        let stored = self
            .inputs
            .get(slot)
            .ok_or_else(|| NetplayError::GeneralFailure {
                context: format!("ring slot {} out of bounds", slot),
            })?;

        if stored.frame.is_null() || stored.frame < frame {
            return Err(NetplayError::PredictionThreshold);
        }
        if stored.frame > frame {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "Frame {} was overwritten by frame {} before it was consumed",
                frame,
                stored.frame
            );
            return Err(NetplayError::GeneralFailure {
                context: format!(
                    "frame {} is no longer buffered; the host is at frame {}",
                    frame,
                    self.host.last_recv_frame()
                ),
            });
        }

        let synced = (0..self.num_players)
            .map(|queue| {
                let input = stored.inputs.get(queue).copied().unwrap_or_default();
                let status = self.host.peer_connect_status(queue);
                if status.disconnected && status.last_frame < frame {
                    (input, InputStatus::Disconnected)
                } else {
                    (input, InputStatus::Confirmed)
                }
            })
            .collect();
        self.next_input_to_send += 1;
        Ok(synced)
    }

    /// Polls the host connection. The cursor only moves in
    /// [`synchronize_input`](Self::synchronize_input).
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] while the handshake with the host runs.
    pub fn advance_frame(&mut self) -> Result<(), NetplayError> {
        self.poll_remote_clients();
        if self.state == SessionState::Synchronizing {
            return Err(NetplayError::NotSynchronized);
        }
        Ok(())
    }

    /// Receives from the host, runs connection timers and sends what is queued.
    pub fn poll_remote_clients(&mut self) {
        self.poll_at(Instant::now());
    }

    pub(crate) fn poll_at(&mut self, now: Instant) {
        let host = &mut self.host;
        self.transport.poll_incoming(|from, msg| {
            if host.is_handling_message(from) {
                host.handle_message(now, &msg);
            } else {
                trace!("Ignoring {} from {:?}, not the host", msg.kind(), from);
            }
        });

        let events: Vec<Event<T>> = self.host.poll(now, &self.local_connect_status).collect();
        for event in events {
            self.handle_event(now, event);
        }

        self.host.send_all_messages(&mut self.transport);
    }

    fn handle_event(&mut self, now: Instant, event: Event<T>) {
        let player = PlayerHandle::HOST;
        match event {
            Event::Connected => self.push_event(NetplayEvent::Connected { player }),
            Event::Synchronizing { total, count } => self.push_event(NetplayEvent::Synchronizing {
                player,
                count,
                total,
            }),
            Event::Synchronized => {
                if self.state == SessionState::Synchronizing {
                    info!("Synchronized with host, spectating");
                    self.state = SessionState::Running;
                    self.push_event(NetplayEvent::Synchronized { player });
                    self.push_event(NetplayEvent::Running);
                }
            },
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(NetplayEvent::NetworkInterrupted {
                    player,
                    disconnect_timeout,
                });
            },
            Event::NetworkResumed => self.push_event(NetplayEvent::NetworkResumed { player }),
            Event::SyncTimeout { elapsed_ms } => {
                self.push_event(NetplayEvent::SyncTimeout { player, elapsed_ms });
            },
            Event::Disconnected => {
                debug!("Host disconnected");
                self.host.disconnect(now);
                self.push_event(NetplayEvent::Disconnected { player });
            },
            Event::Input { input } => {
                // acknowledges the frame towards the host's frame advantage
                self.host.update_local_frame_advantage(input.frame);
                if !self.received_input {
                    self.received_input = true;
                    if input.frame > self.next_input_to_send {
                        debug!("Joined the match at frame {}", input.frame);
                        self.next_input_to_send = input.frame;
                    }
                }
                let slot = self.slot(input.frame);
                if let Some(stored) = self.inputs.get_mut(slot) {
                    trace!("Buffered host frame {}", input.frame);
                    *stored = input;
                }
            },
        }
    }

    fn slot(&self, frame: Frame) -> usize {
        frame.as_i32().max(0) as usize % self.inputs.len()
    }

    fn push_event(&mut self, event: NetplayEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    /// Connection quality towards the host.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] before the handshake completed.
    pub fn network_stats(&self) -> Result<NetworkStats, NetplayError> {
        self.host.network_stats()
    }

    /// How many received frames have not been consumed yet.
    #[must_use]
    pub fn frames_behind_host(&self) -> usize {
        let last = self.host.last_recv_frame();
        if last.is_null() {
            return 0;
        }
        usize::try_from(last - self.next_input_to_send + 1).unwrap_or(0)
    }

    /// The next frame [`synchronize_input`](Self::synchronize_input) returns.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.next_input_to_send
    }

    /// Number of players in the watched session.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Whether the handshake with the host is still running.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// Drains the queued events. Host events carry [`PlayerHandle::HOST`].
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// Silence after which the host is considered gone. Zero disables the check.
    pub fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.host.set_disconnect_timeout(timeout);
    }

    /// Silence after which [`NetplayEvent::NetworkInterrupted`] is reported.
    pub fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.host.set_disconnect_notify_start(notify_start);
    }
}

impl<T: Config> Session<T> for SpectatorSession<T> {
    fn poll_remote_clients(&mut self) {
        SpectatorSession::poll_remote_clients(self);
    }

    fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError> {
        SpectatorSession::synchronize_input(self)
    }

    fn advance_frame(&mut self) -> Result<(), NetplayError> {
        SpectatorSession::advance_frame(self)
    }

    fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        if player_handle != PlayerHandle::HOST {
            return Err(NetplayError::InvalidPlayerHandle {
                handle: player_handle,
            });
        }
        SpectatorSession::network_stats(self)
    }

    fn set_disconnect_timeout(&mut self, timeout: Duration) {
        SpectatorSession::set_disconnect_timeout(self, timeout);
    }

    fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        SpectatorSession::set_disconnect_notify_start(self, notify_start);
    }

    fn events(&mut self) -> EventDrain<'_> {
        SpectatorSession::events(self)
    }

    fn current_state(&self) -> SessionState {
        self.state
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
    use crate::sessions::config::{ProtocolConfig, SyncConfig};
    use crate::time_sync::TimeSyncConfig;
    use crate::DatagramSocket;
    use std::io;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u16;
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

    fn spectator(buffer_size: usize) -> SpectatorSession<TestConfig> {
        let settings = ConnectionSettings {
            num_players: 2,
            fps: 60,
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::deterministic(3),
            time_sync_config: TimeSyncConfig::default(),
        };
        SpectatorSession::new(
            settings,
            buffer_size,
            "watch".to_owned(),
            1,
            Transport::new(Box::new(SilentSocket)),
            None,
        )
        .unwrap()
    }

    /// Skips the handshake by pretending the host synchronized.
    fn running(buffer_size: usize) -> SpectatorSession<TestConfig> {
        let mut session = spectator(buffer_size);
        session.handle_event(Instant::now(), Event::Synchronized);
        session
    }

    fn deliver(session: &mut SpectatorSession<TestConfig>, frame: i32) {
        session.handle_event(
            Instant::now(),
            Event::Input {
                input: GameInput::new(
                    Frame::new(frame),
                    [frame as u16, frame as u16 + 100].into_iter().collect(),
                ),
            },
        );
    }

    #[test]
    fn refuses_input_before_handshake() {
        let mut session = spectator(64);
        assert_eq!(
            session.synchronize_input(),
            Err(NetplayError::NotSynchronized)
        );
        assert_eq!(session.advance_frame(), Err(NetplayError::NotSynchronized));
    }

    #[test]
    fn synchronized_host_emits_running_once() {
        let mut session = spectator(64);
        session.handle_event(Instant::now(), Event::Synchronized);
        session.handle_event(Instant::now(), Event::Synchronized);
        let events: Vec<_> = session.events().collect();
        assert_eq!(
            events,
            vec![
                NetplayEvent::SessionStarted {
                    game_name: "watch".to_owned()
                },
                NetplayEvent::Synchronized {
                    player: PlayerHandle::HOST
                },
                NetplayEvent::Running,
            ]
        );
    }

    #[test]
    fn missing_frame_is_prediction_threshold() {
        let mut session = running(64);
        assert_eq!(
            session.synchronize_input(),
            Err(NetplayError::PredictionThreshold)
        );
        deliver(&mut session, 0);
        assert_eq!(
            session.synchronize_input().unwrap(),
            vec![(0, InputStatus::Confirmed), (100, InputStatus::Confirmed)]
        );
        assert_eq!(
            session.synchronize_input(),
            Err(NetplayError::PredictionThreshold)
        );
        assert_eq!(session.current_frame(), Frame::new(1));
    }

    #[test]
    fn overwritten_frame_is_general_failure() {
        let mut session = running(64);
        for frame in 0..=5 {
            deliver(&mut session, frame);
        }
        for _ in 0..5 {
            session.synchronize_input().unwrap();
        }
        // the host ran 64 frames ahead; frame 69 now sits in frame 5's slot
        for frame in 6..=69 {
            deliver(&mut session, frame);
        }
        assert_eq!(session.current_frame(), Frame::new(5));
        assert!(matches!(
            session.synchronize_input(),
            Err(NetplayError::GeneralFailure { .. })
        ));
    }

    #[test]
    fn late_spectator_starts_at_first_received_frame() {
        let mut session = running(8);
        for frame in 40..43 {
            deliver(&mut session, frame);
        }
        assert_eq!(session.current_frame(), Frame::new(40));
        let inputs = session.synchronize_input().unwrap();
        assert_eq!(inputs[0].0, 40);
        assert_eq!(session.current_frame(), Frame::new(41));
    }

    #[test]
    fn cursor_advances_by_exactly_one() {
        let mut session = running(4);
        for frame in 0..3 {
            deliver(&mut session, frame);
        }
        for frame in 0..3 {
            let inputs = session.synchronize_input().unwrap();
            assert_eq!(inputs[0].0, frame);
        }
        assert_eq!(session.current_frame(), Frame::new(3));
    }

    #[test]
    fn host_disconnect_is_reported_with_host_handle() {
        let mut session = running(8);
        let _ = session.events().count();
        session.handle_event(Instant::now(), Event::Disconnected);
        assert_eq!(
            session.events().collect::<Vec<_>>(),
            vec![NetplayEvent::Disconnected {
                player: PlayerHandle::HOST
            }]
        );
    }

    #[test]
    fn unsupported_operations_through_trait() {
        let mut session = running(8);
        let session: &mut dyn Session<TestConfig> = &mut session;
        assert_eq!(
            session.add_local_input(PlayerHandle::new(1), 3),
            Err(NetplayError::Unsupported {
                operation: "add_local_input"
            })
        );
        assert!(matches!(
            session.disconnect_player(PlayerHandle::new(1)),
            Err(NetplayError::Unsupported { .. })
        ));
        assert!(matches!(
            session.set_frame_delay(PlayerHandle::new(1), 2),
            Err(NetplayError::Unsupported { .. })
        ));
        assert_eq!(
            session.network_stats(PlayerHandle::new(1)).err(),
            Some(NetplayError::InvalidPlayerHandle {
                handle: PlayerHandle::new(1)
            })
        );
    }
}
