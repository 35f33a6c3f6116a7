//! The peer-to-peer session.

use crate::engine::RollbackEngine;
use crate::error::NetplayError;
use crate::frame_info::GameInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, PeerProtocol, ProtocolState};
use crate::network::transport::Transport;
use crate::report_violation_to;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::sessions::player_registry::PlayerRegistry;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::time_sync::TimeSyncConfig;
use crate::{
    Config, EventDrain, Frame, InputStatus, NetplayEvent, Player, PlayerHandle, PlayerType,
    Session, SessionState,
};
use tracing::{debug, info, trace};

use std::collections::VecDeque;
use std::sync::Arc;
use web_time::{Duration, Instant};

/// Frames between two [`NetplayEvent::WaitRecommendation`]s.
const RECOMMENDATION_INTERVAL: i32 = 240;

/// Oldest events are dropped beyond this many undrained events.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// Settings shared by every connection a session creates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionSettings {
    pub num_players: usize,
    pub fps: usize,
    pub disconnect_timeout: Duration,
    pub disconnect_notify_start: Duration,
    pub sync_config: SyncConfig,
    pub protocol_config: ProtocolConfig,
    pub time_sync_config: TimeSyncConfig,
}

impl ConnectionSettings {
    pub(crate) fn connect<T: Config>(
        &self,
        handle: PlayerHandle,
        addr: T::Address,
        observer: Option<Arc<dyn ViolationObserver>>,
        now: Instant,
    ) -> PeerProtocol<T> {
        // distinct nonces and magic per connection, even with a fixed seed
        let protocol_config = ProtocolConfig {
            protocol_rng_seed: self
                .protocol_config
                .protocol_rng_seed
                .map(|seed| seed.wrapping_add(handle.as_usize() as u64)),
            ..self.protocol_config
        };
        PeerProtocol::new(
            handle,
            addr,
            self.num_players,
            self.disconnect_timeout,
            self.disconnect_notify_start,
            self.fps,
            self.sync_config,
            protocol_config,
            self.time_sync_config,
            observer,
            now,
        )
    }
}

/// A session between two or more players connected peer to peer.
///
/// The session owns one connection per remote player and per spectator and
/// feeds the input it receives into the application's [`RollbackEngine`].
/// Until every remote player has completed its handshake the session is
/// [`SessionState::Synchronizing`] and refuses to advance.
pub struct P2PSession<T>
where
    T: Config,
{
    num_players: usize,
    engine: Box<dyn RollbackEngine<T>>,
    transport: Transport<T>,
    player_reg: PlayerRegistry<T>,
    settings: ConnectionSettings,

    state: SessionState,
    /// What this peer knows about every player, gossiped to all remotes.
    local_connect_status: Vec<ConnectionStatus>,
    /// The next confirmed frame to forward to spectators.
    next_spectator_frame: Frame,
    next_recommended_sleep: Frame,

    event_queue: VecDeque<NetplayEvent>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for P2PSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PSession")
            .field("num_players", &self.num_players)
            .field("state", &self.state)
            .field("players", &self.player_reg)
            .field("local_connect_status", &self.local_connect_status)
            .field("next_spectator_frame", &self.next_spectator_frame)
            .field("pending_events", &self.event_queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: Config> P2PSession<T> {
    pub(crate) fn new(
        settings: ConnectionSettings,
        max_spectators: usize,
        game_name: String,
        transport: Transport<T>,
        engine: Box<dyn RollbackEngine<T>>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        let num_players = settings.num_players;
        let mut event_queue = VecDeque::new();
        event_queue.push_back(NetplayEvent::SessionStarted { game_name });

        Self {
            num_players,
            engine,
            transport,
            player_reg: PlayerRegistry::new(num_players, max_spectators),
            settings,
            state: SessionState::Synchronizing,
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            next_spectator_frame: Frame::new(0),
            next_recommended_sleep: Frame::new(0),
            event_queue,
            violation_observer,
        }
    }

    /// Registers a participant and returns its handle.
    ///
    /// Remote players and spectators start their handshake right away. Adding a
    /// remote player puts the session back into [`SessionState::Synchronizing`].
    ///
    /// # Errors
    /// - [`NetplayError::PlayerOutOfRange`] for a player number outside `1..=num_players`.
    /// - [`NetplayError::InvalidRequest`] if the slot or address is taken, or
    ///   for a second local player.
    /// - [`NetplayError::TooManySpectators`] when every spectator slot is used.
    ///
    /// A spectator that joins a running match receives confirmed frames from
    /// the next frame forwarded to spectators on.
    pub fn add_player(&mut self, player: Player<T::Address>) -> Result<PlayerHandle, NetplayError> {
        let handle = self.player_reg.check_registration(&player)?;
        let now = Instant::now();

        match player.player_type {
            PlayerType::Local => self.player_reg.add_local(handle),
            PlayerType::Remote(addr) => {
                let mut protocol = self.connect(handle, addr, now);
                protocol.synchronize(now)?;
                self.player_reg.add_remote(player.player_num - 1, protocol);
                self.state = SessionState::Synchronizing;
            },
            PlayerType::Spectator(addr) => {
                let mut protocol = self.connect(handle, addr, now);
                protocol.synchronize(now)?;
                self.player_reg.add_spectator(protocol);
            },
        }
        debug!("Registered player {}", handle);
        Ok(handle)
    }

    fn connect(&self, handle: PlayerHandle, addr: T::Address, now: Instant) -> PeerProtocol<T> {
        self.settings
            .connect(handle, addr, self.violation_observer.clone(), now)
    }

    /// Submits the local player's input for the current frame and sends it to
    /// every remote player.
    ///
    /// # Errors
    /// - [`NetplayError::InRollback`] while the engine is resimulating.
    /// - [`NetplayError::NotSynchronized`] while the session is synchronizing.
    /// - [`NetplayError::InvalidPlayerHandle`] if `player_handle` is not the local player.
    /// - [`NetplayError::PredictionThreshold`] if the engine refuses more input.
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), NetplayError> {
        if self.engine.in_rollback() {
            return Err(NetplayError::InRollback);
        }
        if self.state == SessionState::Synchronizing {
            return Err(NetplayError::NotSynchronized);
        }
        let queue = self.player_reg.local_player_queue(player_handle)?;
        let frame = self.engine.add_local_input(queue, input)?;

        // a null frame means a frame delay change swallowed this input
        if !frame.is_null() {
            trace!("Sending local input for frame {}", frame);
            if let Some(status) = self.local_connect_status.get_mut(queue) {
                status.last_frame = frame;
            }
            let game_input = GameInput::single(frame, input);
            let now = Instant::now();
            for protocol in self.player_reg.remotes.values_mut() {
                protocol.send_input(now, &game_input, &self.local_connect_status);
            }
        }
        Ok(())
    }

    /// Returns the inputs of every player for the current frame, with remote
    /// input predicted where it has not arrived yet.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] while the session is synchronizing.
    pub fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError> {
        if self.state == SessionState::Synchronizing {
            return Err(NetplayError::NotSynchronized);
        }
        Ok(self.engine.synchronize_inputs(&self.local_connect_status))
    }

    /// Ends the current frame and polls the network.
    ///
    /// # Errors
    /// [`NetplayError::NotSynchronized`] while the session is synchronizing.
    pub fn advance_frame(&mut self) -> Result<(), NetplayError> {
        if self.state == SessionState::Synchronizing {
            return Err(NetplayError::NotSynchronized);
        }
        trace!("End of frame {}", self.engine.current_frame());
        self.engine.increment_frame();
        self.poll_at(Instant::now());
        Ok(())
    }

    /// Receives and handles everything that arrived, runs connection timers
    /// and sends what is queued.
    pub fn poll_remote_clients(&mut self) {
        self.poll_at(Instant::now());
    }

    pub(crate) fn poll_at(&mut self, now: Instant) {
        if self.engine.in_rollback() {
            return;
        }

        let registry = &mut self.player_reg;
        self.transport
            .poll_incoming(|from, msg| registry.dispatch(now, from, &msg));

        self.poll_protocol_events(now);
        self.check_initial_sync();

        if self.state == SessionState::Running {
            self.engine.check_simulation();
            self.update_confirmed_frame(now);
            self.check_wait_recommendation();
        }

        for protocol in self.player_reg.protocols_mut() {
            protocol.send_all_messages(&mut self.transport);
        }
    }

    fn poll_protocol_events(&mut self, now: Instant) {
        let mut events = Vec::new();
        for protocol in self.player_reg.protocols_mut() {
            let handle = protocol.handle();
            events.extend(
                protocol
                    .poll(now, &self.local_connect_status)
                    .map(|event| (handle, event)),
            );
        }
        for (handle, event) in events {
            if handle.is_spectator() {
                self.on_spectator_event(now, handle, event);
            } else {
                self.on_player_event(now, handle, event);
            }
        }
    }

    fn on_player_event(&mut self, now: Instant, handle: PlayerHandle, event: Event<T>) {
        let Some(queue) = handle.player_queue(self.num_players) else {
            return;
        };
        match event {
            Event::Input { input } => {
                let Some(status) = self.local_connect_status.get_mut(queue) else {
                    return;
                };
                if status.disconnected {
                    return;
                }
                let expected = status.last_frame + 1;
                if !status.last_frame.is_null() && input.frame != expected {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::FrameSync,
                        "Input from player {} for frame {}, expected frame {}",
                        handle,
                        input.frame,
                        expected
                    );
                    return;
                }
                status.last_frame = input.frame;
                self.engine.add_remote_input(queue, input);
            },
            Event::Disconnected => {
                // the peer may already be gone through gossip or a local call
                if let Err(e) = self.disconnect_player_at(now, handle) {
                    trace!("Disconnect event for player {} ignored: {}", handle, e);
                }
            },
            other => self.forward_event(handle, other),
        }
    }

    fn on_spectator_event(&mut self, now: Instant, handle: PlayerHandle, event: Event<T>) {
        match event {
            Event::Input { .. } => {
                trace!("Ignoring input from spectator {}", handle);
            },
            Event::Disconnected => {
                if let Some(protocol) = self.player_reg.protocol_mut(handle) {
                    protocol.disconnect(now);
                }
                self.push_event(NetplayEvent::Disconnected { player: handle });
            },
            other => self.forward_event(handle, other),
        }
    }

    fn forward_event(&mut self, player: PlayerHandle, event: Event<T>) {
        match event {
            Event::Connected => self.push_event(NetplayEvent::Connected { player }),
            Event::Synchronizing { total, count } => self.push_event(NetplayEvent::Synchronizing {
                player,
                count,
                total,
            }),
            Event::Synchronized => {
                self.push_event(NetplayEvent::Synchronized { player });
                self.check_initial_sync();
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
            Event::Input { .. } | Event::Disconnected => (),
        }
    }

    fn push_event(&mut self, event: NetplayEvent) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    /// Leaves the synchronizing state once every player slot is filled and every
    /// connected remote player has completed its handshake. Spectators do not
    /// hold the players back.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        if self.player_reg.num_registered_players() < self.num_players {
            return;
        }
        for (queue, protocol) in &self.player_reg.remotes {
            let disconnected = self
                .local_connect_status
                .get(*queue)
                .map_or(true, |status| status.disconnected);
            if !disconnected && !protocol.is_synchronized() {
                return;
            }
        }
        info!("All peers synchronized, session running");
        self.state = SessionState::Running;
        self.push_event(NetplayEvent::Running);
    }

    fn update_confirmed_frame(&mut self, now: Instant) {
        let current_frame = self.engine.current_frame();
        for protocol in self.player_reg.remotes.values_mut() {
            if protocol.is_running() {
                protocol.update_local_frame_advantage(current_frame);
            }
        }

        let min_confirmed = if self.num_players <= 2 {
            self.poll_two_players(now)
        } else {
            self.poll_n_players(now)
        };
        if min_confirmed == Frame::new(i32::MAX) || !min_confirmed.is_valid() {
            return;
        }

        if self.player_reg.num_spectators() > 0 {
            self.send_confirmed_inputs_to_spectators(now, min_confirmed);
        }
        trace!("Setting last confirmed frame to {}", min_confirmed);
        self.engine.set_last_confirmed_frame(min_confirmed);
    }

    /// Every remote player is directly connected, so each peer only has to be
    /// asked about itself.
    fn poll_two_players(&mut self, now: Instant) -> Frame {
        let mut total_min_confirmed = Frame::new(i32::MAX);
        for queue in 0..self.num_players {
            let queue_connected = self
                .player_reg
                .remotes
                .get(&queue)
                .filter(|p| p.is_running())
                .map_or(true, |p| !p.peer_connect_status(queue).disconnected);

            let Some(local) = self.local_connect_status.get(queue).copied() else {
                continue;
            };
            if !local.disconnected {
                total_min_confirmed = std::cmp::min(total_min_confirmed, local.last_frame);
            }
            if !queue_connected && !local.disconnected {
                debug!("Player {} reports itself disconnected", queue + 1);
                self.disconnect_player_queue(now, queue, total_min_confirmed);
            }
        }
        total_min_confirmed
    }

    /// Combines what every running peer reports about every player, so a
    /// player that dropped from one peer is dropped everywhere at the same frame.
    fn poll_n_players(&mut self, now: Instant) -> Frame {
        let mut total_min_confirmed = Frame::new(i32::MAX);
        for queue in 0..self.num_players {
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::new(i32::MAX);
            for protocol in self.player_reg.remotes.values().filter(|p| p.is_running()) {
                let status = protocol.peer_connect_status(queue);
                queue_connected = queue_connected && !status.disconnected;
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, status.last_frame);
            }

            let Some(local) = self.local_connect_status.get(queue).copied() else {
                continue;
            };
            if !local.disconnected {
                queue_min_confirmed = std::cmp::min(queue_min_confirmed, local.last_frame);
            }

            if queue_connected {
                total_min_confirmed = std::cmp::min(total_min_confirmed, queue_min_confirmed);
            } else if !local.disconnected || local.last_frame > queue_min_confirmed {
                debug!(
                    "Player {} disconnected according to peers at frame {}",
                    queue + 1,
                    queue_min_confirmed
                );
                self.disconnect_player_queue(now, queue, queue_min_confirmed);
            }
        }
        total_min_confirmed
    }

    fn send_confirmed_inputs_to_spectators(&mut self, now: Instant, confirmed_frame: Frame) {
        while self.next_spectator_frame <= confirmed_frame {
            let inputs = match self
                .engine
                .confirmed_inputs(self.next_spectator_frame, &self.local_connect_status)
            {
                Ok(inputs) => inputs,
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::FrameSync,
                        "Confirmed inputs for frame {} unavailable for spectators: {}",
                        self.next_spectator_frame,
                        e
                    );
                    return;
                },
            };
            let game_input = GameInput::new(self.next_spectator_frame, inputs);
            // spectators still in their handshake queue the frame for later
            for protocol in self.player_reg.spectators.iter_mut() {
                protocol.send_input(now, &game_input, &self.local_connect_status);
            }
            self.next_spectator_frame += 1;
        }
    }

    fn check_wait_recommendation(&mut self) {
        let current_frame = self.engine.current_frame();
        if current_frame <= self.next_recommended_sleep {
            return;
        }
        let skip_frames = self
            .player_reg
            .remotes
            .values()
            .filter(|p| p.is_running())
            .map(PeerProtocol::recommend_frame_delay)
            .max()
            .unwrap_or(0);
        if skip_frames > 0 {
            self.push_event(NetplayEvent::WaitRecommendation { skip_frames });
            self.next_recommended_sleep = current_frame + RECOMMENDATION_INTERVAL;
        }
    }

    /// Disconnects a player or spectator.
    ///
    /// Disconnecting the local player disconnects every remote player at the
    /// current frame. A remote player is disconnected at the last frame
    /// confirmed for it, rolling the engine back if the simulation already ran
    /// past that frame with predicted input.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidPlayerHandle`] for unknown handles.
    /// - [`NetplayError::PlayerDisconnected`] if the participant is already gone.
    pub fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), NetplayError> {
        self.disconnect_player_at(Instant::now(), player_handle)
    }

    fn disconnect_player_at(
        &mut self,
        now: Instant,
        player_handle: PlayerHandle,
    ) -> Result<(), NetplayError> {
        if player_handle.is_spectator() {
            let protocol = self
                .player_reg
                .protocol_mut(player_handle)
                .ok_or(NetplayError::InvalidPlayerHandle {
                    handle: player_handle,
                })?;
            if matches!(
                protocol.state(),
                ProtocolState::Disconnected | ProtocolState::Shutdown
            ) {
                return Err(NetplayError::PlayerDisconnected {
                    handle: player_handle,
                });
            }
            protocol.disconnect(now);
            self.push_event(NetplayEvent::Disconnected {
                player: player_handle,
            });
            return Ok(());
        }

        let queue = self.player_reg.player_queue(player_handle)?;
        if self.player_reg.local_queue() == Some(queue) {
            let current_frame = self.engine.current_frame();
            let connected: Vec<usize> = self
                .player_reg
                .remotes
                .keys()
                .copied()
                .filter(|q| {
                    self.local_connect_status
                        .get(*q)
                        .is_some_and(|status| !status.disconnected)
                })
                .collect();
            if connected.is_empty() {
                return Err(NetplayError::PlayerDisconnected {
                    handle: player_handle,
                });
            }
            for remote in connected {
                self.disconnect_player_queue(now, remote, current_frame);
            }
            return Ok(());
        }

        let status = self
            .local_connect_status
            .get(queue)
            .copied()
            .unwrap_or_default();
        if status.disconnected {
            return Err(NetplayError::PlayerDisconnected {
                handle: player_handle,
            });
        }
        self.disconnect_player_queue(now, queue, status.last_frame);
        Ok(())
    }

    fn disconnect_player_queue(&mut self, now: Instant, queue: usize, sync_to: Frame) {
        let current_frame = self.engine.current_frame();
        let handle = PlayerHandle::for_player_queue(queue);
        info!("Disconnecting player {} at frame {}", handle, sync_to);

        if let Some(protocol) = self.player_reg.remotes.get_mut(&queue) {
            protocol.disconnect(now);
        }
        if let Some(status) = self.local_connect_status.get_mut(queue) {
            status.disconnected = true;
            status.last_frame = sync_to;
        }

        // frames after sync_to were simulated with predictions for this player
        let seek_to = if sync_to.is_null() {
            Frame::new(0)
        } else {
            sync_to
        };
        if seek_to < current_frame {
            debug!(
                "Rolling back from frame {} to {} after disconnect",
                current_frame, seek_to
            );
            self.engine.adjust_simulation(seek_to);
        }

        self.push_event(NetplayEvent::Disconnected { player: handle });
        self.check_initial_sync();
    }

    /// Connection quality towards a remote player or spectator.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidPlayerHandle`] for the local player or unknown handles.
    /// - [`NetplayError::NotSynchronized`] before the handshake with that peer completed.
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        self.player_reg
            .protocol(player_handle)
            .ok_or(NetplayError::InvalidPlayerHandle {
                handle: player_handle,
            })?
            .network_stats()
    }

    /// Delays the input of the local player by `frame_delay` frames.
    ///
    /// # Errors
    /// [`NetplayError::InvalidPlayerHandle`] if `player_handle` is not the local player.
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        frame_delay: usize,
    ) -> Result<(), NetplayError> {
        let queue = self.player_reg.local_player_queue(player_handle)?;
        self.engine.set_frame_delay(queue, frame_delay);
        Ok(())
    }

    /// Silence after which a peer is disconnected. Zero disables the check.
    pub fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.settings.disconnect_timeout = timeout;
        for protocol in self.player_reg.protocols_mut() {
            protocol.set_disconnect_timeout(timeout);
        }
    }

    /// Silence after which [`NetplayEvent::NetworkInterrupted`] is reported.
    /// Zero disables the check.
    pub fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.settings.disconnect_notify_start = notify_start;
        for protocol in self.player_reg.protocols_mut() {
            protocol.set_disconnect_notify_start(notify_start);
        }
    }

    /// Drains the queued events.
    pub fn events(&mut self) -> EventDrain<'_> {
        EventDrain::from_drain(self.event_queue.drain(..))
    }

    /// Whether the session is still synchronizing.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the engine will simulate next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.engine.current_frame()
    }

    /// Number of player slots.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Number of registered spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.player_reg.num_spectators()
    }

    /// Handle of the local player, if one is registered.
    #[must_use]
    pub fn local_player_handle(&self) -> Option<PlayerHandle> {
        self.player_reg.local_player_handles().first().copied()
    }

    /// Handles of all remote players.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.remote_player_handles()
    }

    /// Handles of all spectators.
    #[must_use]
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.spectator_handles()
    }

    /// The connect-status row this peer advertises for `player_handle`.
    #[must_use]
    pub fn connection_status(&self, player_handle: PlayerHandle) -> Option<ConnectionStatus> {
        let queue = self.player_reg.player_queue(player_handle).ok()?;
        self.local_connect_status.get(queue).copied()
    }
}

impl<T: Config> Session<T> for P2PSession<T> {
    fn poll_remote_clients(&mut self) {
        P2PSession::poll_remote_clients(self);
    }

    fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), NetplayError> {
        P2PSession::add_local_input(self, player_handle, input)
    }

    fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError> {
        P2PSession::synchronize_input(self)
    }

    fn advance_frame(&mut self) -> Result<(), NetplayError> {
        P2PSession::advance_frame(self)
    }

    fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), NetplayError> {
        P2PSession::disconnect_player(self, player_handle)
    }

    fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        P2PSession::network_stats(self, player_handle)
    }

    fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        frame_delay: usize,
    ) -> Result<(), NetplayError> {
        P2PSession::set_frame_delay(self, player_handle, frame_delay)
    }

    fn set_disconnect_timeout(&mut self, timeout: Duration) {
        P2PSession::set_disconnect_timeout(self, timeout);
    }

    fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        P2PSession::set_disconnect_notify_start(self, notify_start);
    }

    fn events(&mut self) -> EventDrain<'_> {
        P2PSession::events(self)
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
    use crate::frame_info::InputVec;
    use crate::DatagramSocket;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = u8;
    }

    type Wire = Arc<Mutex<BTreeMap<u8, VecDeque<(Vec<u8>, u8)>>>>;

    /// Sockets sharing one lossless in-memory wire.
    struct WireSocket {
        addr: u8,
        wire: Wire,
    }

    impl DatagramSocket<u8> for WireSocket {
        fn send_datagram(&mut self, bytes: &[u8], dest: &u8) -> io::Result<()> {
            self.wire
                .lock()
                .entry(*dest)
                .or_default()
                .push_back((bytes.to_vec(), self.addr));
            Ok(())
        }

        fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, u8)>> {
            let next = self
                .wire
                .lock()
                .get_mut(&self.addr)
                .and_then(VecDeque::pop_front);
            Ok(next.map(|(bytes, from)| {
                buf[..bytes.len()].copy_from_slice(&bytes);
                (bytes.len(), from)
            }))
        }
    }

    #[derive(Default)]
    struct EngineLog {
        frame: i32,
        remote: Vec<(usize, i32, u8)>,
        adjusted: Vec<i32>,
        confirmed: i32,
        delays: Vec<(usize, usize)>,
    }

    /// Accepts every input and records what the session tells it.
    struct RecordingEngine(Arc<Mutex<EngineLog>>);

    impl RollbackEngine<TestConfig> for RecordingEngine {
        fn current_frame(&self) -> Frame {
            Frame::new(self.0.lock().frame)
        }

        fn in_rollback(&self) -> bool {
            false
        }

        fn add_local_input(&mut self, _queue: usize, _input: u8) -> Result<Frame, NetplayError> {
            Ok(Frame::new(self.0.lock().frame))
        }

        fn add_remote_input(&mut self, queue: usize, input: GameInput<u8>) {
            self.0
                .lock()
                .remote
                .push((queue, input.frame.as_i32(), input.inputs[0]));
        }

        fn synchronize_inputs(
            &mut self,
            connect_status: &[ConnectionStatus],
        ) -> Vec<(u8, InputStatus)> {
            connect_status
                .iter()
                .map(|s| {
                    if s.disconnected {
                        (0, InputStatus::Disconnected)
                    } else {
                        (0, InputStatus::Predicted)
                    }
                })
                .collect()
        }

        fn confirmed_inputs(
            &self,
            _frame: Frame,
            connect_status: &[ConnectionStatus],
        ) -> Result<InputVec<u8>, NetplayError> {
            Ok(connect_status.iter().map(|_| 1).collect())
        }

        fn increment_frame(&mut self) {
            self.0.lock().frame += 1;
        }

        fn adjust_simulation(&mut self, seek_to: Frame) {
            self.0.lock().adjusted.push(seek_to.as_i32());
        }

        fn set_last_confirmed_frame(&mut self, frame: Frame) {
            self.0.lock().confirmed = frame.as_i32();
        }

        fn set_frame_delay(&mut self, queue: usize, delay: usize) {
            self.0.lock().delays.push((queue, delay));
        }
    }

    fn session(
        addr: u8,
        num_players: usize,
        wire: &Wire,
        seed: u64,
    ) -> (P2PSession<TestConfig>, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let settings = ConnectionSettings {
            num_players,
            fps: 60,
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::deterministic(seed),
            time_sync_config: TimeSyncConfig::default(),
        };
        let transport = Transport::new(Box::new(WireSocket {
            addr,
            wire: Arc::clone(wire),
        }));
        let session = P2PSession::new(
            settings,
            2,
            "test".to_owned(),
            transport,
            Box::new(RecordingEngine(Arc::clone(&log))),
            None,
        );
        (session, log)
    }

    fn pair() -> (
        P2PSession<TestConfig>,
        P2PSession<TestConfig>,
        Arc<Mutex<EngineLog>>,
        Arc<Mutex<EngineLog>>,
    ) {
        let wire = Wire::default();
        let (mut a, log_a) = session(1, 2, &wire, 10);
        let (mut b, log_b) = session(2, 2, &wire, 20);
        a.add_player(Player::local(1)).unwrap();
        a.add_player(Player::remote(2, 2)).unwrap();
        b.add_player(Player::remote(1, 1)).unwrap();
        b.add_player(Player::local(2)).unwrap();
        (a, b, log_a, log_b)
    }

    fn run_until_running(a: &mut P2PSession<TestConfig>, b: &mut P2PSession<TestConfig>) -> Instant {
        let now = Instant::now();
        for _ in 0..50 {
            a.poll_at(now);
            b.poll_at(now);
            if a.current_state() == SessionState::Running
                && b.current_state() == SessionState::Running
            {
                return now;
            }
        }
        panic!("sessions never synchronized");
    }

    #[test]
    fn session_started_is_first_event() {
        let wire = Wire::default();
        let (mut session, _) = session(1, 2, &wire, 1);
        let events: Vec<_> = session.events().collect();
        assert_eq!(
            events,
            vec![NetplayEvent::SessionStarted {
                game_name: "test".to_owned()
            }]
        );
    }

    #[test]
    fn stays_synchronizing_until_every_slot_is_filled() {
        let wire = Wire::default();
        let (mut session, _) = session(1, 2, &wire, 1);
        session.add_player(Player::local(1)).unwrap();
        session.poll_remote_clients();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
    }

    #[test]
    fn local_only_session_runs_after_first_poll() {
        let wire = Wire::default();
        let (mut session, _) = session(1, 1, &wire, 1);
        let local = session.add_player(Player::local(1)).unwrap();
        assert_eq!(
            session.add_local_input(local, 1),
            Err(NetplayError::NotSynchronized)
        );
        session.poll_remote_clients();
        assert_eq!(session.current_state(), SessionState::Running);
        assert!(session.add_local_input(local, 1).is_ok());
        assert!(session.events().any(|e| e == NetplayEvent::Running));
    }

    #[test]
    fn handshake_reaches_running_with_ordered_events() {
        let (mut a, mut b, _, _) = pair();
        run_until_running(&mut a, &mut b);
        let events: Vec<_> = a.events().collect();
        let remote = PlayerHandle::new(2);
        let connected = events
            .iter()
            .position(|e| *e == NetplayEvent::Connected { player: remote })
            .unwrap();
        let synchronized = events
            .iter()
            .position(|e| *e == NetplayEvent::Synchronized { player: remote })
            .unwrap();
        let running = events
            .iter()
            .position(|e| *e == NetplayEvent::Running)
            .unwrap();
        assert!(connected < synchronized && synchronized < running);
        assert_eq!(
            events.iter().filter(|e| **e == NetplayEvent::Running).count(),
            1
        );
    }

    #[test]
    fn advancing_is_refused_while_synchronizing() {
        let (mut a, _, _, _) = pair();
        assert_eq!(a.advance_frame(), Err(NetplayError::NotSynchronized));
        assert_eq!(a.synchronize_input().err(), Some(NetplayError::NotSynchronized));
    }

    #[test]
    fn input_reaches_remote_engine() {
        let (mut a, mut b, _, log_b) = pair();
        run_until_running(&mut a, &mut b);
        let now = Instant::now();
        a.add_local_input(PlayerHandle::new(1), 42).unwrap();
        a.poll_at(now);
        b.poll_at(now);
        assert_eq!(log_b.lock().remote, vec![(0, 0, 42)]);
        assert_eq!(
            b.connection_status(PlayerHandle::new(1)).unwrap().last_frame,
            Frame::new(0)
        );
    }

    #[test]
    fn local_input_requires_local_handle() {
        let (mut a, mut b, _, _) = pair();
        run_until_running(&mut a, &mut b);
        let remote = PlayerHandle::new(2);
        assert_eq!(
            a.add_local_input(remote, 1),
            Err(NetplayError::InvalidPlayerHandle { handle: remote })
        );
    }

    #[test]
    fn spectator_can_join_a_running_match() {
        let (mut a, mut b, _, _) = pair();
        run_until_running(&mut a, &mut b);
        let handle = a.add_player(Player::spectator(9)).unwrap();
        assert_eq!(handle, PlayerHandle::for_spectator_queue(0));
        assert_eq!(a.current_state(), SessionState::Running);
    }

    #[test]
    fn spectator_can_be_dropped_during_its_handshake() {
        let (mut a, _, _, _) = pair();
        let spectator = a.add_player(Player::spectator(9)).unwrap();
        a.disconnect_player(spectator).unwrap();
        assert_eq!(
            a.disconnect_player(spectator),
            Err(NetplayError::PlayerDisconnected { handle: spectator })
        );
    }

    #[test]
    fn silent_spectator_does_not_hold_players_back() {
        let (mut a, mut b, _, _) = pair();
        // nothing listens at address 9
        a.add_player(Player::spectator(9)).unwrap();
        run_until_running(&mut a, &mut b);
        assert!(a.add_local_input(PlayerHandle::new(1), 3).is_ok());
    }

    #[test]
    fn disconnecting_remote_twice_fails() {
        let (mut a, mut b, log_a, _) = pair();
        run_until_running(&mut a, &mut b);
        log_a.lock().frame = 5;
        let remote = PlayerHandle::new(2);
        a.disconnect_player(remote).unwrap();
        // nothing was confirmed, so the engine resimulates from the start
        assert_eq!(log_a.lock().adjusted, vec![0]);
        assert!(a.connection_status(remote).unwrap().disconnected);
        assert_eq!(
            a.disconnect_player(remote),
            Err(NetplayError::PlayerDisconnected { handle: remote })
        );
        assert!(a
            .events()
            .any(|e| e == NetplayEvent::Disconnected { player: remote }));
    }

    #[test]
    fn disconnecting_local_player_drops_every_remote() {
        let (mut a, mut b, _, _) = pair();
        run_until_running(&mut a, &mut b);
        let local = PlayerHandle::new(1);
        a.disconnect_player(local).unwrap();
        assert!(a.connection_status(PlayerHandle::new(2)).unwrap().disconnected);
        assert_eq!(
            a.disconnect_player(local),
            Err(NetplayError::PlayerDisconnected { handle: local })
        );
    }

    #[test]
    fn remote_disconnect_propagates_to_peer() {
        let (mut a, mut b, _, _) = pair();
        run_until_running(&mut a, &mut b);
        let now = Instant::now();
        a.disconnect_player(PlayerHandle::new(2)).unwrap();
        a.poll_at(now);
        b.poll_at(now);
        assert!(b
            .events()
            .any(|e| e == NetplayEvent::Disconnected { player: PlayerHandle::new(1) }));
    }

    #[test]
    fn silent_peer_is_disconnected_after_timeout() {
        let (mut a, mut b, _, _) = pair();
        let now = run_until_running(&mut a, &mut b);
        // take whatever b still had in flight, then let b go silent
        a.poll_at(now);
        let _ = a.events().count();
        a.poll_at(now + Duration::from_secs(6));
        let events: Vec<_> = a.events().collect();
        assert!(events.contains(&NetplayEvent::NetworkInterrupted {
            player: PlayerHandle::new(2),
            disconnect_timeout: 4250
        }));
        assert!(events.contains(&NetplayEvent::Disconnected {
            player: PlayerHandle::new(2)
        }));
    }

    #[test]
    fn stats_and_frame_delay_handles() {
        let (mut a, mut b, log_a, _) = pair();
        let local = PlayerHandle::new(1);
        let remote = PlayerHandle::new(2);
        assert_eq!(
            a.network_stats(remote).err(),
            Some(NetplayError::NotSynchronized)
        );
        run_until_running(&mut a, &mut b);
        assert!(a.network_stats(remote).is_ok());
        assert_eq!(
            a.network_stats(local).err(),
            Some(NetplayError::InvalidPlayerHandle { handle: local })
        );
        a.set_frame_delay(local, 2).unwrap();
        assert!(a.set_frame_delay(remote, 2).is_err());
        assert_eq!(log_a.lock().delays, vec![(0, 2)]);
    }

    #[test]
    fn event_queue_is_bounded() {
        let wire = Wire::default();
        let (mut session, _) = session(1, 2, &wire, 1);
        for _ in 0..(MAX_EVENT_QUEUE_SIZE + 20) {
            session.push_event(NetplayEvent::Running);
        }
        assert_eq!(session.events().len(), MAX_EVENT_QUEUE_SIZE);
    }
}
