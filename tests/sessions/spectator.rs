//! Spectator sessions watching a two-player match.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::thread;

use rollback_netplay::{
    InputStatus, NetplayError, NetplayEvent, P2PSession, Player, PlayerHandle, SessionBuilder,
    SessionState, SpectatorConfig, SpectatorSession,
};

use crate::common::stubs::{LockstepEngine, StubConfig, StubInput};
use crate::common::{step, test_addr, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL};

const HOST_PORT: u16 = 7200;
const GUEST_PORT: u16 = 7201;
const SPECTATOR_PORT: u16 = 7300;

struct Match {
    host: P2PSession<StubConfig>,
    guest: P2PSession<StubConfig>,
    spectator: SpectatorSession<StubConfig>,
}

fn input_for(player: usize, frame: i32) -> StubInput {
    StubInput {
        inp: player as u32 * 100 + frame as u32,
    }
}

fn player_session(
    network: &MemoryNetwork,
    me: usize,
    spectator: Option<SocketAddr>,
) -> P2PSession<StubConfig> {
    let addrs = [test_addr(HOST_PORT), test_addr(GUEST_PORT)];
    let (engine, _probe) = LockstepEngine::new(2);
    let mut session = SessionBuilder::<StubConfig>::new()
        .start_p2p_session(network.socket(addrs[me]), engine)
        .unwrap();
    for (slot, addr) in addrs.iter().enumerate() {
        let player = if slot == me {
            Player::local(slot + 1)
        } else {
            Player::remote(slot + 1, *addr)
        };
        session.add_player(player).unwrap();
    }
    if let Some(addr) = spectator {
        let handle = session.add_player(Player::spectator(addr)).unwrap();
        assert!(handle.is_spectator());
    }
    session
}

fn new_match(buffer_size: usize) -> Match {
    let network = MemoryNetwork::new();
    let spectator_addr = test_addr(SPECTATOR_PORT);
    let spectator = SessionBuilder::<StubConfig>::new()
        .with_spectator_config(SpectatorConfig { buffer_size })
        .start_spectator_session(test_addr(HOST_PORT), network.socket(spectator_addr))
        .unwrap();
    Match {
        host: player_session(&network, 0, Some(spectator_addr)),
        guest: player_session(&network, 1, None),
        spectator,
    }
}

impl Match {
    fn poll(&mut self) {
        self.host.poll_remote_clients();
        self.guest.poll_remote_clients();
        self.spectator.poll_remote_clients();
    }

    fn synchronize(&mut self) {
        for _ in 0..MAX_SYNC_ITERATIONS {
            self.poll();
            if self.host.current_state() == SessionState::Running
                && self.guest.current_state() == SessionState::Running
                && self.spectator.current_state() == SessionState::Running
            {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        panic!("match did not synchronize");
    }

    fn synchronize_players(&mut self) {
        for _ in 0..MAX_SYNC_ITERATIONS {
            self.host.poll_remote_clients();
            self.guest.poll_remote_clients();
            if self.host.current_state() == SessionState::Running
                && self.guest.current_state() == SessionState::Running
            {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        panic!("players did not synchronize");
    }

    /// Plays until both players reached `frames`, letting the spectator
    /// receive without consuming.
    fn play(&mut self, frames: i32) {
        self.advance_players(frames, true);
        for _ in 0..20 {
            self.poll();
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn advance_players(&mut self, frames: i32, watched: bool) {
        for _ in 0..MAX_SYNC_ITERATIONS * 4 {
            let host_frame = self.host.current_frame().as_i32();
            let guest_frame = self.guest.current_frame().as_i32();
            if host_frame >= frames && guest_frame >= frames {
                break;
            }
            if host_frame < frames {
                step(&mut self.host, PlayerHandle::new(1), input_for(1, host_frame));
            }
            if guest_frame < frames {
                step(&mut self.guest, PlayerHandle::new(2), input_for(2, guest_frame));
            }
            if watched {
                self.spectator.poll_remote_clients();
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Consumes every buffered frame and checks each against what the players
    /// sent. Returns how many frames were replayed.
    fn replay(&mut self) -> i32 {
        let mut replayed = 0;
        loop {
            match self.spectator.synchronize_input() {
                Ok(inputs) => {
                    let frame = replayed;
                    assert_eq!(
                        inputs,
                        vec![
                            (input_for(1, frame), InputStatus::Confirmed),
                            (input_for(2, frame), InputStatus::Confirmed),
                        ]
                    );
                    self.spectator.advance_frame().unwrap();
                    replayed += 1;
                },
                Err(NetplayError::PredictionThreshold) => return replayed,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }
}

#[test]
fn spectator_waits_for_handshake() {
    let mut game = new_match(64);
    assert_eq!(game.spectator.current_state(), SessionState::Synchronizing);
    assert_eq!(
        game.spectator.synchronize_input(),
        Err(NetplayError::NotSynchronized)
    );
    assert_eq!(
        game.spectator.advance_frame(),
        Err(NetplayError::NotSynchronized)
    );
}

#[test]
fn players_run_without_their_spectator() {
    let mut game = new_match(64);
    // the spectator never polls, so its handshake cannot finish
    game.synchronize_players();
    assert_eq!(game.spectator.current_state(), SessionState::Synchronizing);
    assert!(game
        .host
        .add_local_input(PlayerHandle::new(1), input_for(1, 0))
        .is_ok());

    assert_eq!(game.host.num_spectators(), 1);
    assert_eq!(
        game.host.spectator_handles(),
        vec![PlayerHandle::for_spectator_queue(0)]
    );
}

#[test]
fn late_spectator_still_receives_every_frame() {
    let mut game = new_match(64);
    game.synchronize_players();
    game.advance_players(10, false);
    assert_eq!(game.spectator.current_state(), SessionState::Synchronizing);

    game.synchronize();
    game.play(20);
    let replayed = game.replay();
    assert!(replayed >= 15, "only {replayed} frames replayed");
}

#[test]
fn spectator_reports_running_after_the_host() {
    let mut game = new_match(64);
    game.synchronize();

    let events: Vec<_> = game.spectator.events().collect();
    assert!(matches!(events[0], NetplayEvent::SessionStarted { .. }));
    let synchronized = events
        .iter()
        .position(|e| *e == NetplayEvent::Synchronized { player: PlayerHandle::HOST })
        .unwrap();
    let running = events
        .iter()
        .position(|e| *e == NetplayEvent::Running)
        .unwrap();
    assert!(synchronized < running);
}

#[test]
fn spectator_replays_confirmed_frames_in_order() {
    let mut game = new_match(64);
    game.synchronize();

    // nothing confirmed yet
    assert_eq!(
        game.spectator.synchronize_input(),
        Err(NetplayError::PredictionThreshold)
    );

    game.play(20);
    assert!(game.spectator.frames_behind_host() > 0);

    let replayed = game.replay();
    assert!(replayed >= 15, "only {replayed} frames replayed");
    assert_eq!(game.spectator.current_frame().as_i32(), replayed);
    assert_eq!(game.spectator.frames_behind_host(), 0);
}

#[test]
fn lagging_spectator_fails_once_its_buffer_wrapped() {
    let mut game = new_match(8);
    game.synchronize();
    game.play(30);

    assert!(game.spectator.frames_behind_host() > 8);
    assert!(matches!(
        game.spectator.synchronize_input(),
        Err(NetplayError::GeneralFailure { .. })
    ));
}

#[test]
fn spectator_sees_the_host_leave() {
    let mut game = new_match(64);
    game.synchronize();
    game.play(3);
    game.spectator.events().for_each(drop);

    game.host
        .disconnect_player(PlayerHandle::for_spectator_queue(0))
        .unwrap();
    for _ in 0..10 {
        game.poll();
        thread::sleep(POLL_INTERVAL);
    }

    let events: Vec<_> = game.spectator.events().collect();
    assert!(events.contains(&NetplayEvent::Disconnected {
        player: PlayerHandle::HOST
    }));
}
