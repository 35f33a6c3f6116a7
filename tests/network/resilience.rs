//! Sessions over an in-memory network that drops and reorders datagrams.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::thread;

use rollback_netplay::telemetry::{CollectingObserver, ViolationKind};
use rollback_netplay::{P2PSession, Player, PlayerHandle, SessionBuilder, SessionState};

use crate::common::stubs::{EngineProbe, LockstepEngine, StubConfig, StubInput};
use crate::common::{
    fast_sync_config, init_tracing, poll_all, seeded_protocol_config, step, synchronize_sessions,
    test_addr, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};

fn input_for(player: usize, frame: i32) -> StubInput {
    StubInput {
        inp: ((player as u32) << 16) | frame as u32,
    }
}

struct LossyMatch {
    sessions: Vec<P2PSession<StubConfig>>,
    probes: Vec<EngineProbe>,
    observer: Arc<CollectingObserver>,
    network: MemoryNetwork,
}

fn lossy_match(seed: u64, loss_percent: u32, reorder_percent: u32) -> LossyMatch {
    let network = MemoryNetwork::lossy(seed, loss_percent, reorder_percent);
    let observer = Arc::new(CollectingObserver::new());
    let addrs = [test_addr(8000), test_addr(8001)];
    let mut sessions = Vec::new();
    let mut probes = Vec::new();
    for me in 0..2 {
        let (engine, probe) = LockstepEngine::new(2);
        let mut session = SessionBuilder::<StubConfig>::new()
            .with_sync_config(fast_sync_config())
            .with_protocol_config(seeded_protocol_config(seed + me as u64))
            .with_violation_observer(observer.clone())
            .start_p2p_session(network.socket(addrs[me]), engine)
            .unwrap();
        session.add_player(Player::local(me + 1)).unwrap();
        let other = 1 - me;
        session
            .add_player(Player::remote(other + 1, addrs[other]))
            .unwrap();
        sessions.push(session);
        probes.push(probe);
    }
    LossyMatch {
        sessions,
        probes,
        observer,
        network,
    }
}

impl LossyMatch {
    fn synchronize(&mut self) {
        let mut sessions: Vec<_> = self.sessions.iter_mut().collect();
        synchronize_sessions(&mut sessions);
    }

    fn play(&mut self, frames: i32) {
        for _ in 0..MAX_SYNC_ITERATIONS * 10 {
            let mut done = true;
            for (slot, session) in self.sessions.iter_mut().enumerate() {
                let frame = session.current_frame().as_i32();
                if frame < frames {
                    done = false;
                    step(session, PlayerHandle::new(slot + 1), input_for(slot + 1, frame));
                } else {
                    session.poll_remote_clients();
                }
            }
            if done {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        let mut sessions: Vec<_> = self.sessions.iter_mut().collect();
        poll_all(&mut sessions, 200);
    }

    fn assert_all_confirmed(&self, frames: i32) {
        for frame in 0..frames {
            assert_eq!(
                self.probes[0].confirmed_input(1, frame),
                Some(input_for(2, frame)),
                "first peer is missing frame {frame}"
            );
            assert_eq!(
                self.probes[1].confirmed_input(0, frame),
                Some(input_for(1, frame)),
                "second peer is missing frame {frame}"
            );
        }
    }
}

#[test]
fn handshake_completes_despite_loss() {
    init_tracing();
    let mut game = lossy_match(7, 25, 0);
    game.synchronize();
    assert!(game
        .sessions
        .iter()
        .all(|s| s.current_state() == SessionState::Running));
    assert!(game.network.dropped() > 0);
}

#[test]
fn inputs_arrive_complete_and_in_order_despite_loss() {
    init_tracing();
    for seed in [1, 2, 3] {
        let mut game = lossy_match(seed, 20, 0);
        game.synchronize();
        game.play(40);
        game.assert_all_confirmed(40);
        assert!(
            !game.observer.has_violation(ViolationKind::FrameSync),
            "seed {seed}: {:?}",
            game.observer.violations()
        );
    }
}

#[test]
fn reordered_datagrams_do_not_corrupt_inputs() {
    let mut game = lossy_match(11, 10, 30);
    game.synchronize();
    game.play(40);
    game.assert_all_confirmed(40);
    assert!(!game.observer.has_violation(ViolationKind::FrameSync));
}

#[test]
fn lost_inputs_cause_rollbacks_not_divergence() {
    let mut game = lossy_match(5, 30, 10);
    game.synchronize();
    game.play(60);
    game.assert_all_confirmed(60);
    assert!(game.network.delivered() > 0);
    // input changes every frame, so any late arrival is a misprediction
    let rollbacks = game.probes[0].rollbacks().len() + game.probes[1].rollbacks().len();
    assert!(rollbacks > 0);
}
