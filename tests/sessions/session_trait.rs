//! Driving both session kinds through the `Session` trait and `SessionSlot`.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rollback_netplay::telemetry::{CollectingObserver, ViolationKind};
use rollback_netplay::{
    Config, NetplayError, Player, PlayerHandle, Session, SessionBuilder, SessionSlot,
    SessionState,
};

use crate::common::stubs::{LockstepEngine, StubConfig, StubInput};
use crate::common::{test_addr, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL};

/// Works with any session without knowing its concrete type.
fn poll_and_report<T: Config>(session: &mut dyn Session<T>) -> (SessionState, usize) {
    session.poll_remote_clients();
    let events = session.events().count();
    (session.current_state(), events)
}

fn two_player_slots(network: &MemoryNetwork) -> [SessionSlot<StubConfig>; 2] {
    let addrs = [test_addr(7400), test_addr(7401)];
    [0, 1].map(|me| {
        let (engine, _probe) = LockstepEngine::new(2);
        let mut session = SessionBuilder::<StubConfig>::new()
            .start_p2p_session(network.socket(addrs[me]), engine)
            .unwrap();
        session.add_player(Player::local(me + 1)).unwrap();
        let other = 1 - me;
        session
            .add_player(Player::remote(other + 1, addrs[other]))
            .unwrap();
        SessionSlot::from(session)
    })
}

#[test]
fn both_session_kinds_are_usable_as_trait_objects() {
    let network = MemoryNetwork::new();
    let (engine, _probe) = LockstepEngine::new(2);
    let mut p2p = SessionBuilder::<StubConfig>::new()
        .start_p2p_session(network.socket(test_addr(7500)), engine)
        .unwrap();
    p2p.add_player(Player::local(1)).unwrap();
    p2p.add_player(Player::remote(2, test_addr(7501))).unwrap();
    let mut spectator = SessionBuilder::<StubConfig>::new()
        .start_spectator_session(test_addr(7500), network.socket(test_addr(7502)))
        .unwrap();

    let (state, events) = poll_and_report(&mut p2p);
    assert_eq!(state, SessionState::Synchronizing);
    assert!(events >= 1);
    let (state, events) = poll_and_report(&mut spectator);
    assert_eq!(state, SessionState::Synchronizing);
    assert!(events >= 1);
}

#[test]
fn spectators_refuse_player_operations() {
    let network = MemoryNetwork::new();
    let mut spectator = SessionBuilder::<StubConfig>::new()
        .start_spectator_session(test_addr(7600), network.socket(test_addr(7601)))
        .unwrap();
    let session: &mut dyn Session<StubConfig> = &mut spectator;

    assert!(matches!(
        session.add_local_input(PlayerHandle::new(1), StubInput { inp: 1 }),
        Err(NetplayError::Unsupported { .. })
    ));
    assert!(matches!(
        session.set_frame_delay(PlayerHandle::new(1), 2),
        Err(NetplayError::Unsupported { .. })
    ));
    assert!(matches!(
        session.disconnect_player(PlayerHandle::HOST),
        Err(NetplayError::Unsupported { .. })
    ));
    assert!(matches!(
        session.network_stats(PlayerHandle::new(1)),
        Err(NetplayError::InvalidPlayerHandle { .. })
    ));
}

#[test]
fn slots_drive_a_match_to_running() {
    let network = MemoryNetwork::new();
    let mut slots = two_player_slots(&network);

    for _ in 0..MAX_SYNC_ITERATIONS {
        for slot in &mut slots {
            slot.poll_remote_clients().unwrap();
        }
        if slots
            .iter()
            .all(|s| s.current_state() == Ok(SessionState::Running))
        {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    assert_eq!(slots[0].current_state(), Ok(SessionState::Running));

    slots[0]
        .add_local_input(PlayerHandle::new(1), StubInput { inp: 4 })
        .unwrap();
    let inputs = slots[0].synchronize_input().unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0].0, StubInput { inp: 4 });
    slots[0].advance_frame().unwrap();
    assert!(slots[0].network_stats(PlayerHandle::new(2)).is_ok());

    slots[0].close();
    assert_eq!(
        slots[0].advance_frame(),
        Err(NetplayError::InvalidSession)
    );
    assert_eq!(slots[0].events().count(), 0);
}

#[test]
fn slot_settings_reach_the_held_session() {
    let network = MemoryNetwork::new();
    let [mut slot, _other] = two_player_slots(&network);
    slot.set_disconnect_timeout(Duration::from_millis(500))
        .unwrap();
    slot.set_disconnect_notify_start(Duration::from_millis(100))
        .unwrap();

    let mut empty = SessionSlot::<StubConfig>::default();
    assert_eq!(
        empty.set_disconnect_timeout(Duration::from_millis(500)),
        Err(NetplayError::InvalidSession)
    );
    let previous = empty.replace(Box::new(
        SessionBuilder::<StubConfig>::new()
            .start_spectator_session(test_addr(7400), network.socket(test_addr(7402)))
            .unwrap(),
    ));
    assert!(previous.is_none());
    assert!(empty.is_open());
}

#[test]
fn garbage_datagrams_are_reported_to_the_observer() {
    let network = MemoryNetwork::new();
    let observer = Arc::new(CollectingObserver::new());
    let (engine, _probe) = LockstepEngine::new(2);
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_violation_observer(observer.clone())
        .start_p2p_session(network.socket(test_addr(7700)), engine)
        .unwrap();
    session.add_player(Player::local(1)).unwrap();
    session
        .add_player(Player::remote(2, test_addr(7701)))
        .unwrap();

    let mut stranger = network.socket(test_addr(7701));
    rollback_netplay::DatagramSocket::send_datagram(
        &mut stranger,
        &[0xde, 0xad, 0xbe, 0xef],
        &test_addr(7700),
    )
    .unwrap();
    session.poll_remote_clients();

    assert!(observer.has_violation(ViolationKind::Transport));
    assert_eq!(session.current_state(), SessionState::Synchronizing);
}
