//! Sessions over real UDP sockets on localhost.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::thread;

use rollback_netplay::{
    NetplayEvent, Player, PlayerHandle, SessionBuilder, SessionState, SyncConfig,
    UdpNonBlockingSocket,
};
use serial_test::serial;

use crate::common::stubs::{LockstepEngine, StubConfig, StubInput};
use crate::common::{
    drain_events, init_tracing, poll_all, step, synchronize_sessions, test_addr, PortAllocator,
    MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};

#[test]
#[serial]
fn two_peers_play_over_udp() {
    init_tracing();
    let (port1, port2) = PortAllocator::next_pair();
    let ports = [port1, port2];

    let mut sessions = Vec::new();
    let mut probes = Vec::new();
    for me in 0..2 {
        let socket = UdpNonBlockingSocket::bind_to_port(ports[me]).unwrap();
        let (engine, probe) = LockstepEngine::new(2);
        let mut session = SessionBuilder::<StubConfig>::new()
            .with_sync_config(SyncConfig::lan())
            .start_p2p_session(socket, engine)
            .unwrap();
        session.add_player(Player::local(me + 1)).unwrap();
        let other = 1 - me;
        session
            .add_player(Player::remote(other + 1, test_addr(ports[other])))
            .unwrap();
        sessions.push(session);
        probes.push(probe);
    }

    {
        let mut refs: Vec<_> = sessions.iter_mut().collect();
        synchronize_sessions(&mut refs);
    }
    assert!(sessions
        .iter()
        .all(|s| s.current_state() == SessionState::Running));
    assert!(drain_events(&mut sessions[0]).contains(&NetplayEvent::Running));

    for _ in 0..MAX_SYNC_ITERATIONS {
        if sessions.iter().all(|s| s.current_frame().as_i32() >= 10) {
            break;
        }
        for (slot, session) in sessions.iter_mut().enumerate() {
            if session.current_frame().as_i32() < 10 {
                let inp = session.current_frame().as_i32() as u32 + 1;
                step(session, PlayerHandle::new(slot + 1), StubInput { inp });
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
    {
        let mut refs: Vec<_> = sessions.iter_mut().collect();
        poll_all(&mut refs, 20);
    }

    for frame in 0..10 {
        let expected = Some(StubInput {
            inp: frame as u32 + 1,
        });
        assert_eq!(probes[0].confirmed_input(1, frame), expected);
        assert_eq!(probes[1].confirmed_input(0, frame), expected);
    }
    let stats = sessions[0].network_stats(PlayerHandle::new(2)).unwrap();
    assert!(stats.packets_sent > 0);
}

#[test]
#[serial]
fn binding_a_port_twice_fails() {
    let port = PortAllocator::next_port();
    let _first = UdpNonBlockingSocket::bind_to_port(port).unwrap();
    assert!(UdpNonBlockingSocket::bind_to_port(port).is_err());
}
