//! P2P session tests over the in-memory network.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use rollback_netplay::{
    NetplayError, NetplayEvent, P2PSession, Player, PlayerHandle, SessionBuilder, SessionState,
    SyncConfig,
};

use crate::common::stubs::{EngineProbe, LockstepEngine, StubConfig, StubInput};
use crate::common::{
    drain_events, init_tracing, poll_all, seeded_protocol_config, step, synchronize_sessions,
    test_addr, MemoryNetwork, MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};

struct Peer {
    session: P2PSession<StubConfig>,
    handle: PlayerHandle,
    probe: EngineProbe,
}

impl Peer {
    /// Plays one frame with an input derived from player and frame.
    fn tick(&mut self) -> bool {
        let frame = self.session.current_frame().as_i32();
        let input = input_for(self.handle, frame);
        step(&mut self.session, self.handle, input)
    }
}

fn input_for(handle: PlayerHandle, frame: i32) -> StubInput {
    StubInput {
        inp: handle.as_usize() as u32 * 1000 + frame as u32,
    }
}

fn addrs(count: u16) -> Vec<SocketAddr> {
    (0..count).map(|i| test_addr(7000 + i)).collect()
}

/// Builds the peer that plays slot `me` of a session between `addrs`.
fn build_peer(
    network: &MemoryNetwork,
    addrs: &[SocketAddr],
    me: usize,
    builder: SessionBuilder<StubConfig>,
) -> Peer {
    let (engine, probe) = LockstepEngine::new(addrs.len());
    let mut session = builder
        .with_num_players(addrs.len())
        .unwrap()
        .with_protocol_config(seeded_protocol_config(me as u64))
        .start_p2p_session(network.socket(addrs[me]), engine)
        .unwrap();
    let mut handle = PlayerHandle::HOST;
    for (slot, addr) in addrs.iter().enumerate() {
        let player = if slot == me {
            Player::local(slot + 1)
        } else {
            Player::remote(slot + 1, *addr)
        };
        let registered = session.add_player(player).unwrap();
        if slot == me {
            handle = registered;
        }
    }
    Peer {
        session,
        handle,
        probe,
    }
}

fn peers(network: &MemoryNetwork, count: u16) -> Vec<Peer> {
    let addrs = addrs(count);
    (0..addrs.len())
        .map(|me| build_peer(network, &addrs, me, SessionBuilder::new()))
        .collect()
}

fn synchronize(peers: &mut [Peer]) {
    let mut sessions: Vec<_> = peers.iter_mut().map(|p| &mut p.session).collect();
    synchronize_sessions(&mut sessions);
}

fn settle(peers: &mut [Peer], rounds: usize) {
    let mut sessions: Vec<_> = peers.iter_mut().map(|p| &mut p.session).collect();
    poll_all(&mut sessions, rounds);
}

/// Ticks every peer until all of them reached `frames`.
fn run_frames(peers: &mut [Peer], frames: i32) {
    for _ in 0..MAX_SYNC_ITERATIONS * 4 {
        if peers
            .iter()
            .all(|p| p.session.current_frame().as_i32() >= frames)
        {
            return;
        }
        for peer in peers.iter_mut() {
            if peer.session.current_frame().as_i32() < frames {
                peer.tick();
            } else {
                peer.session.poll_remote_clients();
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
    panic!("peers did not reach frame {frames}");
}

fn position(events: &[NetplayEvent], wanted: &NetplayEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("missing {wanted:?} in {events:?}"))
}

#[test]
fn handshake_reports_progress_then_running() {
    init_tracing();
    let network = MemoryNetwork::new();
    let addrs = addrs(2);
    let builder = || SessionBuilder::new().with_game_name("arena");
    let mut peers = vec![
        build_peer(&network, &addrs, 0, builder()),
        build_peer(&network, &addrs, 1, builder()),
    ];
    assert_eq!(peers[0].session.current_state(), SessionState::Synchronizing);

    synchronize(&mut peers);

    let remote = PlayerHandle::new(2);
    let events = drain_events(&mut peers[0].session);
    assert_eq!(
        events[0],
        NetplayEvent::SessionStarted {
            game_name: "arena".to_owned()
        }
    );
    let connected = position(&events, &NetplayEvent::Connected { player: remote });
    let synchronized = position(&events, &NetplayEvent::Synchronized { player: remote });
    let running = position(&events, &NetplayEvent::Running);
    assert!(connected < synchronized && synchronized < running);

    let progress: Vec<(u32, u32)> = events
        .iter()
        .filter_map(|e| match e {
            NetplayEvent::Synchronizing { count, total, .. } => Some((*count, *total)),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(progress.iter().all(|(count, total)| count <= total));
}

#[test]
fn frames_cannot_advance_before_handshake() {
    let network = MemoryNetwork::new();
    let addrs = addrs(2);
    let mut peer = build_peer(&network, &addrs, 0, SessionBuilder::new());
    peer.session.poll_remote_clients();

    assert_eq!(
        peer.session.add_local_input(peer.handle, StubInput { inp: 1 }),
        Err(NetplayError::NotSynchronized)
    );
    assert_eq!(
        peer.session.advance_frame(),
        Err(NetplayError::NotSynchronized)
    );
    assert_eq!(peer.session.current_frame().as_i32(), 0);
}

#[test]
fn inputs_are_confirmed_on_both_sides() {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    synchronize(&mut peers);

    run_frames(&mut peers, 30);
    settle(&mut peers, 20);

    for frame in 0..30 {
        assert_eq!(
            peers[0].probe.confirmed_input(1, frame),
            Some(input_for(PlayerHandle::new(2), frame))
        );
        assert_eq!(
            peers[1].probe.confirmed_input(0, frame),
            Some(input_for(PlayerHandle::new(1), frame))
        );
    }
    assert!(peers[0].probe.last_confirmed() >= 20);
}

#[test]
fn misprediction_rolls_the_engine_back() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    synchronize(&mut peers);

    // the second peer runs ahead, predicting a zero input for the first one
    for _ in 0..3 {
        assert!(peers[1].tick());
    }
    assert!(peers[1].probe.rollbacks().is_empty());

    for _ in 0..3 {
        assert!(peers[0].tick());
    }
    settle(&mut peers, 10);

    let rollbacks = peers[1].probe.rollbacks();
    assert_eq!(rollbacks.first(), Some(&0));
}

#[test]
fn wrong_handles_are_rejected() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    synchronize(&mut peers);
    let session = &mut peers[0].session;

    assert_eq!(
        session.add_local_input(PlayerHandle::new(2), StubInput { inp: 3 }),
        Err(NetplayError::InvalidPlayerHandle {
            handle: PlayerHandle::new(2)
        })
    );
    assert!(matches!(
        session.network_stats(PlayerHandle::new(9)),
        Err(NetplayError::InvalidPlayerHandle { .. })
    ));
    assert!(matches!(
        session.disconnect_player(PlayerHandle::new(9)),
        Err(NetplayError::InvalidPlayerHandle { .. })
    ));
    assert!(matches!(
        session.add_player(Player::local(2)),
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn handles_describe_the_roster() {
    let network = MemoryNetwork::new();
    let peers = peers(&network, 3);
    let session = &peers[1].session;

    assert_eq!(session.num_players(), 3);
    assert_eq!(session.local_player_handle(), Some(PlayerHandle::new(2)));
    assert_eq!(
        session.remote_player_handles(),
        vec![PlayerHandle::new(1), PlayerHandle::new(3)]
    );
    assert!(session.spectator_handles().is_empty());
}

#[test]
fn explicit_disconnect_reaches_the_peer() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    synchronize(&mut peers);
    run_frames(&mut peers, 5);
    drain_events(&mut peers[0].session);
    drain_events(&mut peers[1].session);

    let remote = PlayerHandle::new(2);
    peers[0].session.disconnect_player(remote).unwrap();
    assert!(drain_events(&mut peers[0].session)
        .contains(&NetplayEvent::Disconnected { player: remote }));
    assert_eq!(
        peers[0].session.disconnect_player(remote),
        Err(NetplayError::PlayerDisconnected { handle: remote })
    );
    let status = peers[0].session.connection_status(remote).unwrap();
    assert!(status.disconnected);

    settle(&mut peers, 10);
    assert!(drain_events(&mut peers[1].session).contains(&NetplayEvent::Disconnected {
        player: PlayerHandle::new(1)
    }));
}

#[test]
fn silent_peer_is_interrupted_then_disconnected() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    synchronize(&mut peers);
    run_frames(&mut peers, 3);

    let session = &mut peers[0].session;
    session.set_disconnect_timeout(Duration::from_millis(120));
    session.set_disconnect_notify_start(Duration::from_millis(40));
    drain_events(session);

    network.cut_off(test_addr(7001));
    let deadline = Instant::now() + Duration::from_secs(2);
    let remote = PlayerHandle::new(2);
    let mut events = Vec::new();
    while Instant::now() < deadline
        && !events.contains(&NetplayEvent::Disconnected { player: remote })
    {
        session.poll_remote_clients();
        events.extend(session.events());
        thread::sleep(POLL_INTERVAL);
    }

    let interrupted = events
        .iter()
        .position(|e| matches!(e, NetplayEvent::NetworkInterrupted { player, .. } if *player == remote))
        .unwrap_or_else(|| panic!("no interruption in {events:?}"));
    let disconnected = position(&events, &NetplayEvent::Disconnected { player: remote });
    assert!(interrupted < disconnected);
    assert!(matches!(
        events[interrupted],
        NetplayEvent::NetworkInterrupted {
            disconnect_timeout: 80,
            ..
        }
    ));
}

#[test]
fn interrupted_peer_resumes_when_traffic_returns() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    for peer in &mut peers {
        peer.session.set_disconnect_timeout(Duration::from_secs(5));
        peer.session
            .set_disconnect_notify_start(Duration::from_millis(30));
    }
    synchronize(&mut peers);
    run_frames(&mut peers, 3);
    drain_events(&mut peers[0].session);

    network.cut_off(test_addr(7001));
    settle(&mut peers, 1);
    thread::sleep(Duration::from_millis(80));
    settle(&mut peers, 2);
    network.reconnect(test_addr(7001));
    // keepalives flow on the default 200 ms interval
    for _ in 0..40 {
        settle(&mut peers, 1);
        thread::sleep(Duration::from_millis(10));
    }

    let remote = PlayerHandle::new(2);
    let events = drain_events(&mut peers[0].session);
    let interrupted = events
        .iter()
        .position(|e| matches!(e, NetplayEvent::NetworkInterrupted { player, .. } if *player == remote))
        .unwrap_or_else(|| panic!("no interruption in {events:?}"));
    let resumed = position(&events, &NetplayEvent::NetworkResumed { player: remote });
    assert!(interrupted < resumed);
    assert!(!events.contains(&NetplayEvent::Disconnected { player: remote }));
}

#[test]
fn three_players_exchange_inputs() {
    init_tracing();
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 3);
    synchronize(&mut peers);

    run_frames(&mut peers, 20);
    settle(&mut peers, 20);

    for frame in 0..20 {
        for (observer, peer) in peers.iter().enumerate() {
            for queue in (0..3).filter(|q| *q != observer) {
                assert_eq!(
                    peer.probe.confirmed_input(queue, frame),
                    Some(input_for(PlayerHandle::for_player_queue(queue), frame)),
                    "peer {observer} queue {queue} frame {frame}"
                );
            }
        }
    }
}

#[test]
fn disconnect_spreads_through_connection_gossip() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 3);
    synchronize(&mut peers);
    run_frames(&mut peers, 5);
    for peer in &mut peers {
        drain_events(&mut peer.session);
    }

    // the first peer drops the third; the second still hears from it
    let third = PlayerHandle::new(3);
    peers[0].session.disconnect_player(third).unwrap();
    run_frames(&mut peers[..2], 15);
    settle(&mut peers, 10);

    let events = drain_events(&mut peers[1].session);
    assert!(
        events.contains(&NetplayEvent::Disconnected { player: third }),
        "{events:?}"
    );
    assert!(peers[1].session.connection_status(third).unwrap().disconnected);
}

#[test]
fn frame_delay_shifts_local_input() {
    let network = MemoryNetwork::new();
    let mut peers = peers(&network, 2);
    let local = peers[0].handle;
    peers[0].session.set_frame_delay(local, 2).unwrap();
    assert!(matches!(
        peers[0].session.set_frame_delay(PlayerHandle::new(2), 2),
        Err(NetplayError::InvalidPlayerHandle { .. })
    ));
    synchronize(&mut peers);
    run_frames(&mut peers, 6);
    settle(&mut peers, 10);

    // frames 0 and 1 never carry input from the delayed player
    assert_eq!(peers[0].probe.confirmed_frames(0).first(), Some(&2));
    assert_eq!(
        peers[1].probe.confirmed_input(0, 2),
        Some(input_for(local, 0))
    );
}

#[test]
fn input_sent_during_peer_handshake_arrives_once_it_runs() {
    let network = MemoryNetwork::new();
    let addrs = addrs(2);
    let slow = SyncConfig {
        num_sync_packets: 20,
        ..SyncConfig::default()
    };
    let mut peers = vec![
        build_peer(&network, &addrs, 0, SessionBuilder::new()),
        build_peer(&network, &addrs, 1, SessionBuilder::new().with_sync_config(slow)),
    ];
    for _ in 0..MAX_SYNC_ITERATIONS {
        if peers[0].session.current_state() == SessionState::Running {
            break;
        }
        settle(&mut peers, 1);
    }
    assert_eq!(peers[0].session.current_state(), SessionState::Running);
    assert_eq!(peers[1].session.current_state(), SessionState::Synchronizing);

    // peer 1 drops these while its own handshake still runs
    for _ in 0..3 {
        assert!(peers[0].tick());
    }
    settle(&mut peers, 1);
    assert!(peers[1].probe.confirmed_frames(0).is_empty());

    synchronize(&mut peers);
    for _ in 0..MAX_SYNC_ITERATIONS {
        if peers[1].probe.confirmed_input(0, 2).is_some() {
            break;
        }
        settle(&mut peers, 1);
    }
    let sender = peers[0].handle;
    for frame in 0..3 {
        assert_eq!(
            peers[1].probe.confirmed_input(0, frame),
            Some(input_for(sender, frame))
        );
    }
}
