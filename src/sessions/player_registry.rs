//! Bookkeeping of who plays where.
//!
//! The registry maps player handles to queue indices and owns the connection
//! of every remote player and spectator. It enforces the registration rules
//! but knows nothing about session state; the session decides *when* a
//! registration is allowed.

use std::collections::BTreeMap;

use web_time::Instant;

use crate::network::protocol::PeerProtocol;
use crate::{Config, NetplayError, Player, PlayerHandle, PlayerType};

pub(crate) struct PlayerRegistry<T>
where
    T: Config,
{
    num_players: usize,
    max_spectators: usize,
    pub handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    /// Remote player connections, keyed by player queue.
    pub remotes: BTreeMap<usize, PeerProtocol<T>>,
    /// Spectator connections; the position is the spectator queue.
    pub spectators: Vec<PeerProtocol<T>>,
}

impl<T> std::fmt::Debug for PlayerRegistry<T>
where
    T: Config,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            num_players,
            max_spectators,
            handles,
            remotes,
            spectators,
        } = self;

        f.debug_struct("PlayerRegistry")
            .field("num_players", num_players)
            .field("max_spectators", max_spectators)
            .field("handles", handles)
            .field("remotes", &remotes.keys())
            .field("spectators", &spectators.len())
            .finish()
    }
}

impl<T: Config> PlayerRegistry<T> {
    pub fn new(num_players: usize, max_spectators: usize) -> Self {
        Self {
            num_players,
            max_spectators,
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: Vec::new(),
        }
    }

    /// Checks whether `player` may be registered and returns the handle it
    /// would get. Nothing is recorded.
    pub fn check_registration(&self, player: &Player<T::Address>) -> Result<PlayerHandle, NetplayError> {
        match &player.player_type {
            PlayerType::Spectator(addr) => {
                if self.spectators.len() >= self.max_spectators {
                    return Err(NetplayError::TooManySpectators {
                        max: self.max_spectators,
                    });
                }
                self.check_address_free(addr)?;
                Ok(PlayerHandle::for_spectator_queue(self.spectators.len()))
            },
            PlayerType::Local | PlayerType::Remote(_) => {
                if player.player_num < 1 || player.player_num > self.num_players {
                    return Err(NetplayError::PlayerOutOfRange {
                        player_num: player.player_num,
                        num_players: self.num_players,
                    });
                }
                let handle = PlayerHandle::for_player_queue(player.player_num - 1);
                if self.handles.contains_key(&handle) {
                    return Err(NetplayError::InvalidRequest {
                        info: format!("player {} is already registered", player.player_num),
                    });
                }
                match &player.player_type {
                    PlayerType::Local if self.local_queue().is_some() => {
                        Err(NetplayError::InvalidRequest {
                            info: "only one local player per session is supported".to_owned(),
                        })
                    },
                    PlayerType::Remote(addr) => {
                        self.check_address_free(addr)?;
                        Ok(handle)
                    },
                    _ => Ok(handle),
                }
            },
        }
    }

    // one connection per address; a datagram must map to exactly one peer
    fn check_address_free(&self, addr: &T::Address) -> Result<(), NetplayError> {
        if self.protocol_for_address(addr).is_some() {
            return Err(NetplayError::InvalidRequest {
                info: format!("address {addr:?} is already registered"),
            });
        }
        Ok(())
    }

    pub fn add_local(&mut self, handle: PlayerHandle) {
        self.handles.insert(handle, PlayerType::Local);
    }

    pub fn add_remote(&mut self, queue: usize, protocol: PeerProtocol<T>) {
        let handle = PlayerHandle::for_player_queue(queue);
        self.handles
            .insert(handle, PlayerType::Remote(protocol.peer_addr().clone()));
        self.remotes.insert(queue, protocol);
    }

    pub fn add_spectator(&mut self, protocol: PeerProtocol<T>) {
        self.handles.insert(
            protocol.handle(),
            PlayerType::Spectator(protocol.peer_addr().clone()),
        );
        self.spectators.push(protocol);
    }

    /// The queue of a registered player. Spectator and unknown handles fail.
    pub fn player_queue(&self, handle: PlayerHandle) -> Result<usize, NetplayError> {
        match (handle.player_queue(self.num_players), self.handles.get(&handle)) {
            (Some(queue), Some(PlayerType::Local | PlayerType::Remote(_))) => Ok(queue),
            _ => Err(NetplayError::InvalidPlayerHandle { handle }),
        }
    }

    /// The queue of the local player, if `handle` is it.
    pub fn local_player_queue(&self, handle: PlayerHandle) -> Result<usize, NetplayError> {
        match self.handles.get(&handle) {
            Some(PlayerType::Local) => self.player_queue(handle),
            _ => Err(NetplayError::InvalidPlayerHandle { handle }),
        }
    }

    pub fn local_queue(&self) -> Option<usize> {
        self.handles.iter().find_map(|(handle, player_type)| {
            matches!(player_type, PlayerType::Local)
                .then(|| handle.player_queue(self.num_players))
                .flatten()
        })
    }

    pub fn protocol(&self, handle: PlayerHandle) -> Option<&PeerProtocol<T>> {
        match handle.spectator_queue() {
            Some(queue) => self.spectators.get(queue),
            None => handle
                .player_queue(self.num_players)
                .and_then(|queue| self.remotes.get(&queue)),
        }
    }

    pub fn protocol_mut(&mut self, handle: PlayerHandle) -> Option<&mut PeerProtocol<T>> {
        match handle.spectator_queue() {
            Some(queue) => self.spectators.get_mut(queue),
            None => handle
                .player_queue(self.num_players)
                .and_then(|queue| self.remotes.get_mut(&queue)),
        }
    }

    fn protocol_for_address(&self, addr: &T::Address) -> Option<&PeerProtocol<T>> {
        self.protocols().find(|p| p.is_handling_message(addr))
    }

    /// Every connection: remote players in queue order, then spectators.
    pub fn protocols(&self) -> impl Iterator<Item = &PeerProtocol<T>> + '_ {
        self.remotes.values().chain(self.spectators.iter())
    }

    pub fn protocols_mut(&mut self) -> impl Iterator<Item = &mut PeerProtocol<T>> + '_ {
        self.remotes.values_mut().chain(self.spectators.iter_mut())
    }

    /// Hands `msg` to the connection talking to `from`. Messages from unknown
    /// senders are dropped.
    pub fn dispatch(&mut self, now: Instant, from: &T::Address, msg: &crate::Message) {
        match self.protocols_mut().find(|p| p.is_handling_message(from)) {
            Some(protocol) => protocol.handle_message(now, msg),
            None => tracing::trace!("Dropping {} from unknown sender {:?}", msg.kind(), from),
        }
    }

    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Local))
    }

    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Remote(_)))
    }

    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.handles_where(|t| matches!(t, PlayerType::Spectator(_)))
    }

    fn handles_where(&self, pred: impl Fn(&PlayerType<T::Address>) -> bool) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter_map(|(handle, player_type)| pred(player_type).then_some(*handle))
            .collect()
    }

    pub fn num_spectators(&self) -> usize {
        self.spectators.len()
    }

    /// Local and remote players registered so far.
    pub fn num_registered_players(&self) -> usize {
        self.handles.keys().filter(|h| !h.is_spectator()).count()
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
    use proptest::prelude::*;
    use web_time::Duration;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = u16;
    }

    fn peer(handle: PlayerHandle, addr: u16) -> PeerProtocol<TestConfig> {
        PeerProtocol::new(
            handle,
            addr,
            4,
            Duration::from_millis(5000),
            Duration::from_millis(750),
            60,
            SyncConfig::default(),
            ProtocolConfig::deterministic(u64::from(addr)),
            TimeSyncConfig::default(),
            None,
            Instant::now(),
        )
    }

    fn register(reg: &mut PlayerRegistry<TestConfig>, player: Player<u16>) -> PlayerHandle {
        let handle = reg.check_registration(&player).unwrap();
        match player.player_type {
            PlayerType::Local => reg.add_local(handle),
            PlayerType::Remote(addr) => reg.add_remote(player.player_num - 1, peer(handle, addr)),
            PlayerType::Spectator(addr) => reg.add_spectator(peer(handle, addr)),
        }
        handle
    }

    #[test]
    fn player_numbers_outside_range_are_rejected() {
        let reg = PlayerRegistry::<TestConfig>::new(2, 4);
        for player_num in [0, 3] {
            let err = reg.check_registration(&Player::local(player_num)).unwrap_err();
            assert_eq!(
                err,
                NetplayError::PlayerOutOfRange {
                    player_num,
                    num_players: 2
                }
            );
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut reg = PlayerRegistry::<TestConfig>::new(2, 4);
        register(&mut reg, Player::local(1));
        assert!(reg.check_registration(&Player::remote(1, 9)).is_err());
    }

    #[test]
    fn second_local_player_is_rejected() {
        let mut reg = PlayerRegistry::<TestConfig>::new(3, 4);
        register(&mut reg, Player::local(1));
        assert!(reg.check_registration(&Player::local(2)).is_err());
    }

    #[test]
    fn address_can_only_be_used_once() {
        let mut reg = PlayerRegistry::<TestConfig>::new(3, 4);
        register(&mut reg, Player::remote(2, 7));
        assert!(reg.check_registration(&Player::remote(3, 7)).is_err());
        assert!(reg.check_registration(&Player::spectator(7)).is_err());
    }

    #[test]
    fn spectator_capacity_is_enforced() {
        let mut reg = PlayerRegistry::<TestConfig>::new(2, 2);
        assert_eq!(register(&mut reg, Player::spectator(10)).as_usize(), 1000);
        assert_eq!(register(&mut reg, Player::spectator(11)).as_usize(), 1001);
        assert_eq!(
            reg.check_registration(&Player::spectator(12)),
            Err(NetplayError::TooManySpectators { max: 2 })
        );
    }

    #[test]
    fn spectator_handles_are_not_player_queues() {
        let mut reg = PlayerRegistry::<TestConfig>::new(2, 2);
        let spectator = register(&mut reg, Player::spectator(10));
        assert!(reg.player_queue(spectator).is_err());
        assert!(reg.protocol(spectator).is_some());
        assert_eq!(reg.spectator_handles(), vec![spectator]);
    }

    #[test]
    fn local_queue_lookup() {
        let mut reg = PlayerRegistry::<TestConfig>::new(2, 0);
        let local = register(&mut reg, Player::local(2));
        let remote = register(&mut reg, Player::remote(1, 5));
        assert_eq!(reg.local_queue(), Some(1));
        assert_eq!(reg.local_player_queue(local), Ok(1));
        assert!(reg.local_player_queue(remote).is_err());
        assert_eq!(reg.remote_player_handles(), vec![remote]);
        assert_eq!(reg.local_player_handles(), vec![local]);
    }

    #[test]
    fn unregistered_handle_is_invalid() {
        let reg = PlayerRegistry::<TestConfig>::new(2, 0);
        let handle = PlayerHandle::new(1);
        assert_eq!(
            reg.player_queue(handle),
            Err(NetplayError::InvalidPlayerHandle { handle })
        );
    }

    #[test]
    fn dispatch_routes_by_sender() {
        use crate::network::messages::{Message, MessageBody, MessageHeader, SyncRequest};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut reg = PlayerRegistry::<TestConfig>::new(2, 0);
        let remote = register(&mut reg, Player::remote(2, 5));
        let msg = Message {
            header: MessageHeader::default(),
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 1,
                remaining_roundtrips: 1,
            }),
        };
        reg.dispatch(Instant::now(), &6, &msg);
        reg.dispatch(Instant::now(), &5, &msg);

        let sent = Arc::new(AtomicUsize::new(0));
        let mut transport = crate::network::transport::Transport::<TestConfig>::new(Box::new(
            Counting(Arc::clone(&sent)),
        ));
        reg.protocol_mut(remote).unwrap().send_all_messages(&mut transport);
        // one sync reply; the unknown sender got nothing
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    struct Counting(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl crate::DatagramSocket<u16> for Counting {
        fn send_datagram(&mut self, _bytes: &[u8], _dest: &u16) -> std::io::Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn poll_datagram(&mut self, _buf: &mut [u8]) -> std::io::Result<Option<(usize, u16)>> {
            Ok(None)
        }
    }

    proptest! {
        #[test]
        fn handle_maps_back_to_queue(num_players in 1usize..8, order in proptest::collection::vec(any::<u16>(), 8)) {
            let mut reg = PlayerRegistry::<TestConfig>::new(num_players, 0);
            // register every slot in a shuffled order
            let mut slots: Vec<usize> = (1..=num_players).collect();
            for (i, key) in order.iter().enumerate().take(num_players) {
                let j = usize::from(*key) % num_players;
                slots.swap(i % num_players, j);
            }
            for (n, player_num) in slots.iter().enumerate() {
                let player = if n == 0 {
                    Player::local(*player_num)
                } else {
                    Player::remote(*player_num, 100 + *player_num as u16)
                };
                let handle = register(&mut reg, player);
                prop_assert_eq!(reg.player_queue(handle), Ok(player_num - 1));
                prop_assert_eq!(handle, PlayerHandle::for_player_queue(player_num - 1));
            }
        }
    }
}
