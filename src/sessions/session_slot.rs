//! A place to keep a session that may not exist yet, or anymore.
//!
//! Game loops often hold "the current session" in a long-lived struct, with
//! periods where no session is running (menus, after a match ended). The slot
//! forwards every [`Session`] operation and answers
//! [`NetplayError::InvalidSession`] while it is empty.

use web_time::Duration;

use crate::{
    Config, EventDrain, InputStatus, NetplayError, NetworkStats, P2PSession, PlayerHandle,
    Session, SessionState, SpectatorSession,
};

/// Holds at most one session of any kind.
pub struct SessionSlot<T: Config> {
    backend: Option<Box<dyn Session<T>>>,
}

impl<T: Config> Default for SessionSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Config> std::fmt::Debug for SessionSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("open", &self.is_open())
            .finish()
    }
}

impl<T: Config> From<P2PSession<T>> for SessionSlot<T> {
    fn from(session: P2PSession<T>) -> Self {
        Self::with_backend(Box::new(session))
    }
}

impl<T: Config> From<SpectatorSession<T>> for SessionSlot<T> {
    fn from(session: SpectatorSession<T>) -> Self {
        Self::with_backend(Box::new(session))
    }
}

impl<T: Config> SessionSlot<T> {
    /// A slot without a session.
    #[must_use]
    pub fn empty() -> Self {
        Self { backend: None }
    }

    /// A slot holding `backend`.
    #[must_use]
    pub fn with_backend(backend: Box<dyn Session<T>>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Puts `backend` into the slot and returns the session it replaces.
    pub fn replace(&mut self, backend: Box<dyn Session<T>>) -> Option<Box<dyn Session<T>>> {
        self.backend.replace(backend)
    }

    /// Drops the held session, closing its connections without notice.
    pub fn close(&mut self) {
        self.backend = None;
    }

    /// `true` while a session is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&dyn Session<T>, NetplayError> {
        self.backend.as_deref().ok_or(NetplayError::InvalidSession)
    }

    fn backend_mut(&mut self) -> Result<&mut (dyn Session<T> + 'static), NetplayError> {
        self.backend.as_deref_mut().ok_or(NetplayError::InvalidSession)
    }

    /// See [`Session::poll_remote_clients`].
    pub fn poll_remote_clients(&mut self) -> Result<(), NetplayError> {
        self.backend_mut()?.poll_remote_clients();
        Ok(())
    }

    /// See [`Session::add_local_input`].
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), NetplayError> {
        self.backend_mut()?.add_local_input(player_handle, input)
    }

    /// See [`Session::synchronize_input`].
    pub fn synchronize_input(&mut self) -> Result<Vec<(T::Input, InputStatus)>, NetplayError> {
        self.backend_mut()?.synchronize_input()
    }

    /// See [`Session::advance_frame`].
    pub fn advance_frame(&mut self) -> Result<(), NetplayError> {
        self.backend_mut()?.advance_frame()
    }

    /// See [`Session::disconnect_player`].
    pub fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), NetplayError> {
        self.backend_mut()?.disconnect_player(player_handle)
    }

    /// See [`Session::network_stats`].
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        self.backend()?.network_stats(player_handle)
    }

    /// See [`Session::set_frame_delay`].
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        frame_delay: usize,
    ) -> Result<(), NetplayError> {
        self.backend_mut()?.set_frame_delay(player_handle, frame_delay)
    }

    /// See [`Session::set_disconnect_timeout`].
    pub fn set_disconnect_timeout(&mut self, timeout: Duration) -> Result<(), NetplayError> {
        self.backend_mut()?.set_disconnect_timeout(timeout);
        Ok(())
    }

    /// See [`Session::set_disconnect_notify_start`].
    pub fn set_disconnect_notify_start(
        &mut self,
        notify_start: Duration,
    ) -> Result<(), NetplayError> {
        self.backend_mut()?.set_disconnect_notify_start(notify_start);
        Ok(())
    }

    /// Drains the held session's events. An empty slot has none.
    pub fn events(&mut self) -> EventDrain<'_> {
        match self.backend.as_deref_mut() {
            Some(backend) => backend.events(),
            None => EventDrain::empty(),
        }
    }

    /// See [`Session::current_state`].
    pub fn current_state(&self) -> Result<SessionState, NetplayError> {
        Ok(self.backend()?.current_state())
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
    use std::cell::Cell;
    use std::rc::Rc;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = u8;
    }

    /// Counts polls so forwarding can be observed.
    struct CountingSession {
        polls: Rc<Cell<usize>>,
    }

    impl Session<TestConfig> for CountingSession {
        fn poll_remote_clients(&mut self) {
            self.polls.set(self.polls.get() + 1);
        }

        fn synchronize_input(&mut self) -> Result<Vec<(u8, InputStatus)>, NetplayError> {
            Ok(vec![(7, InputStatus::Confirmed)])
        }

        fn advance_frame(&mut self) -> Result<(), NetplayError> {
            Ok(())
        }

        fn network_stats(&self, _handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
            Err(NetplayError::NotSynchronized)
        }

        fn set_disconnect_timeout(&mut self, _timeout: Duration) {}

        fn set_disconnect_notify_start(&mut self, _notify_start: Duration) {}

        fn current_state(&self) -> SessionState {
            SessionState::Running
        }
    }

    #[test]
    fn empty_slot_reports_invalid_session() {
        let mut slot = SessionSlot::<TestConfig>::empty();
        let handle = PlayerHandle::new(1);
        assert_eq!(slot.poll_remote_clients(), Err(NetplayError::InvalidSession));
        assert_eq!(
            slot.add_local_input(handle, 1),
            Err(NetplayError::InvalidSession)
        );
        assert_eq!(
            slot.synchronize_input().err(),
            Some(NetplayError::InvalidSession)
        );
        assert_eq!(slot.advance_frame(), Err(NetplayError::InvalidSession));
        assert_eq!(
            slot.disconnect_player(handle),
            Err(NetplayError::InvalidSession)
        );
        assert_eq!(
            slot.network_stats(handle).err(),
            Some(NetplayError::InvalidSession)
        );
        assert_eq!(
            slot.set_frame_delay(handle, 1),
            Err(NetplayError::InvalidSession)
        );
        assert_eq!(slot.current_state(), Err(NetplayError::InvalidSession));
        assert_eq!(slot.events().len(), 0);
    }

    #[test]
    fn forwards_until_closed() {
        let polls = Rc::new(Cell::new(0));
        let mut slot = SessionSlot::with_backend(Box::new(CountingSession {
            polls: Rc::clone(&polls),
        }));
        assert!(slot.is_open());
        slot.poll_remote_clients().unwrap();
        assert_eq!(polls.get(), 1);
        assert_eq!(
            slot.synchronize_input().unwrap(),
            vec![(7, InputStatus::Confirmed)]
        );
        // defaults of the trait come through unchanged
        assert_eq!(
            slot.add_local_input(PlayerHandle::new(1), 1),
            Err(NetplayError::Unsupported {
                operation: "add_local_input"
            })
        );

        slot.close();
        assert!(!slot.is_open());
        assert_eq!(slot.poll_remote_clients(), Err(NetplayError::InvalidSession));
        assert_eq!(polls.get(), 1);
    }
}
