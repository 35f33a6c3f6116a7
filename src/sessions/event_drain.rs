//! Draining iterator over session events.

use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// Drains the events a session queued since the last call to `events()`.
///
/// Events come out in the order they were queued. Dropping the iterator early
/// still removes every remaining event from the session.
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         NetplayEvent::WaitRecommendation { skip_frames } => wait(skip_frames),
///         NetplayEvent::Disconnected { player } => show_disconnect(player),
///         _ => (),
///     }
/// }
/// ```
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: EventDrainInner<'a>,
}

enum EventDrainInner<'a> {
    Queue(Drain<'a, NetplayEvent>),
    Empty,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, NetplayEvent>) -> Self {
        Self {
            inner: EventDrainInner::Queue(drain),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            inner: EventDrainInner::Empty,
        }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = NetplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next(),
            EventDrainInner::Empty => None,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            EventDrainInner::Queue(drain) => drain.size_hint(),
            EventDrainInner::Empty => (0, Some(0)),
        }
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next_back(),
            EventDrainInner::Empty => None,
        }
    }
}

impl ExactSizeIterator for EventDrain<'_> {}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
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
    use crate::PlayerHandle;
    use std::collections::VecDeque;

    fn queue() -> VecDeque<NetplayEvent> {
        VecDeque::from(vec![
            NetplayEvent::Running,
            NetplayEvent::Disconnected {
                player: PlayerHandle::new(2),
            },
            NetplayEvent::WaitRecommendation { skip_frames: 3 },
        ])
    }

    #[test]
    fn yields_events_in_queue_order() {
        let mut events = queue();
        let drained: Vec<_> = EventDrain::from_drain(events.drain(..)).collect();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], NetplayEvent::Running);
        assert!(events.is_empty());
    }

    #[test]
    fn partial_drain_still_empties_queue() {
        let mut events = queue();
        {
            let mut drain = EventDrain::from_drain(events.drain(..));
            assert_eq!(drain.len(), 3);
            assert_eq!(drain.next(), Some(NetplayEvent::Running));
            assert_eq!(
                drain.next_back(),
                Some(NetplayEvent::WaitRecommendation { skip_frames: 3 })
            );
        }
        assert!(events.is_empty());
    }

    #[test]
    fn empty_drain_is_fused() {
        let mut drain = EventDrain::empty();
        assert_eq!(drain.len(), 0);
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 0 }");
    }
}
