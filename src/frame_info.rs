//! Inputs of a single frame.

use smallvec::SmallVec;

use crate::Frame;

/// Per-frame inputs for one or more players, kept inline for up to four players.
pub type InputVec<I> = SmallVec<[I; 4]>;

/// The inputs of one frame.
///
/// Between two players this carries a single input: the sender's. A host
/// relaying confirmed frames to a spectator sends one input per player, in
/// queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame the inputs belong to. [`Frame::NULL`] marks an empty slot.
    pub frame: Frame,
    /// The inputs, one per player.
    pub inputs: InputVec<I>,
}

impl<I: Copy + Clone + PartialEq> GameInput<I> {
    /// Creates an input block for `frame`.
    #[must_use]
    pub fn new(frame: Frame, inputs: InputVec<I>) -> Self {
        Self { frame, inputs }
    }

    /// Creates a block holding exactly one input.
    #[must_use]
    pub fn single(frame: Frame, input: I) -> Self {
        let mut inputs = InputVec::new();
        inputs.push(input);
        Self { frame, inputs }
    }

    /// An empty slot, as used to initialise ring buffers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            frame: Frame::NULL,
            inputs: InputVec::new(),
        }
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

    #[test]
    fn single_holds_one_input() {
        let input = GameInput::single(Frame::new(3), 9u8);
        assert_eq!(input.frame, Frame::new(3));
        assert_eq!(input.inputs.as_slice(), &[9]);
    }

    #[test]
    fn empty_has_null_frame() {
        let input: GameInput<u8> = GameInput::empty();
        assert!(input.frame.is_null());
        assert!(input.inputs.is_empty());
    }
}
