//! One frame of input in its wire form.
//!
//! Input is encoded once when it is queued for a peer and kept encoded until
//! the peer acknowledges it, so resending a run never re-serializes anything.

use crate::frame_info::{GameInput, InputVec};
use crate::network::codec::{self, CodecError};
use crate::{Config, Frame};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct InputBytes {
    pub frame: Frame,
    pub bytes: Vec<u8>,
}

impl InputBytes {
    pub fn encode<T: Config>(input: &GameInput<T::Input>) -> Result<Self, CodecError> {
        Ok(Self {
            frame: input.frame,
            bytes: codec::encode(&input.inputs)?,
        })
    }

    pub fn decode<T: Config>(frame: Frame, bytes: &[u8]) -> Result<GameInput<T::Input>, CodecError> {
        let inputs: InputVec<T::Input> = codec::decode_value(bytes)?;
        Ok(GameInput::new(frame, inputs))
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
    use smallvec::smallvec;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u16;
        type Address = u8;
    }

    #[test]
    fn keeps_frame_and_player_order() {
        let input = GameInput::new(Frame::new(12), smallvec![3u16, 900, 7]);
        let encoded = InputBytes::encode::<TestConfig>(&input).unwrap();
        assert_eq!(encoded.frame, Frame::new(12));
        let decoded = InputBytes::decode::<TestConfig>(encoded.frame, &encoded.bytes).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn length_prefix_then_fixed_width_inputs() {
        let input = GameInput::single(Frame::new(0), 0x0102u16);
        let encoded = InputBytes::encode::<TestConfig>(&input).unwrap();
        // u64 length followed by one u16
        assert_eq!(encoded.bytes.len(), 10);
    }

    #[test]
    fn truncated_bytes_fail() {
        let input = GameInput::single(Frame::new(0), 5u16);
        let encoded = InputBytes::encode::<TestConfig>(&input).unwrap();
        let result = InputBytes::decode::<TestConfig>(Frame::new(0), &encoded.bytes[..9]);
        assert!(result.is_err());
    }
}
