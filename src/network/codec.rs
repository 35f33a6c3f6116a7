//! Every byte that crosses the wire goes through this module.
//!
//! Messages and the per-frame input payloads nested inside them share one bincode
//! configuration: standard layout with fixed-width integers, so identical values
//! always encode to identical bytes on every platform.
//!
//! ```
//! use rollback_netplay::network::codec::{decode, encode};
//!
//! let bytes = encode(&7u16).expect("u16 always encodes");
//! let (value, read): (u16, usize) = decode(&bytes).expect("valid bytes");
//! assert_eq!(value, 7);
//! assert_eq!(read, 2);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Failure to turn a value into bytes or back.
///
/// bincode reports its failures as opaque messages, which are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The value could not be serialized.
    Encode {
        /// bincode's description of the failure.
        message: String,
    },
    /// The bytes do not describe a value of the requested type.
    Decode {
        /// bincode's description of the failure.
        message: String,
    },
    /// The destination buffer cannot hold the encoded value.
    BufferTooSmall {
        /// Size of the buffer that was provided.
        provided: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { message } => write!(f, "encoding failed: {message}"),
            Self::Decode { message } => write!(f, "decoding failed: {message}"),
            Self::BufferTooSmall { provided } => {
                write!(f, "buffer of {provided} bytes is too small")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes `value` into a fresh vector.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Encodes `value` into `buffer` and returns the number of bytes written.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            provided: buffer.len(),
        },
        other => CodecError::Encode {
            message: other.to_string(),
        },
    })
}

/// Decodes a value from the front of `bytes`, returning it together with the
/// number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config()).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

/// Like [`decode`], discarding the consumed length.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
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
    use crate::network::messages::{Message, MessageBody, MessageHeader, SyncRequest};

    #[test]
    fn fixed_width_integers() {
        assert_eq!(encode(&1u32).unwrap().len(), 4);
        assert_eq!(encode(&u32::MAX).unwrap().len(), 4);
        assert_eq!(encode(&-1i16).unwrap().len(), 2);
    }

    #[test]
    fn decode_reports_consumed_length() {
        let mut bytes = encode(&0xBEEFu16).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        let (value, read): (u16, _) = decode(&bytes).unwrap();
        assert_eq!(value, 0xBEEF);
        assert_eq!(read, 2);
    }

    #[test]
    fn message_survives_encoding() {
        let original = Message {
            header: MessageHeader {
                magic: 0xABCD,
                sequence: 17,
            },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 999,
                remaining_roundtrips: 3,
            }),
        };
        let bytes = encode(&original).unwrap();
        let decoded: Message = decode_value(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn encode_into_small_buffer_fails() {
        let mut buffer = [0u8; 1];
        let result = encode_into(&0x1234_5678_9ABC_DEF0u64, &mut buffer);
        assert_eq!(result, Err(CodecError::BufferTooSmall { provided: 1 }));
    }

    #[test]
    fn encode_into_matches_encode() {
        let mut buffer = [0u8; 64];
        let len = encode_into(&(3u8, 9u32), &mut buffer).unwrap();
        assert_eq!(&buffer[..len], encode(&(3u8, 9u32)).unwrap().as_slice());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let result: CodecResult<u64> = decode_value(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    #[test]
    fn error_display() {
        let err = CodecError::Decode {
            message: "unexpected end".to_string(),
        };
        assert_eq!(err.to_string(), "decoding failed: unexpected end");
        let err = CodecError::BufferTooSmall { provided: 10 };
        assert!(err.to_string().contains("10 bytes"));
    }
}
