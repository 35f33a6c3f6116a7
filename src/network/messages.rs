//! Messages exchanged between peers.

use serde::{Deserialize, Serialize};

use crate::Frame;

/// One row of the connect-status table: whether a player is disconnected and the
/// last frame of theirs that the reporting peer has confirmed.
///
/// Every peer keeps one row per player and gossips the whole table inside each
/// input message, which is how peers learn about players they are not talking
/// to directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// The player has been disconnected.
    pub disconnected: bool,
    /// The most recent confirmed frame of the player.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // echoed in the reply
    pub remaining_roundtrips: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32,
    pub remaining_roundtrips: u32,
}

/// A contiguous run of frames starting at `start_frame`. Each entry of `inputs`
/// is one frame's inputs, encoded with the wire codec.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    pub ack_frame: Frame,
    pub frame_advantage: i16,
    pub inputs: Vec<Vec<u8>>,
}

impl Input {
    /// The last frame carried by this run.
    pub fn end_frame(&self) -> Frame {
        self.start_frame + (self.inputs.len() as i32 - 1)
    }
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            frame_advantage: 0,
            inputs: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            peer_connect_status,
            disconnect_requested,
            start_frame,
            ack_frame,
            frame_advantage,
            inputs,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("disconnect_requested", disconnect_requested)
            .field("start_frame", start_frame)
            .field("ack_frame", ack_frame)
            .field("frame_advantage", frame_advantage)
            .field("frames", &inputs.len())
            .field(
                "bytes",
                &inputs.iter().map(|frame| frame.len()).sum::<usize>(),
            )
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    pub frame_advantage: i16,
    pub ping: u64, // sender's clock in milliseconds
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
    pub sequence: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    KeepAlive,
}

impl MessageBody {
    /// Handshake messages bypass sequencing and the magic filter.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::SyncRequest(_) | Self::SyncReply(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "sync request",
            Self::SyncReply(_) => "sync reply",
            Self::Input(_) => "input",
            Self::InputAck(_) => "input ack",
            Self::QualityReport(_) => "quality report",
            Self::QualityReply(_) => "quality reply",
            Self::KeepAlive => "keep alive",
        }
    }
}

/// A datagram exchanged between two connection protocol instances.
///
/// The fields are private to the crate; hosts only ever move messages through
/// the transport adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

impl Message {
    /// The per-instance sequence number of the message.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// A short, human readable name of the message type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.body.kind()
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
    use crate::network::codec;

    #[test]
    fn connection_status_default() {
        let status = ConnectionStatus::default();
        assert!(!status.disconnected);
        assert_eq!(status.last_frame, Frame::NULL);
    }

    #[test]
    fn input_default_is_empty() {
        let input = Input::default();
        assert!(input.peer_connect_status.is_empty());
        assert_eq!(input.start_frame, Frame::NULL);
        assert_eq!(input.ack_frame, Frame::NULL);
        assert!(input.inputs.is_empty());
    }

    #[test]
    fn input_end_frame() {
        let input = Input {
            start_frame: Frame::new(10),
            inputs: vec![vec![1], vec![2], vec![3]],
            ..Input::default()
        };
        assert_eq!(input.end_frame(), Frame::new(12));
    }

    #[test]
    fn input_debug_summarizes_payload() {
        let input = Input {
            peer_connect_status: vec![ConnectionStatus::default()],
            disconnect_requested: true,
            start_frame: Frame::new(10),
            ack_frame: Frame::new(5),
            frame_advantage: -2,
            inputs: vec![vec![0xDE, 0xAD], vec![0xBE, 0xEF]],
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("disconnect_requested: true"));
        assert!(debug.contains("frames: 2"));
        assert!(debug.contains("bytes: 4"));
    }

    #[test]
    fn only_sync_messages_are_handshake() {
        assert!(MessageBody::SyncRequest(SyncRequest::default()).is_handshake());
        assert!(MessageBody::SyncReply(SyncReply::default()).is_handshake());
        assert!(!MessageBody::KeepAlive.is_handshake());
        assert!(!MessageBody::Input(Input::default()).is_handshake());
        assert!(!MessageBody::QualityReply(QualityReply::default()).is_handshake());
    }

    #[test]
    fn message_accessors() {
        let msg = Message {
            header: MessageHeader {
                magic: 1,
                sequence: 44,
            },
            body: MessageBody::InputAck(InputAck::default()),
        };
        assert_eq!(msg.sequence(), 44);
        assert_eq!(msg.kind(), "input ack");
    }

    #[test]
    fn keep_alive_is_tiny_on_the_wire() {
        let msg = Message {
            header: MessageHeader::default(),
            body: MessageBody::KeepAlive,
        };
        // 2 bytes magic, 2 bytes sequence, 4 bytes variant tag
        assert_eq!(codec::encode(&msg).unwrap().len(), 8);
    }
}
