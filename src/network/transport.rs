//! Adapter between the host's [`DatagramSocket`] and typed [`Message`]s.
//!
//! The adapter owns the socket for the lifetime of a session. Outgoing messages
//! are encoded with the wire codec and handed to the socket immediately;
//! incoming datagrams are drained until the socket reports nothing pending,
//! decoded, and passed one by one to a dispatch callback. Datagrams that do not
//! decode are dropped and reported.

use std::sync::Arc;

use tracing::trace;

use crate::network::codec;
use crate::network::messages::Message;
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Config, DatagramSocket};

/// Datagrams larger than this are truncated by the socket and fail to decode.
pub(crate) const RECV_BUFFER_SIZE: usize = 4096;

/// Typed message transport over a host-provided datagram socket.
pub struct Transport<T>
where
    T: Config,
{
    socket: Box<dyn DatagramSocket<T::Address>>,
    recv_buffer: Vec<u8>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for Transport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("recv_buffer", &self.recv_buffer.len())
            .field("has_observer", &self.violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Config> Transport<T> {
    /// Wraps `socket`.
    pub fn new(socket: Box<dyn DatagramSocket<T::Address>>) -> Self {
        Self {
            socket,
            recv_buffer: vec![0; RECV_BUFFER_SIZE],
            violation_observer: None,
        }
    }

    /// Routes dropped-datagram reports to `observer` instead of `tracing`.
    pub fn with_violation_observer(mut self, observer: Option<Arc<dyn ViolationObserver>>) -> Self {
        self.violation_observer = observer;
        self
    }

    /// Encodes `msg` and hands it to the socket.
    ///
    /// Returns the number of bytes handed over, or 0 if the message could not be
    /// encoded or the socket refused it. Neither case is retried.
    pub fn send_message(&mut self, msg: &Message, dest: &T::Address) -> usize {
        let bytes = match codec::encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Transport,
                    "Failed to encode {} message: {}",
                    msg.kind(),
                    e
                );
                return 0;
            },
        };

        if let Err(e) = self.socket.send_datagram(&bytes, dest) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Failed to send {} bytes to {:?}: {}",
                bytes.len(),
                dest,
                e
            );
            return 0;
        }

        trace!("sent packet length {} to {:?}", bytes.len(), dest);
        bytes.len()
    }

    /// Drains every pending datagram, calling `dispatch` once per decoded message.
    ///
    /// Stops at the first `Ok(None)` or error from the socket. Returns the number
    /// of messages dispatched.
    pub fn poll_incoming<F>(&mut self, mut dispatch: F) -> usize
    where
        F: FnMut(&T::Address, Message),
    {
        let mut dispatched = 0;
        loop {
            let (len, from) = match self.socket.poll_datagram(&mut self.recv_buffer) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Transport,
                        "Datagram socket error while receiving: {}",
                        e
                    );
                    break;
                },
            };

            let Some(bytes) = self.recv_buffer.get(..len) else {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Transport,
                    "Socket reported {} bytes for a {} byte buffer",
                    len,
                    self.recv_buffer.len()
                );
                continue;
            };
            trace!("recv packet length {} from {:?}", len, from);

            match codec::decode_value::<Message>(bytes) {
                Ok(msg) => {
                    dispatch(&from, msg);
                    dispatched += 1;
                },
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::Transport,
                        "Dropping malformed datagram of {} bytes from {:?}: {}",
                        len,
                        from,
                        e
                    );
                },
            }
        }
        dispatched
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
    use crate::network::messages::{InputAck, MessageBody, MessageHeader};
    use crate::telemetry::CollectingObserver;
    use crate::Frame;
    use std::collections::VecDeque;
    use std::io;

    struct TestConfig;

    impl Config for TestConfig {
        type Input = u8;
        type Address = u32;
    }

    #[derive(Default)]
    struct ScriptedSocket {
        inbox: VecDeque<io::Result<(Vec<u8>, u32)>>,
        sent: Vec<(Vec<u8>, u32)>,
        refuse_sends: bool,
    }

    struct Shared(Arc<parking_lot::Mutex<ScriptedSocket>>);

    impl DatagramSocket<u32> for Shared {
        fn send_datagram(&mut self, bytes: &[u8], dest: &u32) -> io::Result<()> {
            let mut inner = self.0.lock();
            if inner.refuse_sends {
                return Err(io::Error::new(io::ErrorKind::Other, "refused"));
            }
            inner.sent.push((bytes.to_vec(), *dest));
            Ok(())
        }

        fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, u32)>> {
            match self.0.lock().inbox.pop_front() {
                None => Ok(None),
                Some(Err(e)) => Err(e),
                Some(Ok((bytes, from))) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(Some((bytes.len(), from)))
                },
            }
        }
    }

    fn transport() -> (Transport<TestConfig>, Arc<parking_lot::Mutex<ScriptedSocket>>) {
        let inner = Arc::new(parking_lot::Mutex::new(ScriptedSocket::default()));
        (
            Transport::new(Box::new(Shared(Arc::clone(&inner)))),
            inner,
        )
    }

    fn ack(sequence: u16, frame: i32) -> Message {
        Message {
            header: MessageHeader { magic: 9, sequence },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(frame),
            }),
        }
    }

    #[test]
    fn send_returns_encoded_length() {
        let (mut transport, inner) = transport();
        let msg = ack(1, 4);
        let sent = transport.send_message(&msg, &7);
        let encoded = codec::encode(&msg).unwrap();
        assert_eq!(sent, encoded.len());
        assert_eq!(inner.lock().sent, vec![(encoded, 7)]);
    }

    #[test]
    fn refused_send_counts_nothing() {
        let (mut transport, inner) = transport();
        inner.lock().refuse_sends = true;
        assert_eq!(transport.send_message(&ack(1, 4), &7), 0);
    }

    #[test]
    fn poll_dispatches_each_datagram_once() {
        let (mut transport, inner) = transport();
        for seq in 0..3u16 {
            let bytes = codec::encode(&ack(seq, i32::from(seq))).unwrap();
            inner.lock().inbox.push_back(Ok((bytes, 2)));
        }
        let mut seen = Vec::new();
        let count = transport.poll_incoming(|from, msg| seen.push((*from, msg.sequence())));
        assert_eq!(count, 3);
        assert_eq!(seen, vec![(2, 0), (2, 1), (2, 2)]);
        assert_eq!(transport.poll_incoming(|_, _| panic!("nothing pending")), 0);
    }

    #[test]
    fn malformed_datagrams_are_dropped_and_reported() {
        let (transport, inner) = transport();
        let observer = Arc::new(CollectingObserver::new());
        let mut transport =
            transport.with_violation_observer(Some(observer.clone() as Arc<dyn ViolationObserver>));
        inner.lock().inbox.push_back(Ok((vec![0xFF; 3], 5)));
        let good = codec::encode(&ack(8, 1)).unwrap();
        inner.lock().inbox.push_back(Ok((good, 5)));

        let mut seen = Vec::new();
        transport.poll_incoming(|_, msg| seen.push(msg.sequence()));
        assert_eq!(seen, vec![8]);
        assert!(observer.has_violation(ViolationKind::Transport));
    }

    #[test]
    fn socket_error_stops_draining() {
        let (mut transport, inner) = transport();
        inner
            .lock()
            .inbox
            .push_back(Err(io::Error::new(io::ErrorKind::Other, "boom")));
        let good = codec::encode(&ack(1, 1)).unwrap();
        inner.lock().inbox.push_back(Ok((good, 5)));

        assert_eq!(transport.poll_incoming(|_, _| {}), 0);
        // the next poll picks up where the last one stopped
        assert_eq!(transport.poll_incoming(|_, _| {}), 1);
    }
}
