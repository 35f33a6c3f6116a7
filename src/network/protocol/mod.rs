//! The connection protocol: one state machine per remote participant.
//!
//! A [`PeerProtocol`] performs the handshake with its peer, stamps every
//! outgoing message with the instance magic and a sequence number, resends
//! unacknowledged input as one cumulative run, measures round-trip time and
//! notices when the peer goes quiet. It never touches the socket directly:
//! outgoing messages are queued and flushed through the session's
//! [`Transport`], incoming messages are handed over by the session.
//!
//! Time is always passed in. Nothing in here reads the clock, so tests can
//! drive timeouts without sleeping.

mod event;
mod input_bytes;
mod state;

pub(crate) use event::Event;
use input_bytes::InputBytes;
pub use state::ProtocolState;

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::frame_info::GameInput;
use crate::network::messages::{
    ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::network::codec;
use crate::network::transport::{Transport, RECV_BUFFER_SIZE};
use crate::report_violation_to;
use crate::rng::Pcg32;
use crate::sessions::config::{ProtocolConfig, SyncConfig};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{Config, Frame, NetplayError, PlayerHandle};

const UDP_HEADER_SIZE: usize = 28; // IP + UDP
/// Bytes each frame adds to an input run besides its own payload.
const RUN_ENTRY_OVERHEAD: usize = 8; // u64 length prefix
/// Sequence numbers further ahead than this are treated as stale wrap-arounds.
pub(crate) const MAX_SEQ_DISTANCE: u16 = 1 << 13;
/// Unanswered handshake nonces remembered at once.
const MAX_OUTSTANDING_SYNC_REQUESTS: usize = 32;

/// Outcome of checking an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SequenceCheck {
    /// A valid continuation; becomes the new reference.
    Accept,
    /// An input message one behind the reference. Processed, reference kept.
    Reordered,
    /// Same as the reference.
    Duplicate,
    /// Behind the reference or implausibly far ahead.
    OutOfWindow,
}

/// Classifies `seq` against the last accepted sequence number.
pub(crate) fn check_sequence(last: Option<u16>, seq: u16, is_input: bool) -> SequenceCheck {
    let Some(last) = last else {
        return SequenceCheck::Accept;
    };
    match seq.wrapping_sub(last) {
        0 => SequenceCheck::Duplicate,
        d if d <= MAX_SEQ_DISTANCE => SequenceCheck::Accept,
        u16::MAX if is_input => SequenceCheck::Reordered,
        _ => SequenceCheck::OutOfWindow,
    }
}

/// Connection to one remote player, spectator or spectated host.
pub(crate) struct PeerProtocol<T>
where
    T: Config,
{
    handle: PlayerHandle,
    num_players: usize,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event<T>>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_requests: VecDeque<u32>,
    sync_start: Instant,
    sync_timeout_event_sent: bool,
    connected_event_sent: bool,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,
    shutdown_timeout: Instant,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    fps: usize,
    magic: u16,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    rng: Pcg32,

    // the other side
    peer_addr: T::Address,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // sequencing
    next_send_seq: u16,
    last_recv_seq: Option<u16>,

    // input
    pending_output: VecDeque<InputBytes>,
    last_acked_frame: Frame,
    last_recv_frame: Frame,
    held_input: Option<Input>,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    epoch: Instant,
    stats_last_update: Instant,
    stats_bytes_at_last_update: usize,
    kbps_sent: usize,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,
}

impl<T: Config> PeerProtocol<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: PlayerHandle,
        peer_addr: T::Address,
        num_players: usize,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
        fps: usize,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        time_sync_config: TimeSyncConfig,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
        now: Instant,
    ) -> Self {
        let mut rng = match protocol_config.protocol_rng_seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        let magic = rng.next_nonzero_u16();

        Self {
            handle,
            num_players,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),
            violation_observer,

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: sync_config.num_sync_packets,
            sync_random_requests: VecDeque::new(),
            sync_start: now,
            sync_timeout_event_sent: false,
            connected_event_sent: false,
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,
            shutdown_timeout: now,

            disconnect_timeout,
            disconnect_notify_start,
            fps,
            magic,
            sync_config,
            protocol_config,
            rng,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],

            next_send_seq: 0,
            last_recv_seq: None,

            pending_output: VecDeque::new(),
            last_acked_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,
            held_input: None,

            time_sync: TimeSync::with_config(time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            epoch: now,
            stats_last_update: now,
            stats_bytes_at_last_update: 0,
            kbps_sent: 0,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,
        }
    }

    /*
     *  ACCESSORS
     */

    pub(crate) fn handle(&self) -> PlayerHandle {
        self.handle
    }

    pub(crate) fn state(&self) -> ProtocolState {
        self.state
    }

    pub(crate) fn magic(&self) -> u16 {
        self.magic
    }

    pub(crate) fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    pub(crate) fn is_handling_message(&self, addr: &T::Address) -> bool {
        self.peer_addr == *addr
    }

    /// The handshake completed at some point, even if the peer is gone since.
    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// The peer's view of `queue`, as gossiped in its last input message.
    pub(crate) fn peer_connect_status(&self, queue: usize) -> ConnectionStatus {
        self.peer_connect_status
            .get(queue)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn last_recv_frame(&self) -> Frame {
        self.last_recv_frame
    }

    pub(crate) fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    pub(crate) fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.disconnect_timeout = timeout;
    }

    pub(crate) fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.disconnect_notify_start = notify_start;
    }

    /// Frames this peer should wait so the other side can catch up.
    pub(crate) fn recommend_frame_delay(&self) -> u32 {
        u32::try_from(self.time_sync.recommended_frame_delay()).unwrap_or(0)
    }

    pub(crate) fn network_stats(&self) -> Result<NetworkStats, NetplayError> {
        if !self.is_synchronized() {
            return Err(NetplayError::NotSynchronized);
        }
        Ok(NetworkStats {
            send_queue_len: self.pending_output.len() + self.send_queue.len(),
            ping: self.round_trip_time,
            kbps_sent: self.kbps_sent,
            bytes_sent: self.bytes_sent,
            packets_sent: self.packets_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Estimates how far behind the peer this side is, from the last frame the
    /// peer sent and half the round-trip time.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let fps = i32::try_from(self.fps).unwrap_or(i32::MAX);
        let remote_frame = self.last_recv_frame + ping.saturating_mul(fps) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    /*
     *  LIFECYCLE
     */

    /// Starts the handshake.
    pub(crate) fn synchronize(&mut self, now: Instant) -> Result<(), NetplayError> {
        if self.state != ProtocolState::Initializing {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "cannot synchronize a connection in state {}",
                    self.state
                ),
            });
        }
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = self.sync_config.num_sync_packets;
        self.sync_start = now;
        self.send_sync_request(now);
        Ok(())
    }

    /// Stops exchanging input. The peer is told once through a final input
    /// message; after the shutdown delay the connection goes silent.
    pub(crate) fn disconnect(&mut self, now: Instant) {
        if matches!(
            self.state,
            ProtocolState::Disconnected | ProtocolState::Shutdown
        ) {
            return;
        }
        let was_running = self.state == ProtocolState::Running;
        self.state = ProtocolState::Disconnected;
        self.shutdown_timeout = now + self.protocol_config.shutdown_delay;
        if was_running {
            self.send_disconnect_request(now);
        }
        debug!("Connection to {:?} ({}) disconnected", self.peer_addr, self.handle);
    }

    /// Runs timers and returns the events queued since the last poll.
    pub(crate) fn poll(
        &mut self,
        now: Instant,
        connect_status: &[ConnectionStatus],
    ) -> Drain<'_, Event<T>> {
        match self.state {
            ProtocolState::Synchronizing => {
                let elapsed = now.saturating_duration_since(self.sync_start);
                if let Some(timeout) = self.sync_config.sync_timeout {
                    if !self.sync_timeout_event_sent && elapsed >= timeout {
                        self.sync_timeout_event_sent = true;
                        self.event_queue.push_back(Event::SyncTimeout {
                            elapsed_ms: elapsed.as_millis(),
                        });
                    }
                }
                if now >= self.last_send_time + self.sync_config.sync_retry_interval {
                    self.send_sync_request(now);
                }
            },
            ProtocolState::Running => {
                // resend the whole unacknowledged run if input stopped flowing
                if now >= self.running_last_input_recv + self.sync_config.running_retry_interval {
                    self.send_pending_output(now, connect_status);
                    self.running_last_input_recv = now;
                }

                if now
                    >= self.running_last_quality_report
                        + self.protocol_config.quality_report_interval
                {
                    self.send_quality_report(now);
                }

                if now >= self.last_send_time + self.sync_config.keepalive_interval {
                    self.queue_message(now, MessageBody::KeepAlive);
                }

                self.check_silence(now);
            },
            ProtocolState::Disconnected => {
                if now >= self.shutdown_timeout {
                    debug!("Connection to {:?} shut down", self.peer_addr);
                    self.state = ProtocolState::Shutdown;
                }
            },
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }

        self.update_network_stats(now);
        self.event_queue.drain(..)
    }

    fn check_silence(&mut self, now: Instant) {
        let silent_for = now.saturating_duration_since(self.last_recv_time);

        if !self.disconnect_notify_sent
            && !self.disconnect_notify_start.is_zero()
            && silent_for >= self.disconnect_notify_start
        {
            let remaining = self
                .disconnect_timeout
                .saturating_sub(self.disconnect_notify_start);
            debug!(
                "No messages from {:?} for {}ms, disconnecting in {}ms",
                self.peer_addr,
                silent_for.as_millis(),
                remaining.as_millis()
            );
            self.event_queue.push_back(Event::NetworkInterrupted {
                disconnect_timeout: remaining.as_millis(),
            });
            self.disconnect_notify_sent = true;
        }

        if !self.disconnect_event_sent
            && !self.disconnect_timeout.is_zero()
            && silent_for >= self.disconnect_timeout
        {
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
            self.state = ProtocolState::Disconnected;
            self.shutdown_timeout = now + self.protocol_config.shutdown_delay;
            debug!("Connection to {:?} timed out", self.peer_addr);
        }
    }

    fn update_network_stats(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.stats_last_update);
        if elapsed < self.protocol_config.network_stats_interval || elapsed.is_zero() {
            return;
        }
        let total = self.bytes_sent;
        let delta_bits = (total - self.stats_bytes_at_last_update) as u128 * 8;
        let bits_per_sec = delta_bits * 1000 / elapsed.as_millis().max(1);
        self.kbps_sent = usize::try_from(bits_per_sec / 1024).unwrap_or(usize::MAX);
        self.stats_bytes_at_last_update = total;
        self.stats_last_update = now;
    }

    /*
     *  SENDING MESSAGES
     */

    /// Hands every queued message to the transport.
    pub(crate) fn send_all_messages(&mut self, transport: &mut Transport<T>) {
        if self.state == ProtocolState::Shutdown {
            if !self.send_queue.is_empty() {
                trace!(
                    "Connection is shut down; dropping {} messages",
                    self.send_queue.len()
                );
                self.send_queue.clear();
            }
            return;
        }

        for msg in self.send_queue.drain(..) {
            let sent = transport.send_message(&msg, &self.peer_addr);
            if sent > 0 {
                self.packets_sent += 1;
                self.bytes_sent += sent + UDP_HEADER_SIZE;
            }
        }
    }

    /// Queues `input` for the peer and sends the unacknowledged run.
    ///
    /// While the handshake is still running the input is only queued; it goes
    /// out with the first run after the connection is up.
    pub(crate) fn send_input(
        &mut self,
        now: Instant,
        input: &GameInput<T::Input>,
        connect_status: &[ConnectionStatus],
    ) {
        if !matches!(
            self.state,
            ProtocolState::Synchronizing | ProtocolState::Running
        ) {
            return;
        }
        if !input.frame.is_valid() {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "Refusing to send input for invalid frame {}",
                input.frame
            );
            return;
        }
        if let Some(last) = self.pending_output.back() {
            if input.frame != last.frame + 1 {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::FrameSync,
                    "Input for frame {} does not follow pending frame {}",
                    input.frame,
                    last.frame
                );
                return;
            }
        }

        let encoded = match InputBytes::encode::<T>(input) {
            Ok(encoded) => encoded,
            Err(e) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Critical,
                    ViolationKind::InternalError,
                    "Failed to encode input for frame {}: {}",
                    input.frame,
                    e
                );
                return;
            },
        };

        self.time_sync.advance_frame(
            input.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );
        self.pending_output.push_back(encoded);

        // a peer that never acknowledges is as good as gone
        if self.pending_output.len() > self.protocol_config.pending_output_limit
            && !self.disconnect_event_sent
        {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "{} unacknowledged input frames for {:?} exceed the limit of {}",
                self.pending_output.len(),
                self.peer_addr,
                self.protocol_config.pending_output_limit
            );
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
        }

        if self.state == ProtocolState::Running {
            self.send_pending_output(now, connect_status);
        }
    }

    /// Sends the oldest unacknowledged frames, as many as the peer can receive
    /// in one datagram. Later frames follow once these are acknowledged.
    fn send_pending_output(&mut self, now: Instant, connect_status: &[ConnectionStatus]) {
        let Some(first) = self.pending_output.front() else {
            return;
        };
        let mut body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.state == ProtocolState::Disconnected,
            start_frame: first.frame,
            ack_frame: self.last_recv_frame,
            frame_advantage: clamp_advantage(self.local_frame_advantage),
            inputs: Vec::new(),
        };
        let empty_run = Message {
            header: MessageHeader {
                magic: self.magic,
                sequence: self.next_send_seq,
            },
            body: MessageBody::Input(body.clone()),
        };
        let mut size = match codec::encode(&empty_run) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Critical,
                    ViolationKind::InternalError,
                    "Failed to size input run for {:?}: {}",
                    self.peer_addr,
                    e
                );
                return;
            },
        };
        for pending in &self.pending_output {
            let entry = RUN_ENTRY_OVERHEAD + pending.bytes.len();
            // a single oversized frame still goes out on its own
            if !body.inputs.is_empty() && size + entry > RECV_BUFFER_SIZE {
                break;
            }
            size += entry;
            body.inputs.push(pending.bytes.clone());
        }
        trace!(
            "Sending frames {}..={} to {:?}",
            body.start_frame,
            body.end_frame(),
            self.peer_addr
        );
        self.queue_message(now, MessageBody::Input(body));
    }

    fn send_disconnect_request(&mut self, now: Instant) {
        let body = Input {
            disconnect_requested: true,
            ack_frame: self.last_recv_frame,
            ..Input::default()
        };
        self.queue_message(now, MessageBody::Input(body));
    }

    fn send_input_ack(&mut self, now: Instant) {
        let body = InputAck {
            ack_frame: self.last_recv_frame,
        };
        self.queue_message(now, MessageBody::InputAck(body));
    }

    fn send_sync_request(&mut self, now: Instant) {
        let random_request = self.rng.next_u32();
        if self.sync_random_requests.len() >= MAX_OUTSTANDING_SYNC_REQUESTS {
            self.sync_random_requests.pop_front();
        }
        self.sync_random_requests.push_back(random_request);
        let body = SyncRequest {
            random_request,
            remaining_roundtrips: self.sync_remaining_roundtrips,
        };
        self.queue_message(now, MessageBody::SyncRequest(body));
    }

    fn send_quality_report(&mut self, now: Instant) {
        self.running_last_quality_report = now;
        let body = QualityReport {
            frame_advantage: clamp_advantage(self.local_frame_advantage),
            ping: self.millis_since_epoch(now),
        };
        self.queue_message(now, MessageBody::QualityReport(body));
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        let millis = now.saturating_duration_since(self.epoch).as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }

    fn queue_message(&mut self, now: Instant, body: MessageBody) {
        trace!("Queuing {} to {:?}", body.kind(), self.peer_addr);
        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_send_seq,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.last_send_time = now;
        self.send_queue.push_back(Message { header, body });
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub(crate) fn handle_message(&mut self, now: Instant, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            trace!("Connection is shut down; ignoring {}", msg.kind());
            return;
        }

        if !msg.body.is_handshake() {
            if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
                trace!(
                    "Ignoring {} with magic {} from {:?}, expected {}",
                    msg.kind(),
                    msg.header.magic,
                    self.peer_addr,
                    self.remote_magic
                );
                return;
            }
            if self.state != ProtocolState::Running {
                trace!("Ignoring {} before the connection is running", msg.kind());
                return;
            }
            let is_input = matches!(msg.body, MessageBody::Input(_));
            match check_sequence(self.last_recv_seq, msg.header.sequence, is_input) {
                SequenceCheck::Accept => self.last_recv_seq = Some(msg.header.sequence),
                SequenceCheck::Reordered => {
                    trace!(
                        "Processing reordered input with sequence {}",
                        msg.header.sequence
                    );
                },
                SequenceCheck::Duplicate => {
                    trace!("Dropping duplicate sequence {}", msg.header.sequence);
                    return;
                },
                SequenceCheck::OutOfWindow => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::NetworkProtocol,
                        "Dropping {} with sequence {} (last accepted {:?})",
                        msg.kind(),
                        msg.header.sequence,
                        self.last_recv_seq
                    );
                    return;
                },
            }
        }

        self.last_recv_time = now;

        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            debug!("Connection to {:?} resumed", self.peer_addr);
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(now, *body),
            MessageBody::SyncReply(body) => self.on_sync_reply(now, msg.header, *body),
            MessageBody::Input(body) => self.on_input(now, body),
            MessageBody::InputAck(body) => self.pop_pending_output(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(now, *body),
            MessageBody::QualityReply(body) => self.on_quality_reply(now, *body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, now: Instant, body: SyncRequest) {
        let reply = SyncReply {
            random_reply: body.random_request,
            remaining_roundtrips: body.remaining_roundtrips,
        };
        self.queue_message(now, MessageBody::SyncReply(reply));
    }

    fn on_sync_reply(&mut self, now: Instant, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        let Some(pos) = self
            .sync_random_requests
            .iter()
            .position(|&r| r == body.random_reply)
        else {
            trace!("Ignoring stale sync reply from {:?}", self.peer_addr);
            return;
        };
        self.sync_random_requests.remove(pos);

        if !self.connected_event_sent {
            self.connected_event_sent = true;
            self.event_queue.push_back(Event::Connected);
        }

        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        let total = self.sync_config.num_sync_packets;
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(Event::Synchronizing {
                total,
                count: total - self.sync_remaining_roundtrips,
            });
            self.send_sync_request(now);
        } else {
            debug!(
                "Synchronized with {:?} after {}ms",
                self.peer_addr,
                now.saturating_duration_since(self.sync_start).as_millis()
            );
            self.state = ProtocolState::Running;
            self.remote_magic = header.magic;
            self.last_recv_seq = None;
            self.sync_random_requests.clear();
            self.running_last_input_recv = now;
            self.running_last_quality_report = now;
            self.stats_last_update = now;
            self.stats_bytes_at_last_update = self.bytes_sent;
            self.event_queue.push_back(Event::Synchronized);
        }
    }

    fn on_input(&mut self, now: Instant, body: &Input) {
        self.pop_pending_output(body.ack_frame);
        self.remote_frame_advantage = i32::from(body.frame_advantage);

        if body.disconnect_requested {
            if !self.disconnect_event_sent {
                debug!("{:?} asked to disconnect", self.peer_addr);
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // statuses only ever move towards "disconnected" and "later"
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = std::cmp::max(local.last_frame, remote.last_frame);
            }
        }

        if body.inputs.is_empty() {
            return;
        }
        if !body.start_frame.is_valid() {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Input run from {:?} starts at invalid frame {}",
                self.peer_addr,
                body.start_frame
            );
            return;
        }

        if !self.last_recv_frame.is_null() && body.start_frame > self.last_recv_frame + 1 {
            // keep the newest gap run around until the gap closes
            let replace = self
                .held_input
                .as_ref()
                .map_or(true, |held| body.end_frame() > held.end_frame());
            if replace {
                trace!(
                    "Holding frames {}..={} until frame {} arrives",
                    body.start_frame,
                    body.end_frame(),
                    self.last_recv_frame + 1
                );
                self.held_input = Some(body.clone());
            }
            return;
        }

        self.running_last_input_recv = now;
        self.apply_input_run(body);

        if let Some(held) = self.held_input.take() {
            if held.start_frame <= self.last_recv_frame + 1 {
                self.apply_input_run(&held);
            } else {
                self.held_input = Some(held);
            }
        }

        self.send_input_ack(now);
    }

    fn apply_input_run(&mut self, body: &Input) {
        for (offset, bytes) in body.inputs.iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if frame <= self.last_recv_frame {
                continue;
            }
            match InputBytes::decode::<T>(frame, bytes) {
                Ok(input) => {
                    self.last_recv_frame = frame;
                    self.event_queue.push_back(Event::Input { input });
                },
                Err(e) => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Failed to decode input for frame {} from {:?}: {}",
                        frame,
                        self.peer_addr,
                        e
                    );
                    return;
                },
            }
        }
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame > ack_frame {
                break;
            }
            self.last_acked_frame = front.frame;
            self.pending_output.pop_front();
        }
    }

    fn on_quality_report(&mut self, now: Instant, body: QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        let reply = QualityReply { pong: body.ping };
        self.queue_message(now, MessageBody::QualityReply(reply));
    }

    fn on_quality_reply(&mut self, now: Instant, body: QualityReply) {
        let now_ms = self.millis_since_epoch(now);
        self.round_trip_time = u128::from(now_ms.saturating_sub(body.pong));
    }
}

fn clamp_advantage(advantage: i32) -> i16 {
    i16::try_from(advantage.clamp(i32::from(i16::MIN), i32::from(i16::MAX))).unwrap_or(0)
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::wildcard_enum_match_arm
)]
mod tests {
    use super::*;
    use crate::network::codec;
    use crate::telemetry::CollectingObserver;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize, Debug)]
    struct TestInput {
        inp: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type Address = u8;
    }

    const PEER: u8 = 2;
    const NUM_SYNC: u32 = 5;

    fn protocol_with(
        seed: u64,
        sync_config: SyncConfig,
        observer: Option<Arc<dyn ViolationObserver>>,
        now: Instant,
    ) -> PeerProtocol<TestConfig> {
        protocol_configured(sync_config, ProtocolConfig::deterministic(seed), observer, now)
    }

    fn protocol_configured(
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        observer: Option<Arc<dyn ViolationObserver>>,
        now: Instant,
    ) -> PeerProtocol<TestConfig> {
        PeerProtocol::new(
            PlayerHandle::for_player_queue(1),
            PEER,
            2,
            Duration::from_millis(5000),
            Duration::from_millis(750),
            60,
            sync_config,
            protocol_config,
            TimeSyncConfig::default(),
            observer,
            now,
        )
    }

    fn protocol(seed: u64, now: Instant) -> PeerProtocol<TestConfig> {
        protocol_with(seed, SyncConfig::default(), None, now)
    }

    fn take_sent(protocol: &mut PeerProtocol<TestConfig>) -> Vec<Message> {
        protocol.send_queue.drain(..).collect()
    }

    fn events(protocol: &mut PeerProtocol<TestConfig>, now: Instant) -> Vec<Event<TestConfig>> {
        protocol.poll(now, &[ConnectionStatus::default(); 2]).collect()
    }

    /// Exchanges handshake traffic until both sides run.
    fn handshake(a: &mut PeerProtocol<TestConfig>, b: &mut PeerProtocol<TestConfig>, now: Instant) {
        for _ in 0..(NUM_SYNC * 4) {
            for msg in take_sent(a) {
                b.handle_message(now, &msg);
            }
            for msg in take_sent(b) {
                a.handle_message(now, &msg);
            }
        }
        assert!(a.is_running() && b.is_running());
        a.event_queue.clear();
        b.event_queue.clear();
    }

    /// Runs the handshake in both directions between two instances.
    fn connected_pair(now: Instant) -> (PeerProtocol<TestConfig>, PeerProtocol<TestConfig>) {
        connected_pair_limited(ProtocolConfig::default().pending_output_limit, now)
    }

    fn connected_pair_limited(
        pending_output_limit: usize,
        now: Instant,
    ) -> (PeerProtocol<TestConfig>, PeerProtocol<TestConfig>) {
        let config = |seed| ProtocolConfig {
            pending_output_limit,
            ..ProtocolConfig::deterministic(seed)
        };
        let mut a = protocol_configured(SyncConfig::default(), config(1), None, now);
        let mut b = protocol_configured(SyncConfig::default(), config(2), None, now);
        a.synchronize(now).unwrap();
        b.synchronize(now).unwrap();
        handshake(&mut a, &mut b, now);
        (a, b)
    }

    fn input(frame: i32, value: u32) -> GameInput<TestInput> {
        GameInput::single(Frame::new(frame), TestInput { inp: value })
    }

    fn received_frames(events: &[Event<TestConfig>]) -> Vec<i32> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Input { input } => Some(input.frame.as_i32()),
                _ => None,
            })
            .collect()
    }

    // ==========================================
    // Handshake
    // ==========================================

    #[test]
    fn new_protocol_is_initializing() {
        let protocol = protocol(1, Instant::now());
        assert_eq!(protocol.state(), ProtocolState::Initializing);
        assert!(!protocol.is_synchronized());
        assert!(protocol.network_stats().is_err());
    }

    #[test]
    fn synchronize_twice_fails() {
        let now = Instant::now();
        let mut protocol = protocol(1, now);
        protocol.synchronize(now).unwrap();
        assert!(protocol.synchronize(now).is_err());
    }

    #[test]
    fn sync_request_is_always_answered() {
        let now = Instant::now();
        let mut protocol = protocol(1, now);
        let request = Message {
            header: MessageHeader {
                magic: 77,
                sequence: 9,
            },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 12345,
                remaining_roundtrips: 3,
            }),
        };
        // even before this side started its own handshake
        protocol.handle_message(now, &request);
        let sent = take_sent(&mut protocol);
        assert_eq!(sent.len(), 1);
        match &sent[0].body {
            MessageBody::SyncReply(reply) => {
                assert_eq!(reply.random_reply, 12345);
                assert_eq!(reply.remaining_roundtrips, 3);
            },
            other => panic!("expected sync reply, got {other:?}"),
        }
    }

    #[test]
    fn handshake_takes_configured_roundtrips() {
        let now = Instant::now();
        let mut a = protocol(1, now);
        let mut b = protocol(2, now);
        a.synchronize(now).unwrap();

        let mut progress = Vec::new();
        let mut roundtrips = 0;
        while !a.is_running() {
            roundtrips += 1;
            for msg in take_sent(&mut a) {
                b.handle_message(now, &msg);
            }
            for msg in take_sent(&mut b) {
                a.handle_message(now, &msg);
            }
            progress.extend(events(&mut a, now));
        }
        assert_eq!(roundtrips, NUM_SYNC);
        assert_eq!(progress.first(), Some(&Event::Connected));
        assert_eq!(progress.last(), Some(&Event::Synchronized));
        let counts: Vec<u32> = progress
            .iter()
            .filter_map(|e| match e {
                Event::Synchronizing { count, total } => {
                    assert_eq!(*total, NUM_SYNC);
                    Some(*count)
                },
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4]);
    }

    #[test]
    fn stale_sync_reply_is_ignored() {
        let now = Instant::now();
        let mut protocol = protocol(1, now);
        protocol.synchronize(now).unwrap();
        let reply = Message {
            header: MessageHeader::default(),
            body: MessageBody::SyncReply(SyncReply {
                random_reply: 0xDEAD_BEEF,
                remaining_roundtrips: 0,
            }),
        };
        protocol.handle_message(now, &reply);
        assert!(events(&mut protocol, now).is_empty());
        assert_eq!(protocol.sync_remaining_roundtrips, NUM_SYNC);
    }

    #[test]
    fn retried_request_replies_still_count() {
        let now = Instant::now();
        let mut a = protocol(1, now);
        let mut b = protocol(2, now);
        a.synchronize(now).unwrap();
        let first = take_sent(&mut a);
        // retry before the first reply arrives
        let later = now + Duration::from_millis(250);
        let _ = events(&mut a, later);
        assert_eq!(take_sent(&mut a).len(), 1);

        for msg in first {
            b.handle_message(now, &msg);
        }
        for msg in take_sent(&mut b) {
            a.handle_message(later, &msg);
        }
        assert_eq!(a.sync_remaining_roundtrips, NUM_SYNC - 1);
    }

    #[test]
    fn sync_retry_waits_for_interval() {
        let now = Instant::now();
        let mut protocol = protocol(1, now);
        protocol.synchronize(now).unwrap();
        take_sent(&mut protocol);
        let _ = events(&mut protocol, now + Duration::from_millis(100));
        assert!(take_sent(&mut protocol).is_empty());
        let _ = events(&mut protocol, now + Duration::from_millis(200));
        assert_eq!(take_sent(&mut protocol).len(), 1);
    }

    #[test]
    fn sync_timeout_fires_once() {
        let now = Instant::now();
        let config = SyncConfig {
            sync_timeout: Some(Duration::from_millis(1000)),
            ..SyncConfig::default()
        };
        let mut protocol = protocol_with(1, config, None, now);
        protocol.synchronize(now).unwrap();
        assert!(events(&mut protocol, now + Duration::from_millis(999)).is_empty());
        let fired = events(&mut protocol, now + Duration::from_millis(1000));
        assert_eq!(fired, vec![Event::SyncTimeout { elapsed_ms: 1000 }]);
        assert!(events(&mut protocol, now + Duration::from_millis(5000)).is_empty());
        // the handshake keeps retrying
        assert!(!take_sent(&mut protocol).is_empty());
    }

    #[test]
    fn same_seed_same_magic() {
        let now = Instant::now();
        assert_eq!(protocol(9, now).magic(), protocol(9, now).magic());
        assert_ne!(protocol(9, now).magic(), 0);
    }

    // ==========================================
    // Sequencing and filtering
    // ==========================================

    #[test]
    fn sequence_numbers_increase_by_one() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        a.send_input(now, &input(0, 1), &[ConnectionStatus::default(); 2]);
        a.send_input(now, &input(1, 1), &[ConnectionStatus::default(); 2]);
        let _ = events(&mut a, now + Duration::from_millis(300));
        let sent = take_sent(&mut a);
        assert!(sent.len() >= 3);
        for pair in sent.windows(2) {
            assert_eq!(pair[1].header.sequence, pair[0].header.sequence.wrapping_add(1));
        }
    }

    #[test]
    fn input_before_running_is_dropped() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        let mut fresh = protocol(3, now);
        fresh.synchronize(now).unwrap();
        a.send_input(now, &input(0, 4), &[ConnectionStatus::default(); 2]);
        for msg in take_sent(&mut a) {
            fresh.handle_message(now, &msg);
        }
        assert!(received_frames(&events(&mut fresh, now)).is_empty());
    }

    #[test]
    fn input_queued_during_handshake_goes_out_once_running() {
        let now = Instant::now();
        let mut a = protocol(1, now);
        let mut b = protocol(2, now);
        a.synchronize(now).unwrap();
        b.synchronize(now).unwrap();
        let status = [ConnectionStatus::default(); 2];
        a.send_input(now, &input(0, 10), &status);
        a.send_input(now, &input(1, 11), &status);
        assert_eq!(a.pending_output_len(), 2);
        assert!(a.send_queue.iter().all(|msg| msg.body.is_handshake()));

        handshake(&mut a, &mut b, now);
        a.send_input(now, &input(2, 12), &status);
        for msg in take_sent(&mut a) {
            b.handle_message(now, &msg);
        }
        assert_eq!(received_frames(&events(&mut b, now)), vec![0, 1, 2]);
    }

    #[test]
    fn wrong_magic_is_filtered() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        a.send_input(now, &input(0, 4), &[ConnectionStatus::default(); 2]);
        let mut msgs = take_sent(&mut a);
        msgs[0].header.magic = msgs[0].header.magic.wrapping_add(1);
        b.handle_message(now, &msgs[0]);
        assert!(received_frames(&events(&mut b, now)).is_empty());
    }

    #[test]
    fn duplicate_sequence_is_dropped() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        a.send_input(now, &input(0, 4), &[ConnectionStatus::default(); 2]);
        let msg = take_sent(&mut a).remove(0);
        b.handle_message(now, &msg);
        b.handle_message(now, &msg);
        assert_eq!(received_frames(&events(&mut b, now)), vec![0]);
        // exactly one ack for the one accepted message
        assert_eq!(take_sent(&mut b).len(), 1);
    }

    #[test]
    fn reordered_input_within_window_is_processed() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        a.send_input(now, &input(0, 1), &status);
        a.send_input(now, &input(1, 2), &status);
        let msgs = take_sent(&mut a);
        // frame 1 run (0..=1) arrives first, then the older run (0..=0)
        b.handle_message(now, &msgs[1]);
        b.handle_message(now, &msgs[0]);
        assert_eq!(received_frames(&events(&mut b, now)), vec![0, 1]);
    }

    #[test]
    fn far_behind_sequence_is_dropped_and_reported() {
        let now = Instant::now();
        let observer = Arc::new(CollectingObserver::new());
        let mut b = protocol_with(
            2,
            SyncConfig::default(),
            Some(observer.clone() as Arc<dyn ViolationObserver>),
            now,
        );
        let mut a = protocol(1, now);
        a.synchronize(now).unwrap();
        b.synchronize(now).unwrap();
        for _ in 0..(NUM_SYNC * 4) {
            for msg in take_sent(&mut a) {
                b.handle_message(now, &msg);
            }
            for msg in take_sent(&mut b) {
                a.handle_message(now, &msg);
            }
        }
        let keep_alive = |sequence| Message {
            header: MessageHeader {
                magic: a.magic(),
                sequence,
            },
            body: MessageBody::KeepAlive,
        };
        b.handle_message(now, &keep_alive(100));
        b.handle_message(now, &keep_alive(90));
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    }

    // ==========================================
    // Input exchange
    // ==========================================

    #[test]
    fn input_is_acked_and_retired() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        a.send_input(now, &input(0, 7), &status);
        a.send_input(now, &input(1, 8), &status);
        assert_eq!(a.pending_output_len(), 2);

        for msg in take_sent(&mut a) {
            b.handle_message(now, &msg);
        }
        let received = events(&mut b, now);
        assert_eq!(received_frames(&received), vec![0, 1]);
        match &received[1] {
            Event::Input { input } => assert_eq!(input.inputs[0], TestInput { inp: 8 }),
            other => panic!("expected input, got {other:?}"),
        }

        for msg in take_sent(&mut b) {
            a.handle_message(now, &msg);
        }
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.last_acked_frame, Frame::new(1));
    }

    #[test]
    fn redelivered_run_emits_nothing_new() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        a.send_input(now, &input(0, 1), &status);
        let first = take_sent(&mut a).remove(0);
        b.handle_message(now, &first);
        assert_eq!(received_frames(&events(&mut b, now)), vec![0]);

        // the resend carries frame 0 again in a new message
        let later = now + Duration::from_millis(250);
        let _ = events(&mut a, later);
        for msg in take_sent(&mut a) {
            b.handle_message(later, &msg);
        }
        assert!(received_frames(&events(&mut b, later)).is_empty());
    }

    #[test]
    fn gap_run_is_held_until_gap_closes() {
        let now = Instant::now();
        let (_, mut b) = connected_pair(now);
        let encode = |value: u32| codec::encode(&input(0, value).inputs).unwrap();
        let run = |sequence: u16, start: i32, values: &[u32]| Message {
            header: MessageHeader {
                magic: b.remote_magic,
                sequence,
            },
            body: MessageBody::Input(Input {
                start_frame: Frame::new(start),
                inputs: values.iter().map(|&v| encode(v)).collect(),
                ..Input::default()
            }),
        };
        let first = run(1, 0, &[0]);
        let gap = run(3, 2, &[2, 3]);
        let fill = run(4, 1, &[1]);

        b.handle_message(now, &first);
        b.handle_message(now, &gap);
        assert_eq!(received_frames(&events(&mut b, now)), vec![0]);
        b.handle_message(now, &fill);
        assert_eq!(received_frames(&events(&mut b, now)), vec![1, 2, 3]);
    }

    #[test]
    fn connect_status_is_merged_monotonically() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::new(4),
            },
            ConnectionStatus::default(),
        ];
        a.send_input(now, &input(0, 1), &status);
        for msg in take_sent(&mut a) {
            b.handle_message(now, &msg);
        }
        assert!(b.peer_connect_status(0).disconnected);
        assert_eq!(b.peer_connect_status(0).last_frame, Frame::new(4));
        assert_eq!(b.peer_connect_status(7), ConnectionStatus::default());
    }

    #[test]
    fn out_of_order_send_is_refused() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        a.send_input(now, &input(0, 1), &status);
        a.send_input(now, &input(5, 1), &status);
        assert_eq!(a.pending_output_len(), 1);
    }

    #[test]
    fn unacknowledged_backlog_disconnects() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        for frame in 0..=128 {
            a.send_input(now, &input(frame, 0), &status);
        }
        let fired = events(&mut a, now);
        assert_eq!(
            fired.iter().filter(|e| **e == Event::Disconnected).count(),
            1
        );
    }

    #[test]
    fn long_backlog_is_sent_in_receivable_runs() {
        let start = Instant::now();
        let (mut a, mut b) = connected_pair_limited(1024, start);
        let status = [ConnectionStatus::default(); 2];
        for frame in 0..1000 {
            a.send_input(start, &input(frame, frame as u32), &status);
        }
        assert_eq!(a.pending_output_len(), 1000);
        assert!(!events(&mut a, start).contains(&Event::Disconnected));

        // only the newest run reaches b at first; the rest is lost
        let mut outgoing = take_sent(&mut a);
        assert!(outgoing
            .iter()
            .all(|msg| codec::encode(msg).unwrap().len() <= RECV_BUFFER_SIZE));
        let mut outgoing = outgoing.split_off(outgoing.len() - 1);
        let mut received = Vec::new();
        for step in 1..=20u64 {
            let now = start + Duration::from_millis(step * 250);
            for msg in outgoing.drain(..) {
                let bytes = codec::encode(&msg).unwrap();
                assert!(
                    bytes.len() <= RECV_BUFFER_SIZE,
                    "{} byte datagram",
                    bytes.len()
                );
                let decoded: Message = codec::decode_value(&bytes).unwrap();
                b.handle_message(now, &decoded);
            }
            received.extend(received_frames(&events(&mut b, now)));
            for msg in take_sent(&mut b) {
                a.handle_message(now, &msg);
            }
            if a.pending_output_len() == 0 {
                break;
            }
            // the retry timer sends the next run
            let _ = events(&mut a, now + Duration::from_millis(200));
            outgoing = take_sent(&mut a);
        }
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
        assert_eq!(a.pending_output_len(), 0);
    }

    #[test]
    fn disconnect_request_reaches_peer() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        a.disconnect(now);
        assert_eq!(a.state(), ProtocolState::Disconnected);
        for msg in take_sent(&mut a) {
            b.handle_message(now, &msg);
        }
        assert_eq!(events(&mut b, now), vec![Event::Disconnected]);
    }

    // ==========================================
    // Liveness
    // ==========================================

    #[test]
    fn silence_disconnects_exactly_at_timeout() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        let before = events(&mut a, now + Duration::from_millis(4999));
        assert!(!before.contains(&Event::Disconnected));
        let at = events(&mut a, now + Duration::from_millis(5000));
        assert_eq!(at, vec![Event::Disconnected]);
        assert_eq!(a.state(), ProtocolState::Disconnected);
        assert!(events(&mut a, now + Duration::from_millis(9000)).is_empty());
    }

    #[test]
    fn no_input_after_disconnect() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        b.send_input(now, &input(0, 1), &status);
        for msg in take_sent(&mut b) {
            a.handle_message(now, &msg);
        }
        assert_eq!(received_frames(&events(&mut a, now)), vec![0]);

        let timeout = now + Duration::from_millis(5000);
        assert!(events(&mut a, timeout).contains(&Event::Disconnected));
        b.send_input(timeout, &input(1, 2), &status);
        for msg in take_sent(&mut b) {
            a.handle_message(timeout, &msg);
        }
        let after = events(&mut a, timeout);
        assert!(received_frames(&after).is_empty());
        assert!(!after.contains(&Event::Disconnected));
    }

    #[test]
    fn interrupt_and_resume_are_edge_triggered() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let t1 = now + Duration::from_millis(750);
        assert_eq!(
            events(&mut a, t1),
            vec![Event::NetworkInterrupted {
                disconnect_timeout: 4250
            }]
        );
        assert!(events(&mut a, t1 + Duration::from_millis(100)).is_empty());

        let t2 = t1 + Duration::from_millis(500);
        let _ = events(&mut b, t2);
        let msgs = take_sent(&mut b);
        assert!(msgs.len() >= 2);
        for msg in &msgs {
            a.handle_message(t2, msg);
        }
        let resumed: Vec<_> = events(&mut a, t2)
            .into_iter()
            .filter(|e| *e == Event::NetworkResumed)
            .collect();
        assert_eq!(resumed.len(), 1);
    }

    #[test]
    fn zero_timeouts_disable_detection() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        a.set_disconnect_timeout(Duration::ZERO);
        a.set_disconnect_notify_start(Duration::ZERO);
        let fired = events(&mut a, now + Duration::from_secs(60));
        assert!(fired.is_empty());
        assert!(a.is_running());
    }

    #[test]
    fn disconnected_connection_shuts_down_after_delay() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        a.disconnect(now);
        let _ = events(&mut a, now + Duration::from_millis(4999));
        assert_eq!(a.state(), ProtocolState::Disconnected);
        let _ = events(&mut a, now + Duration::from_millis(5000));
        assert_eq!(a.state(), ProtocolState::Shutdown);
    }

    // ==========================================
    // Quality and statistics
    // ==========================================

    #[test]
    fn round_trip_time_from_quality_exchange() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let t1 = now + Duration::from_millis(200);
        let _ = events(&mut a, t1);
        for msg in take_sent(&mut a) {
            b.handle_message(t1, &msg);
        }
        let t2 = t1 + Duration::from_millis(40);
        for msg in take_sent(&mut b) {
            a.handle_message(t2, &msg);
        }
        assert_eq!(a.network_stats().unwrap().ping, 40);
    }

    #[test]
    fn frame_advantage_uses_half_ping() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(now);
        let status = [ConnectionStatus::default(); 2];
        for frame in 0..=10 {
            b.send_input(now, &input(frame, 0), &status);
        }
        for msg in take_sent(&mut b) {
            a.handle_message(now, &msg);
        }
        a.round_trip_time = 100;
        a.update_local_frame_advantage(Frame::new(4));
        // remote frame 10 + 50ms * 60fps / 1000 = 13
        assert_eq!(a.network_stats().unwrap().local_frames_behind, 9);
    }

    #[test]
    fn kbps_refreshes_on_interval() {
        let now = Instant::now();
        let (mut a, _) = connected_pair(now);
        let mut transport = crate::network::transport::Transport::<TestConfig>::new(Box::new(
            NullSocket,
        ));
        a.bytes_sent = 0;
        a.stats_bytes_at_last_update = 0;
        a.stats_last_update = now;
        a.send_input(now, &input(0, 1), &[ConnectionStatus::default(); 2]);
        a.send_all_messages(&mut transport);
        let stats = a.network_stats().unwrap();
        assert_eq!(stats.packets_sent, 1);
        assert!(stats.bytes_sent > UDP_HEADER_SIZE);
        assert_eq!(stats.kbps_sent, 0);

        a.bytes_sent = 128 * 1000;
        let _ = events(&mut a, now + Duration::from_millis(1000));
        // 128_000 bytes in one second is 1000 kbit/s
        assert_eq!(a.network_stats().unwrap().kbps_sent, 1000);
    }

    struct NullSocket;

    impl crate::DatagramSocket<u8> for NullSocket {
        fn send_datagram(&mut self, _bytes: &[u8], _dest: &u8) -> std::io::Result<()> {
            Ok(())
        }

        fn poll_datagram(&mut self, _buf: &mut [u8]) -> std::io::Result<Option<(usize, u8)>> {
            Ok(None)
        }
    }

    // ==========================================
    // Sequence window properties
    // ==========================================

    proptest! {
        #[test]
        fn next_sequence_always_accepted(last in any::<u16>(), step in 1u16..=MAX_SEQ_DISTANCE) {
            prop_assert_eq!(
                check_sequence(Some(last), last.wrapping_add(step), false),
                SequenceCheck::Accept
            );
        }

        #[test]
        fn stale_sequences_rejected(last in any::<u16>(), back in 2u16..(u16::MAX - MAX_SEQ_DISTANCE)) {
            prop_assert_eq!(
                check_sequence(Some(last), last.wrapping_sub(back), true),
                SequenceCheck::OutOfWindow
            );
        }

        #[test]
        fn one_behind_only_for_input(last in any::<u16>()) {
            let prev = last.wrapping_sub(1);
            prop_assert_eq!(check_sequence(Some(last), prev, true), SequenceCheck::Reordered);
            prop_assert_eq!(check_sequence(Some(last), prev, false), SequenceCheck::OutOfWindow);
            prop_assert_eq!(check_sequence(Some(last), last, true), SequenceCheck::Duplicate);
        }
    }
}
