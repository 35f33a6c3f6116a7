//! Connection quality figures.

/// Connection quality towards one remote participant, as returned by
/// `network_stats()`.
///
/// All values are advisory. `kbps_sent` is refreshed once per statistics
/// interval; the other fields are current at the time of the call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Messages queued for this peer that have not been handed to the transport,
    /// plus unacknowledged input frames.
    pub send_queue_len: usize,
    /// Round-trip time in milliseconds, from the last quality report exchange.
    pub ping: u128,
    /// Send rate over the last statistics interval, in kilobits per second.
    pub kbps_sent: usize,
    /// Total bytes sent to this peer, including 28 bytes of IP and UDP headers
    /// per packet.
    pub bytes_sent: usize,
    /// Total packets sent to this peer.
    pub packets_sent: usize,

    /// How many frames this peer is estimated to be behind the remote one.
    pub local_frames_behind: i32,
    /// How many frames the remote peer reports being behind this one.
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            send_queue_len,
            ping,
            kbps_sent,
            bytes_sent,
            packets_sent,
            local_frames_behind,
            remote_frames_behind,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, queue: {}, kbps: {}, sent: {}B/{} packets, local_behind: {}, remote_behind: {} }}",
            ping,
            send_queue_len,
            kbps_sent,
            bytes_sent,
            packets_sent,
            local_frames_behind,
            remote_frames_behind
        )
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
    fn new_is_zeroed() {
        assert_eq!(NetworkStats::new(), NetworkStats::default());
        assert_eq!(NetworkStats::new().ping, 0);
    }

    #[test]
    fn display_lists_every_field() {
        let stats = NetworkStats {
            send_queue_len: 3,
            ping: 48,
            kbps_sent: 12,
            bytes_sent: 4096,
            packets_sent: 40,
            local_frames_behind: -1,
            remote_frames_behind: 2,
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 48ms"));
        assert!(text.contains("queue: 3"));
        assert!(text.contains("kbps: 12"));
        assert!(text.contains("sent: 4096B/40 packets"));
        assert!(text.contains("local_behind: -1"));
        assert!(text.contains("remote_behind: 2"));
    }
}
