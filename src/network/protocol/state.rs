/// Lifecycle of one connection.
///
/// ```text
/// Initializing ──synchronize()──▶ Synchronizing ──last sync reply──▶ Running
///                                      │                               │
///                                      └────────disconnect()───────────┴──▶ Disconnected ──shutdown delay──▶ Shutdown
/// ```
///
/// The handshake's "synchronized" step is not a state of its own: the last
/// valid sync reply queues the synchronized event and moves straight to
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Created, handshake not started.
    Initializing,
    /// Exchanging handshake round trips.
    Synchronizing,
    /// Exchanging input.
    Running,
    /// Disconnected, still flushing its last messages.
    Disconnected,
    /// Silent. Every message is dropped.
    Shutdown,
}

impl ProtocolState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Synchronizing => "Synchronizing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
