use std::fmt;

// -----------------------------------------------------------------------------
// ----- PeerState -------------------------------------------------------------

/// Connection state of one peer.
///
/// ```text
///  CLOSED ─connect─▶ CONNECTING ─ack─▶ CONNECT_ACK ─handshake─▶ CONNECTED ─close─▶ SHUTDOWN
///  CLOSED | CONNECTING ─accept─▶ CONNECT_ACK
///  CONNECTING ─retry─▶ CONNECTING, or FAILED once retries run out
///  CONNECTING | CONNECT_ACK | CONNECTED ─transport error─▶ FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    #[default]
    Closed,
    Connecting,
    ConnectAck,
    Connected,
    Shutdown,
    Failed,
}

/// Everything that can drive a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInput {
    Connect,
    TransportAck,
    Accept,
    HandshakeValid,
    HandshakeInvalid,
    RetryTimeout { exhausted: bool },
    Close,
    TransportError,
    /// Module teardown; ends any live connection.
    Teardown,
}

// -----------------------------------------------------------------------------
// ----- PeerState: Public -----------------------------------------------------

impl PeerState {
    /// The state reached on `input`, or `None` when no edge exists.
    pub fn next(self, input: PeerInput) -> Option<PeerState> {
        use PeerInput as I;
        use PeerState as S;

        match (self, input) {
            (S::Failed | S::Shutdown, _) => None,

            (S::Closed, I::Connect) => Some(S::Connecting),
            (S::Connecting, I::TransportAck) => Some(S::ConnectAck),
            (S::Closed | S::Connecting, I::Accept) => Some(S::ConnectAck),
            (S::ConnectAck, I::HandshakeValid) => Some(S::Connected),
            (S::ConnectAck, I::HandshakeInvalid) => Some(S::Failed),

            (S::Connecting, I::RetryTimeout { exhausted: false }) => Some(S::Connecting),
            (S::Connecting, I::RetryTimeout { exhausted: true }) => Some(S::Failed),

            (S::Connected, I::Close) => Some(S::Shutdown),
            (S::Connecting | S::ConnectAck | S::Connected, I::TransportError) => Some(S::Failed),

            (_, I::Teardown) => Some(S::Shutdown),

            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Shutdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Closed => "CLOSED",
            PeerState::Connecting => "CONNECTING",
            PeerState::ConnectAck => "CONNECT_ACK",
            PeerState::Connected => "CONNECTED",
            PeerState::Shutdown => "SHUTDOWN",
            PeerState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
