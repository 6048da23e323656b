use crate::shared_types::PeerId;

// -----------------------------------------------------------------------------
// ----- ConnectionEvent -------------------------------------------------------

/// Connection setup progress reported by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub peer: PeerId,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// Our connect was acknowledged at the transport level.
    Acked,

    /// The remote side connected to us.
    Incoming,

    /// The remote side identified itself.
    Handshake { claimed: PeerId },

    /// The remote side closed the connection.
    Closed,

    /// The transport gave up on the connection.
    Error { reason: String },
}

impl ConnectionEvent {
    pub fn new(peer: PeerId, kind: ConnectionEventKind) -> Self {
        Self { peer, kind }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
