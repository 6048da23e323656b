use thiserror::Error;

use crate::shared_types::{DeviceId, PeerId};

// -----------------------------------------------------------------------------
// ----- TransportError --------------------------------------------------------

/// Failure kinds surfaced by the transport core.
///
/// Scoped to the smallest affected unit: a peer failure carries the peer, a
/// pool failure the pool bounds. Cloneable so the same value can be returned
/// to a caller or handed to a `FragmentHandler`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("fragment pool exhausted ({total}/{max} buffers issued)")]
    ResourceExhausted { total: usize, max: usize },

    #[error("no network devices available")]
    DeviceUnavailable,

    #[error("connection to {peer} failed: {reason}")]
    ConnectionFailed {
        peer: PeerId,
        reason: String,
        #[source]
        source: Option<DeviceError>,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection to {peer} is closed")]
    ConnectionClosed { peer: PeerId },

    #[error("invalid release of fragment {slot} into pool {pool}")]
    InvalidRelease { pool: u32, slot: u32 },

    #[error("payload of {len} bytes exceeds fragment capacity of {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
}

impl TransportError {
    pub fn connection_failed(peer: PeerId, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            peer,
            reason: reason.into(),
            source: None,
        }
    }

    /// A device call made on behalf of `peer` failed during `op`.
    pub fn device_failed(peer: PeerId, op: &str, err: DeviceError) -> Self {
        Self::ConnectionFailed {
            peer,
            reason: format!("{op}: {err}"),
            source: Some(err),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- DeviceError -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("failed to open device {device}: {reason}")]
    Open { device: DeviceId, reason: String },

    #[error("{0} is unreachable")]
    Unreachable(PeerId),

    #[error("no connection to {0}")]
    NotConnected(PeerId),

    #[error("device {0} is closed")]
    Closed(DeviceId),
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
