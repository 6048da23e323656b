use crate::errors::TransportError;
use crate::peer::PeerState;
use crate::shared_types::PeerId;

// -----------------------------------------------------------------------------
// ----- FragmentHandler -------------------------------------------------------

/// Upcalls into the layer above the transport.
///
/// Called from `progress()` and, on failure paths, from `send()`. No peer
/// lock is held during an upcall, so implementations may call back into the
/// module (for example to send a reply).
pub trait FragmentHandler: Send + Sync {
    /// An inbound fragment arrived. The buffer is reposted after this returns.
    fn on_receive(&self, peer: PeerId, payload: &[u8]);

    /// A send completed; `tag` is the value set on the fragment.
    fn on_send_complete(&self, peer: PeerId, tag: u64);

    /// A queued or in-flight send will never complete. Called exactly once
    /// per fragment accepted by `send()`.
    fn on_send_failed(&self, peer: PeerId, tag: u64, error: TransportError);

    fn on_peer_state(&self, _peer: PeerId, _state: PeerState) {}
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
