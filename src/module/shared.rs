use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

use crate::config::TransportConfig;
use crate::device::Device;
use crate::dispatch::FragmentHandler;
use crate::peer::PeerConnection;
use crate::pool::{Fragment, FragmentPool};
use crate::shared_types::PeerId;

// -----------------------------------------------------------------------------
// ----- ModuleShared ----------------------------------------------------------

/// State a module shares with its peers. Peers hold it weakly.
pub(crate) struct ModuleShared {
    pub(crate) device: Arc<dyn Device>,
    pub(crate) pool: FragmentPool,
    pub(crate) handler: Arc<dyn FragmentHandler>,
    pub(crate) config: TransportConfig,
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    closed: AtomicBool,
}

impl fmt::Debug for ModuleShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleShared")
            .field("device", self.device.id())
            .field("pool", &self.pool.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// ----- ModuleShared: Static --------------------------------------------------

impl ModuleShared {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        config: &TransportConfig,
        handler: Arc<dyn FragmentHandler>,
    ) -> Self {
        Self {
            device,
            pool: FragmentPool::from_config(config),
            handler,
            config: config.clone(),
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ModuleShared: Crate ---------------------------------------------------

impl ModuleShared {
    pub(crate) fn peer(&self, id: PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(&id).cloned()
    }

    pub(crate) fn peer_or_insert(self: &Arc<Self>, id: PeerId) -> Arc<PeerConnection> {
        if let Some(peer) = self.peer(id) {
            return peer;
        }

        self.peers
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(PeerConnection::new(id, self)))
            .clone()
    }

    /// Snapshot, so callers can upcall without holding the map lock.
    pub(crate) fn peers(&self) -> Vec<Arc<PeerConnection>> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|peer| peer.id());
        peers
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Return a buffer to the pool; a failure here is a bookkeeping bug.
    pub(crate) fn release(&self, frag: Fragment) {
        if let Err(err) = self.pool.release(frag) {
            error!("{}: {err}", self.device.id());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if the module was already closed. Taken under the peer
    /// map lock, so every peer is either in the next snapshot or created
    /// already shut down.
    pub(crate) fn mark_closed(&self) -> bool {
        let _peers = self.peers.write();
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
