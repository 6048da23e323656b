use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::device::{ConnectionEventKind, Device};
use crate::dispatch::{CompletionDispatcher, FragmentHandler, PollSummary};
use crate::errors::TransportError;
use crate::peer::PeerConnection;
use crate::pool::{Fragment, PoolStats};
use crate::shared_types::{DeviceId, PeerId};

use super::shared::ModuleShared;

// -----------------------------------------------------------------------------
// ----- TransportModule -------------------------------------------------------

/// One opened device with its fragment pool and the peers reachable through
/// it. Driven entirely by `progress`; it spawns nothing.
#[derive(Debug)]
pub struct TransportModule {
    shared: Arc<ModuleShared>,
    dispatcher: CompletionDispatcher,
}

/// What a module advertises to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub device: DeviceId,
    pub exclusivity: u32,
    pub first_frag_size: usize,
    pub min_frag_size: usize,
    pub max_frag_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleStats {
    pub pool: PoolStats,
    pub peers: usize,
    pub errors: u64,
    pub unsupported: u64,
}

// -----------------------------------------------------------------------------
// ----- TransportModule: Static -----------------------------------------------

impl TransportModule {
    /// `config` is copied; later changes to the caller's value are not seen.
    pub fn open(
        device: Arc<dyn Device>,
        config: &TransportConfig,
        handler: Arc<dyn FragmentHandler>,
    ) -> Self {
        let shared = Arc::new(ModuleShared::new(device, config, handler));
        debug!(
            "{}: opened with pool {} ({} byte units)",
            shared.device.id(),
            shared.pool.id(),
            shared.pool.unit_size()
        );

        Self {
            shared,
            dispatcher: CompletionDispatcher::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- TransportModule: Public -----------------------------------------------

impl TransportModule {
    pub fn device_id(&self) -> &DeviceId {
        self.shared.device.id()
    }

    pub fn info(&self) -> ModuleInfo {
        let config = &self.shared.config;
        ModuleInfo {
            device: self.device_id().clone(),
            exclusivity: config.exclusivity,
            first_frag_size: config.first_frag_size,
            min_frag_size: config.min_frag_size,
            max_frag_size: config.max_frag_size,
        }
    }

    pub fn stats(&self) -> ModuleStats {
        ModuleStats {
            pool: self.shared.pool.stats(),
            peers: self.shared.peer_count(),
            errors: self.dispatcher.error_count(),
            unsupported: self.dispatcher.unsupported_count(),
        }
    }

    /// The connection to `id`, created in `CLOSED` on first use.
    pub fn peer(&self, id: PeerId) -> Arc<PeerConnection> {
        self.shared.peer_or_insert(id)
    }

    pub fn find_peer(&self, id: PeerId) -> Option<Arc<PeerConnection>> {
        self.shared.peer(id)
    }

    /// Every known peer, ordered by id.
    pub fn peers(&self) -> Vec<Arc<PeerConnection>> {
        self.shared.peers()
    }

    pub fn alloc(&self) -> Result<Fragment, TransportError> {
        self.shared.pool.acquire()
    }

    /// Give back a fragment that was allocated but never sent.
    pub fn free(&self, frag: Fragment) -> Result<(), TransportError> {
        self.shared.pool.release(frag)
    }

    pub fn connect(&self, peer: PeerId) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::ConnectionClosed { peer });
        }
        self.peer(peer).connect()
    }

    /// See [`PeerConnection::send`] for the notification contract.
    pub fn send(&self, peer: PeerId, frag: Fragment) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            self.shared.release(frag);
            return Err(TransportError::ConnectionClosed { peer });
        }
        self.peer(peer).send(frag)
    }

    /// One non-blocking pass; returns the completions processed.
    pub fn progress(&self, now: Instant) -> usize {
        self.poll(now).processed()
    }

    /// Like `progress`, with the full breakdown of what was polled.
    pub fn poll(&self, now: Instant) -> PollSummary {
        if self.shared.is_closed() {
            return PollSummary::default();
        }

        self.drain_connection_events();

        for peer in self.shared.peers() {
            peer.check_retry(&self.shared, now);
        }

        self.dispatcher.poll_once(&self.shared)
    }

    /// Fail everything still outstanding with `ConnectionClosed`, take back
    /// every buffer the device holds, and close the pool. Idempotent.
    pub fn close(&self) -> PoolStats {
        if !self.shared.mark_closed() {
            return self.shared.pool.stats();
        }

        let peers = self.shared.peers();
        for peer in &peers {
            peer.abort(&self.shared);
        }

        for frag in self.shared.device.close() {
            self.shared.release(frag);
        }

        let stats = self.shared.pool.close();
        if stats.outstanding > 0 {
            warn!(
                "{}: closed with {} buffers still held by the caller",
                self.device_id(),
                stats.outstanding
            );
        }

        info!(
            "{}: closed, {} peers, {} buffers allocated",
            self.device_id(),
            peers.len(),
            stats.total
        );
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

// -----------------------------------------------------------------------------
// ----- TransportModule: Private ----------------------------------------------

impl TransportModule {
    fn drain_connection_events(&self) {
        for _ in 0..self.shared.config.poll_batch {
            let Some(event) = self.shared.device.poll_connection() else {
                break;
            };

            let peer = match event.kind {
                ConnectionEventKind::Incoming => Some(self.shared.peer_or_insert(event.peer)),
                _ => self.shared.peer(event.peer),
            };

            match peer {
                Some(peer) => peer.on_connection_event(&self.shared, event.kind),
                None => debug!(
                    "{}: dropping {:?} for unknown {}",
                    self.device_id(),
                    event.kind,
                    event.peer
                ),
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- TransportModule: Drop -------------------------------------------------

impl Drop for TransportModule {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            self.close();
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
