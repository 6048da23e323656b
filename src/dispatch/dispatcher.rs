use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace, warn};

use crate::device::{Completion, classify};
use crate::errors::TransportError;
use crate::module::shared::ModuleShared;

// -----------------------------------------------------------------------------
// ----- PollSummary -----------------------------------------------------------

/// What one `poll_once` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub sends: usize,
    pub receives: usize,
    pub rdma_writes: usize,
    /// Receive buffers handed back to the device in this call.
    pub reposted: usize,
    pub errors: Vec<TransportError>,
    /// Completions that were consumed but not acted on.
    pub unsupported: Vec<TransportError>,
}

impl PollSummary {
    /// Send, receive and RDMA-write completions; error completions are
    /// reported in `errors` instead.
    pub fn processed(&self) -> usize {
        self.sends + self.receives + self.rdma_writes
    }

    /// Nothing was waiting on the completion queue.
    pub fn is_empty(&self) -> bool {
        self.processed() == 0 && self.errors.is_empty()
    }
}

// -----------------------------------------------------------------------------
// ----- CompletionDispatcher --------------------------------------------------

/// Drains a device's completion queue and routes each entry to its peer.
#[derive(Debug, Default)]
pub struct CompletionDispatcher {
    errors: AtomicU64,
    unsupported: AtomicU64,
}

// -----------------------------------------------------------------------------
// ----- CompletionDispatcher: Public ------------------------------------------

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn unsupported_count(&self) -> u64 {
        self.unsupported.load(Ordering::Relaxed)
    }
}

// -----------------------------------------------------------------------------
// ----- CompletionDispatcher: Crate -------------------------------------------

impl CompletionDispatcher {
    /// Non-blocking: takes at most `poll_batch` completions and returns as soon
    /// as the queue is empty.
    pub(crate) fn poll_once(&self, module: &ModuleShared) -> PollSummary {
        let mut summary = PollSummary::default();

        for _ in 0..module.config.poll_batch {
            match classify(module.device.poll_completion()) {
                Completion::Empty => break,

                Completion::Send { peer, wr_id } => {
                    let Some(conn) = module.peer(peer) else {
                        self.record_error(
                            &mut summary,
                            TransportError::ProtocolViolation(format!(
                                "send completion for unknown {peer}"
                            )),
                        );
                        continue;
                    };

                    match conn.complete_send(module, wr_id) {
                        Ok(()) => summary.sends += 1,
                        Err(err) => self.record_error(&mut summary, err),
                    }
                }

                Completion::Receive { peer, fragment } => {
                    let Some(conn) = module.peer(peer) else {
                        module.release(fragment);
                        self.record_error(
                            &mut summary,
                            TransportError::ProtocolViolation(format!(
                                "receive completion for unknown {peer}"
                            )),
                        );
                        continue;
                    };

                    summary.reposted += conn.complete_receive(module, fragment);
                    summary.receives += 1;
                }

                Completion::RdmaWrite { peer, wr_id } => {
                    warn!(
                        "{}: rdma write completion {wr_id:#x} from {peer}: not implemented",
                        module.device.id()
                    );
                    self.unsupported.fetch_add(1, Ordering::Relaxed);
                    summary.rdma_writes += 1;
                    summary
                        .unsupported
                        .push(TransportError::UnsupportedOperation("rdma write"));
                }

                Completion::Error {
                    peer,
                    wr_id,
                    error,
                    buffer,
                } => {
                    error!(
                        "{}: error completion {wr_id:#x} from {peer}: {error}",
                        module.device.id()
                    );

                    let conn = module.peer(peer);

                    if let Some(frag) = buffer {
                        match &conn {
                            Some(conn) => conn.reclaim_receive(module, frag),
                            None => module.release(frag),
                        }
                    }

                    if let (Some(conn), TransportError::ConnectionFailed { .. }) = (&conn, &error) {
                        conn.fail(module, error.clone());
                    }

                    self.record_error(&mut summary, error);
                }
            }
        }

        if !summary.is_empty() {
            trace!("{}: polled {summary:?}", module.device.id());
        }

        summary
    }
}

// -----------------------------------------------------------------------------
// ----- CompletionDispatcher: Private -----------------------------------------

impl CompletionDispatcher {
    fn record_error(&self, summary: &mut PollSummary, error: TransportError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        summary.errors.push(error);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
