use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::device::ConnectionEventKind;
use crate::errors::TransportError;
use crate::module::shared::ModuleShared;
use crate::pool::Fragment;
use crate::shared_types::{FragmentId, PeerId};

use super::state::{PeerInput, PeerState};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const REPOST_BATCH_HINT: usize = 4;

// -----------------------------------------------------------------------------
// ----- PeerConnection --------------------------------------------------------

/// Connection to one remote process through one module.
///
/// Two lock domains. The send side guards the state, the pending queue and
/// the in-flight send; state changes happen under it, so a fragment queued by
/// a concurrent `send()` is either flushed or failed with the rest. The
/// receive side guards the repost queue and the in-flight receive. Lock order
/// is receive then send; the send lock is never held while taking the
/// receive lock.
#[derive(Debug)]
pub struct PeerConnection {
    id: PeerId,
    module: Weak<ModuleShared>,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub state: PeerState,
    pub retries: u32,
    pub pending: usize,
    pub send_in_flight: bool,
    pub receive_in_flight: bool,
    pub posted_receives: usize,
    pub parked_receives: usize,
}

#[derive(Debug, Default)]
struct SendSide {
    state: PeerState,
    retries: u32,
    deadline: Option<Instant>,
    pending: VecDeque<Fragment>,
    in_flight: Option<Fragment>,
}

#[derive(Debug, Default)]
struct RecvSide {
    in_flight: Option<FragmentId>,
    repost: VecDeque<Fragment>,
    posted: usize,
}

/// Fragments that must be failed once the send lock is released.
#[must_use]
struct Doomed {
    state: PeerState,
    frags: Vec<Fragment>,
    error: TransportError,
}

/// Work owed after a state change, performed outside the send lock.
#[must_use]
enum Followup {
    Nothing,
    Connected,
    Terminal(Doomed),
}

// -----------------------------------------------------------------------------
// ----- PeerConnection: Static ------------------------------------------------

impl PeerConnection {
    /// Called under the module's peer-map lock. A peer created after the
    /// module closed starts in `SHUTDOWN`, since teardown will not see it.
    pub(crate) fn new(id: PeerId, module: &Arc<ModuleShared>) -> Self {
        let state = if module.is_closed() {
            PeerState::Shutdown
        } else {
            PeerState::Closed
        };

        Self {
            id,
            module: Arc::downgrade(module),
            send: Mutex::new(SendSide {
                state,
                ..SendSide::default()
            }),
            recv: Mutex::new(RecvSide::default()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PeerConnection: Public ------------------------------------------------

impl PeerConnection {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> PeerState {
        self.send.lock().state
    }

    pub fn stats(&self) -> PeerStats {
        let (receive_in_flight, posted_receives, parked_receives) = {
            let recv = self.recv.lock();
            (recv.in_flight.is_some(), recv.posted, recv.repost.len())
        };
        let send = self.send.lock();

        PeerStats {
            state: send.state,
            retries: send.retries,
            pending: send.pending.len(),
            send_in_flight: send.in_flight.is_some(),
            receive_in_flight,
            posted_receives,
            parked_receives,
        }
    }

    /// Start an active open. A no-op unless the peer is `CLOSED`.
    pub fn connect(&self) -> Result<(), TransportError> {
        let module = self.module()?;
        let followup = {
            let mut side = self.send.lock();
            self.start_connect(&module, &mut side, Instant::now())
        };
        self.follow_up(&module, followup);
        Ok(())
    }

    /// Queue `frag` for delivery, connecting first if needed.
    ///
    /// `Ok` means the fragment was accepted and exactly one of
    /// `on_send_complete` / `on_send_failed` will follow. `Err` means it was
    /// not accepted; its buffer is back in the pool and no upcall follows.
    pub fn send(&self, frag: Fragment) -> Result<(), TransportError> {
        let module = self.module()?;
        let mut side = self.send.lock();

        // Checked under the send lock: teardown takes it after marking the
        // module closed, so anything queued here is still failed by it.
        if module.is_closed() {
            drop(side);
            module.release(frag);
            return Err(TransportError::ConnectionClosed { peer: self.id });
        }

        let state = side.state;

        let followup = match state {
            PeerState::Failed => {
                drop(side);
                module.release(frag);
                return Err(TransportError::connection_failed(self.id, "connection has failed"));
            }
            PeerState::Shutdown => {
                drop(side);
                module.release(frag);
                return Err(TransportError::ConnectionClosed { peer: self.id });
            }
            PeerState::Connected if side.in_flight.is_none() && side.pending.is_empty() => {
                match module
                    .device
                    .post_send(self.id, frag.id().to_wr_id(), frag.payload())
                {
                    Ok(()) => {
                        side.in_flight = Some(frag);
                        return Ok(());
                    }
                    Err(err) => {
                        let error = TransportError::device_failed(self.id, "post_send", err);
                        let followup =
                            self.terminate(&mut side, PeerInput::TransportError, error.clone());
                        drop(side);
                        module.release(frag);
                        self.follow_up(&module, followup);
                        return Err(error);
                    }
                }
            }
            PeerState::Closed => {
                side.pending.push_back(frag);
                self.start_connect(&module, &mut side, Instant::now())
            }
            PeerState::Connecting | PeerState::ConnectAck | PeerState::Connected => {
                side.pending.push_back(frag);
                Followup::Nothing
            }
        };

        drop(side);
        self.follow_up(&module, followup);
        Ok(())
    }

    /// Local close of an established connection.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        let module = self.module()?;
        let followup = {
            let mut side = self.send.lock();
            let error = TransportError::ConnectionClosed { peer: self.id };
            self.terminate(&mut side, PeerInput::Close, error)
        };
        self.follow_up(&module, followup);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- PeerConnection: Crate -------------------------------------------------

impl PeerConnection {
    pub(crate) fn on_connection_event(&self, module: &ModuleShared, kind: ConnectionEventKind) {
        let followup = {
            let mut side = self.send.lock();

            match kind {
                ConnectionEventKind::Acked => {
                    side.deadline = None;
                    self.apply(&mut side, PeerInput::TransportAck);
                    Followup::Nothing
                }
                ConnectionEventKind::Incoming => {
                    side.deadline = None;
                    self.apply(&mut side, PeerInput::Accept);
                    Followup::Nothing
                }
                ConnectionEventKind::Handshake { claimed } if claimed == self.id => {
                    if self.apply(&mut side, PeerInput::HandshakeValid) {
                        match self.advance(module, &mut side) {
                            Some(doomed) => Followup::Terminal(doomed),
                            None => Followup::Connected,
                        }
                    } else {
                        Followup::Nothing
                    }
                }
                ConnectionEventKind::Handshake { claimed } => {
                    let error = TransportError::connection_failed(
                        self.id,
                        format!("handshake identified the remote as {claimed}"),
                    );
                    self.terminate(&mut side, PeerInput::HandshakeInvalid, error)
                }
                ConnectionEventKind::Closed if side.state == PeerState::Connected => {
                    let error = TransportError::ConnectionClosed { peer: self.id };
                    self.terminate(&mut side, PeerInput::Close, error)
                }
                ConnectionEventKind::Closed => {
                    let error =
                        TransportError::connection_failed(self.id, "closed during connection setup");
                    self.terminate(&mut side, PeerInput::TransportError, error)
                }
                ConnectionEventKind::Error { reason } => {
                    let error = TransportError::connection_failed(self.id, reason);
                    self.terminate(&mut side, PeerInput::TransportError, error)
                }
            }
        };

        self.follow_up(module, followup);
    }

    /// Retry or give up on a connect whose timeout has passed.
    pub(crate) fn check_retry(&self, module: &ModuleShared, now: Instant) {
        let followup = {
            let mut side = self.send.lock();

            let expired = side.state == PeerState::Connecting
                && side.deadline.is_some_and(|deadline| deadline <= now);
            if !expired {
                return;
            }

            let max = module.config.connect_retries;
            if side.retries >= max {
                let error = TransportError::connection_failed(
                    self.id,
                    format!("no answer after {max} connect retries"),
                );
                self.terminate(&mut side, PeerInput::RetryTimeout { exhausted: true }, error)
            } else {
                self.apply(&mut side, PeerInput::RetryTimeout { exhausted: false });
                side.retries += 1;
                side.deadline = Some(now + module.config.connect_timeout);
                info!(
                    "{}: retrying connect to {} ({}/{max})",
                    module.device.id(),
                    self.id,
                    side.retries
                );

                match module.device.connect(self.id) {
                    Ok(()) => Followup::Nothing,
                    Err(err) => {
                        let error = TransportError::device_failed(self.id, "connect", err);
                        self.terminate(&mut side, PeerInput::TransportError, error)
                    }
                }
            }
        };

        self.follow_up(module, followup);
    }

    /// Send completion: retire the in-flight fragment and submit the next.
    /// Completions arriving after the peer terminated are dropped.
    pub(crate) fn complete_send(
        &self,
        module: &ModuleShared,
        wr_id: u64,
    ) -> Result<(), TransportError> {
        let (done, failure) = {
            let mut side = self.send.lock();

            let matches = side
                .in_flight
                .as_ref()
                .is_some_and(|frag| frag.id().to_wr_id() == wr_id);
            let done = match side.in_flight.take() {
                Some(frag) if matches => frag,
                other => {
                    side.in_flight = other;
                    if side.state.is_terminal() {
                        // Already failed with the rest of the send side.
                        debug!("{}: stale send completion {wr_id:#x}", self.id);
                        return Ok(());
                    }
                    return Err(TransportError::ProtocolViolation(format!(
                        "send completion {wr_id:#x} does not match the in-flight fragment of {}",
                        self.id
                    )));
                }
            };

            (done, self.advance(module, &mut side))
        };

        let tag = done.tag();
        module.release(done);
        module.handler.on_send_complete(self.id, tag);

        if let Some(doomed) = failure {
            self.follow_up(module, Followup::Terminal(doomed));
        }

        Ok(())
    }

    /// Error completion on this peer's queue pair: the connection is lost.
    pub(crate) fn fail(&self, module: &ModuleShared, error: TransportError) {
        let followup = {
            let mut side = self.send.lock();
            self.terminate(&mut side, PeerInput::TransportError, error)
        };
        self.follow_up(module, followup);
    }

    /// Module teardown: end the connection and fail what is left.
    pub(crate) fn abort(&self, module: &ModuleShared) {
        let followup = {
            let mut side = self.send.lock();
            let error = TransportError::ConnectionClosed { peer: self.id };
            self.terminate(&mut side, PeerInput::Teardown, error)
        };
        self.follow_up(module, followup);
    }

    /// Receive completion: deliver upward, then park or repost the buffer.
    /// Returns how many buffers went back to the device.
    pub(crate) fn complete_receive(&self, module: &ModuleShared, frag: Fragment) -> usize {
        {
            let mut recv = self.recv.lock();
            recv.posted = recv.posted.saturating_sub(1);
            recv.in_flight = Some(frag.id());
        }

        module.handler.on_receive(self.id, frag.payload());

        let mut recv = self.recv.lock();
        recv.in_flight = None;

        if self.state() != PeerState::Connected {
            drop(recv);
            module.release(frag);
            return 0;
        }

        if recv.repost.len() <= module.config.repost_threshold {
            recv.repost.push_back(frag);
            return 0;
        }

        let mut batch: SmallVec<[Fragment; REPOST_BATCH_HINT]> = recv.repost.drain(..).collect();
        batch.push(frag);

        let mut reposted = 0;
        for frag in batch {
            match module.device.post_receive(self.id, frag) {
                Ok(()) => {
                    recv.posted += 1;
                    reposted += 1;
                }
                Err(rejected) => {
                    warn!(
                        "{}: repost for {} failed: {}",
                        module.device.id(),
                        self.id,
                        rejected.error
                    );
                    module.release(rejected.fragment);
                }
            }
        }

        reposted
    }

    /// A receive-queue error completion still hands back its buffer.
    pub(crate) fn reclaim_receive(&self, module: &ModuleShared, frag: Fragment) {
        {
            let mut recv = self.recv.lock();
            recv.posted = recv.posted.saturating_sub(1);
        }
        module.release(frag);
    }
}

// -----------------------------------------------------------------------------
// ----- PeerConnection: Private -----------------------------------------------

impl PeerConnection {
    fn module(&self) -> Result<Arc<ModuleShared>, TransportError> {
        self.module
            .upgrade()
            .ok_or(TransportError::ConnectionClosed { peer: self.id })
    }

    /// Apply `input`; returns whether an edge was taken.
    fn apply(&self, side: &mut SendSide, input: PeerInput) -> bool {
        match side.state.next(input) {
            Some(next) => {
                if next != side.state {
                    debug!("{}: {} -> {} on {input:?}", self.id, side.state, next);
                }
                side.state = next;
                true
            }
            None => {
                debug!("{}: ignoring {input:?} in {}", self.id, side.state);
                false
            }
        }
    }

    fn start_connect(&self, module: &ModuleShared, side: &mut SendSide, now: Instant) -> Followup {
        if !self.apply(side, PeerInput::Connect) {
            return Followup::Nothing;
        }

        side.retries = 0;
        side.deadline = Some(now + module.config.connect_timeout);

        match module.device.connect(self.id) {
            Ok(()) => Followup::Nothing,
            Err(err) => {
                let error = TransportError::device_failed(self.id, "connect", err);
                self.terminate(side, PeerInput::TransportError, error)
            }
        }
    }

    /// Move to a terminal state and collect every fragment still owned by the
    /// send side, in-flight first, then in queue order.
    fn terminate(&self, side: &mut SendSide, input: PeerInput, error: TransportError) -> Followup {
        if !self.apply(side, input) || !side.state.is_terminal() {
            return Followup::Nothing;
        }

        side.deadline = None;

        let mut frags = Vec::with_capacity(side.pending.len() + 1);
        frags.extend(side.in_flight.take());
        frags.extend(side.pending.drain(..));

        Followup::Terminal(Doomed {
            state: side.state,
            frags,
            error,
        })
    }

    /// Submit the head of the pending queue if nothing is in flight.
    fn advance(&self, module: &ModuleShared, side: &mut SendSide) -> Option<Doomed> {
        if side.state != PeerState::Connected || side.in_flight.is_some() {
            return None;
        }

        let frag = side.pending.pop_front()?;
        match module
            .device
            .post_send(self.id, frag.id().to_wr_id(), frag.payload())
        {
            Ok(()) => {
                side.in_flight = Some(frag);
                None
            }
            Err(err) => {
                side.pending.push_front(frag);
                let error = TransportError::device_failed(self.id, "post_send", err);
                match self.terminate(side, PeerInput::TransportError, error) {
                    Followup::Terminal(doomed) => Some(doomed),
                    _ => None,
                }
            }
        }
    }

    fn follow_up(&self, module: &ModuleShared, followup: Followup) {
        match followup {
            Followup::Nothing => {}
            Followup::Connected => {
                module.handler.on_peer_state(self.id, PeerState::Connected);
                self.prepost_receives(module);
            }
            Followup::Terminal(doomed) => self.finish(module, doomed),
        }
    }

    fn prepost_receives(&self, module: &ModuleShared) {
        let mut recv = self.recv.lock();
        if self.state() != PeerState::Connected {
            return;
        }

        for _ in 0..module.config.recv_prepost {
            let frag = match module.pool.acquire() {
                Ok(frag) => frag,
                Err(err) => {
                    warn!("{}: cannot prepost for {}: {err}", module.device.id(), self.id);
                    break;
                }
            };

            if let Err(rejected) = module.device.post_receive(self.id, frag) {
                warn!(
                    "{}: prepost for {} failed: {}",
                    module.device.id(),
                    self.id,
                    rejected.error
                );
                module.release(rejected.fragment);
                break;
            }

            recv.posted += 1;
        }
    }

    /// Reclaim receive buffers and notify the owner of every dropped send.
    fn finish(&self, module: &ModuleShared, doomed: Doomed) {
        let Doomed {
            state,
            frags,
            error,
        } = doomed;

        if state == PeerState::Failed {
            warn!(
                "{}: {} failed with {} fragments outstanding: {error}",
                module.device.id(),
                self.id,
                frags.len()
            );
        } else {
            debug!("{}: {} shut down", module.device.id(), self.id);
        }

        let parked: Vec<Fragment> = {
            let mut recv = self.recv.lock();
            recv.posted = 0;
            recv.repost.drain(..).collect()
        };

        for frag in parked.into_iter().chain(module.device.disconnect(self.id)) {
            module.release(frag);
        }

        for frag in frags {
            let tag = frag.tag();
            module.release(frag);
            module.handler.on_send_failed(self.id, tag, error.clone());
        }

        module.handler.on_peer_state(self.id, state);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
