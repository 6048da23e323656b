//! In-process fabric: endpoints keyed by (rail, node) exchanging fragments
//! through shared queues. Behaves like a reliable connected transport with
//! receiver-not-ready buffering, and exposes hooks to inject completions and
//! connection events.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::trace;

use crate::errors::DeviceError;
use crate::pool::Fragment;
use crate::shared_types::{DeviceId, PeerId};

use super::capability::{Device, DeviceProvider, RejectedReceive};
use super::completion::{OPCODE_RECV, OPCODE_SEND, RawCompletion, STATUS_LOCAL_LENGTH};
use super::event::{ConnectionEvent, ConnectionEventKind};

type EndpointKey = (DeviceId, PeerId);

// -----------------------------------------------------------------------------
// ----- MemoryFabric ----------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryFabric {
    state: Arc<Mutex<FabricState>>,
}

#[derive(Debug, Default)]
struct FabricState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    unreachable: HashSet<PeerId>,
}

#[derive(Debug, Default)]
struct Endpoint {
    open: bool,
    connected: HashSet<PeerId>,
    completions: VecDeque<RawCompletion>,
    events: VecDeque<ConnectionEvent>,
    posted: HashMap<PeerId, VecDeque<Fragment>>,
    backlog: HashMap<PeerId, VecDeque<InTransit>>,
}

/// A payload waiting for the receiver to post a buffer.
#[derive(Debug)]
struct InTransit {
    wr_id: u64,
    payload: Bytes,
}

// -----------------------------------------------------------------------------
// ----- MemoryFabric: Public --------------------------------------------------

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices for `node`, one per rail.
    pub fn provider(&self, node: PeerId, rails: &[&str]) -> MemoryProvider {
        MemoryProvider {
            fabric: self.clone(),
            node,
            rails: rails.iter().map(|r| DeviceId::new(*r)).collect(),
            broken: HashSet::new(),
        }
    }

    /// Connects to an unreachable node are silently dropped.
    pub fn set_unreachable(&self, node: PeerId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(node);
        } else {
            state.unreachable.remove(&node);
        }
    }

    pub fn inject_completion(&self, rail: &str, node: PeerId, completion: RawCompletion) {
        let mut state = self.state.lock();
        let endpoint = state.endpoints.entry((DeviceId::new(rail), node)).or_default();
        endpoint.completions.push_back(completion);
    }

    pub fn inject_event(&self, rail: &str, node: PeerId, event: ConnectionEvent) {
        let mut state = self.state.lock();
        let endpoint = state.endpoints.entry((DeviceId::new(rail), node)).or_default();
        endpoint.events.push_back(event);
    }

    /// Receive buffers `node` has posted for traffic from `from`.
    pub fn posted_receives(&self, rail: &str, node: PeerId, from: PeerId) -> usize {
        let state = self.state.lock();
        state
            .endpoints
            .get(&(DeviceId::new(rail), node))
            .and_then(|ep| ep.posted.get(&from))
            .map_or(0, VecDeque::len)
    }

    /// Payloads from `from` waiting for `node` to post a receive.
    pub fn backlog(&self, rail: &str, node: PeerId, from: PeerId) -> usize {
        let state = self.state.lock();
        state
            .endpoints
            .get(&(DeviceId::new(rail), node))
            .and_then(|ep| ep.backlog.get(&from))
            .map_or(0, VecDeque::len)
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryProvider --------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemoryProvider {
    fabric: MemoryFabric,
    node: PeerId,
    rails: Vec<DeviceId>,
    broken: HashSet<DeviceId>,
}

impl MemoryProvider {
    /// Make `open` fail for one rail.
    pub fn fail_open(mut self, rail: &str) -> Self {
        self.broken.insert(DeviceId::new(rail));
        self
    }

    pub fn node(&self) -> PeerId {
        self.node
    }
}

impl DeviceProvider for MemoryProvider {
    fn list_devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        Ok(self.rails.clone())
    }

    fn open(&self, id: &DeviceId) -> Result<Arc<dyn Device>, DeviceError> {
        if self.broken.contains(id) || !self.rails.contains(id) {
            return Err(DeviceError::Open {
                device: id.clone(),
                reason: "device not present on this node".to_string(),
            });
        }

        let mut state = self.fabric.state.lock();
        let endpoint = state.endpoints.entry((id.clone(), self.node)).or_default();
        endpoint.open = true;

        Ok(Arc::new(MemoryDevice {
            id: id.clone(),
            node: self.node,
            fabric: self.fabric.clone(),
        }))
    }
}

// -----------------------------------------------------------------------------
// ----- MemoryDevice ----------------------------------------------------------

#[derive(Debug)]
pub struct MemoryDevice {
    id: DeviceId,
    node: PeerId,
    fabric: MemoryFabric,
}

impl MemoryDevice {
    fn key(&self, node: PeerId) -> EndpointKey {
        (self.id.clone(), node)
    }
}

impl Device for MemoryDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn connect(&self, peer: PeerId) -> Result<(), DeviceError> {
        let mut state = self.fabric.state.lock();
        let local_key = self.key(self.node);
        let remote_key = self.key(peer);

        let local_open = state.endpoints.get(&local_key).is_some_and(|ep| ep.open);
        if !local_open {
            return Err(DeviceError::Closed(self.id.clone()));
        }

        let remote_open = state.endpoints.get(&remote_key).is_some_and(|ep| ep.open);
        if state.unreachable.contains(&peer) || !remote_open {
            trace!("{}: connect to {peer} went unanswered", self.id);
            return Ok(());
        }

        let already = state
            .endpoints
            .get(&local_key)
            .is_some_and(|ep| ep.connected.contains(&peer));

        if let Some(local) = state.endpoints.get_mut(&local_key) {
            local.connected.insert(peer);
            local
                .events
                .push_back(ConnectionEvent::new(peer, ConnectionEventKind::Acked));
            local.events.push_back(ConnectionEvent::new(
                peer,
                ConnectionEventKind::Handshake { claimed: peer },
            ));
        }

        if already {
            return Ok(());
        }

        if let Some(remote) = state.endpoints.get_mut(&remote_key) {
            remote.connected.insert(self.node);
            remote
                .events
                .push_back(ConnectionEvent::new(self.node, ConnectionEventKind::Incoming));
            remote.events.push_back(ConnectionEvent::new(
                self.node,
                ConnectionEventKind::Handshake { claimed: self.node },
            ));
        }

        Ok(())
    }

    fn poll_connection(&self) -> Option<ConnectionEvent> {
        let mut state = self.fabric.state.lock();
        state.endpoints.get_mut(&self.key(self.node))?.events.pop_front()
    }

    fn poll_completion(&self) -> Option<RawCompletion> {
        let mut state = self.fabric.state.lock();
        state
            .endpoints
            .get_mut(&self.key(self.node))?
            .completions
            .pop_front()
    }

    fn post_send(&self, peer: PeerId, wr_id: u64, payload: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.fabric.state.lock();

        let connected = state
            .endpoints
            .get(&self.key(self.node))
            .is_some_and(|ep| ep.open && ep.connected.contains(&peer));
        if !connected {
            return Err(DeviceError::NotConnected(peer));
        }

        let Some(remote) = state.endpoints.get_mut(&self.key(peer)) else {
            return Err(DeviceError::Unreachable(peer));
        };

        let posted = remote
            .posted
            .get_mut(&self.node)
            .and_then(VecDeque::pop_front);

        let local_completion = match posted {
            Some(buffer) => deliver(remote, self.node, peer, wr_id, payload, buffer),
            None => {
                remote
                    .backlog
                    .entry(self.node)
                    .or_default()
                    .push_back(InTransit {
                        wr_id,
                        payload: Bytes::copy_from_slice(payload),
                    });
                return Ok(());
            }
        };

        if let Some(local) = state.endpoints.get_mut(&self.key(self.node)) {
            local.completions.push_back(local_completion);
        }

        Ok(())
    }

    fn post_receive(&self, peer: PeerId, fragment: Fragment) -> Result<(), RejectedReceive> {
        let mut state = self.fabric.state.lock();

        let Some(local) = state
            .endpoints
            .get_mut(&self.key(self.node))
            .filter(|ep| ep.open)
        else {
            return Err(RejectedReceive {
                error: DeviceError::Closed(self.id.clone()),
                fragment,
            });
        };

        let waiting = local.backlog.get_mut(&peer).and_then(VecDeque::pop_front);
        let Some(InTransit { wr_id, payload }) = waiting else {
            local.posted.entry(peer).or_default().push_back(fragment);
            return Ok(());
        };

        let sender_completion = deliver(local, peer, self.node, wr_id, &payload, fragment);
        if let Some(sender) = state.endpoints.get_mut(&self.key(peer)) {
            sender.completions.push_back(sender_completion);
        }

        Ok(())
    }

    fn disconnect(&self, peer: PeerId) -> Vec<Fragment> {
        let mut state = self.fabric.state.lock();
        disconnect_locked(&mut state, &self.id, self.node, peer)
    }

    fn close(&self) -> Vec<Fragment> {
        let mut state = self.fabric.state.lock();
        let local_key = self.key(self.node);

        let peers: Vec<PeerId> = state
            .endpoints
            .get(&local_key)
            .map(|ep| ep.connected.iter().copied().collect())
            .unwrap_or_default();

        let mut reclaimed = Vec::new();
        for peer in peers {
            reclaimed.extend(disconnect_locked(&mut state, &self.id, self.node, peer));
        }

        if let Some(local) = state.endpoints.get_mut(&local_key) {
            local.open = false;
            local.events.clear();
            for (_, queue) in local.posted.drain() {
                reclaimed.extend(queue);
            }
            for completion in local.completions.drain(..) {
                reclaimed.extend(completion.buffer);
            }
            local.backlog.clear();
        }

        reclaimed
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

/// Copy `payload` into a buffer posted at `receiver` and queue the receive
/// completion there. Returns the completion owed to the sender.
fn deliver(
    receiver: &mut Endpoint,
    sender_node: PeerId,
    receiver_node: PeerId,
    wr_id: u64,
    payload: &[u8],
    mut buffer: Fragment,
) -> RawCompletion {
    match buffer.write(payload) {
        Ok(()) => {
            receiver
                .completions
                .push_back(RawCompletion::received(sender_node, buffer));
            RawCompletion::success(receiver_node, OPCODE_SEND, wr_id)
        }
        Err(_) => {
            let id = buffer.id().to_wr_id();
            receiver.completions.push_back(
                RawCompletion::failed(sender_node, OPCODE_RECV, id, STATUS_LOCAL_LENGTH)
                    .with_buffer(buffer),
            );
            RawCompletion::failed(receiver_node, OPCODE_SEND, wr_id, STATUS_LOCAL_LENGTH)
        }
    }
}

fn disconnect_locked(
    state: &mut FabricState,
    rail: &DeviceId,
    node: PeerId,
    peer: PeerId,
) -> Vec<Fragment> {
    let mut reclaimed = Vec::new();

    if let Some(local) = state.endpoints.get_mut(&(rail.clone(), node)) {
        local.connected.remove(&peer);
        local.backlog.remove(&peer);
        if let Some(queue) = local.posted.remove(&peer) {
            reclaimed.extend(queue);
        }
    }

    if let Some(remote) = state.endpoints.get_mut(&(rail.clone(), peer)) {
        remote.backlog.remove(&node);
        if remote.connected.remove(&node) {
            remote
                .events
                .push_back(ConnectionEvent::new(node, ConnectionEventKind::Closed));
        }
    }

    reclaimed
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
