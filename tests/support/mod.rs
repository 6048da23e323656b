use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fragcrab::device::MemoryFabric;
use fragcrab::{
    FragmentHandler, ModuleRegistry, PeerId, PeerState, TransportConfig, TransportError,
    TransportModule,
};

pub const RAIL: &str = "rail0";

// -----------------------------------------------------------------------------
// ----- RecordingHandler ------------------------------------------------------

/// Keeps every upcall in arrival order.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub received: Vec<(PeerId, Vec<u8>)>,
    pub completed: Vec<(PeerId, u64)>,
    pub failed: Vec<(PeerId, u64, TransportError)>,
    pub states: Vec<(PeerId, PeerState)>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().clone()
    }
}

impl FragmentHandler for RecordingHandler {
    fn on_receive(&self, peer: PeerId, payload: &[u8]) {
        self.inner.lock().received.push((peer, payload.to_vec()));
    }

    fn on_send_complete(&self, peer: PeerId, tag: u64) {
        self.inner.lock().completed.push((peer, tag));
    }

    fn on_send_failed(&self, peer: PeerId, tag: u64, error: TransportError) {
        self.inner.lock().failed.push((peer, tag, error));
    }

    fn on_peer_state(&self, peer: PeerId, state: PeerState) {
        self.inner.lock().states.push((peer, state));
    }
}

// -----------------------------------------------------------------------------
// ----- Nodes -----------------------------------------------------------------

/// Small buffers and a short connect timeout, so tests stay cheap.
#[allow(dead_code)]
pub fn small_config() -> TransportConfig {
    TransportConfig {
        first_frag_size: 240,
        min_frag_size: 240,
        free_list_num: 4,
        free_list_max: 64,
        free_list_inc: 4,
        recv_prepost: 4,
        connect_retries: 2,
        connect_timeout: Duration::from_millis(10),
        ..TransportConfig::default()
    }
}

/// One simulated process with a single-rail registry.
#[allow(dead_code)]
pub struct Node {
    pub id: PeerId,
    pub handler: Arc<RecordingHandler>,
    pub registry: ModuleRegistry,
}

impl Node {
    #[allow(dead_code)]
    pub fn new(fabric: &MemoryFabric, id: u32, config: &TransportConfig) -> Self {
        let id = PeerId(id);
        let handler = RecordingHandler::new();
        let provider = fabric.provider(id, &[RAIL]);
        let registry =
            ModuleRegistry::init(&provider, config, handler.clone()).expect("valid config");

        Self {
            id,
            handler,
            registry,
        }
    }

    #[allow(dead_code)]
    pub fn module(&self) -> &TransportModule {
        &self.registry.modules()[0]
    }

    #[allow(dead_code)]
    pub fn state_of(&self, peer: &Node) -> PeerState {
        self.module()
            .find_peer(peer.id)
            .map_or(PeerState::Closed, |conn| conn.state())
    }

    #[allow(dead_code)]
    pub fn send(&self, to: &Node, tag: u64, payload: &[u8]) -> Result<(), TransportError> {
        let module = self.module();
        let mut frag = module.alloc()?;
        frag.set_tag(tag);
        if let Err(err) = frag.write(payload) {
            module.free(frag)?;
            return Err(err);
        }
        module.send(to.id, frag)
    }
}

// -----------------------------------------------------------------------------
// ----- Driving ---------------------------------------------------------------

/// Progress every node once per round.
#[allow(dead_code)]
pub fn pump(nodes: &[&Node], rounds: usize) {
    for _ in 0..rounds {
        let now = Instant::now();
        for node in nodes {
            node.registry.progress(now);
        }
    }
}

#[allow(dead_code)]
pub fn pump_until(nodes: &[&Node], mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        pump(nodes, 1);
    }
    panic!("condition not reached after 200 progress rounds");
}

/// Connect `a` to `b` and drive both until the connection is up on each side.
#[allow(dead_code)]
pub fn connect(a: &Node, b: &Node) {
    a.module().connect(b.id).expect("connect");
    pump_until(&[a, b], || {
        a.state_of(b) == PeerState::Connected && b.state_of(a) == PeerState::Connected
    });
}
