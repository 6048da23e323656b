use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use fragcrab::device::MemoryFabric;
use fragcrab::{
    Config, FragmentHandler, ModuleRegistry, PeerId, PeerState, TransportError, TransportModule,
};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "🦀 fragcrab";
const MAX_DEMO_PAYLOAD: usize = 4096;
const PROGRESS_TICK: Duration = Duration::from_millis(1);

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup().await;
    run().await
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

async fn setup() {
    // This has to be the first thing we do, because it initializes the config
    Config::init().await;

    init_tracing();
}

fn init_tracing() {
    let config = Config::snapshot();
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Tally -----------------------------------------------------------------

/// Counts upcalls across every node.
#[derive(Debug, Default)]
struct Tally {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl FragmentHandler for Tally {
    fn on_receive(&self, _peer: PeerId, _payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn on_send_complete(&self, _peer: PeerId, _tag: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_send_failed(&self, peer: PeerId, tag: u64, error: TransportError) {
        warn!("fragment {tag} to {peer} failed: {error}");
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_peer_state(&self, peer: PeerId, state: PeerState) {
        info!("{peer} is {state}");
    }
}

impl Tally {
    fn settled(&self, expected: u64) -> bool {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        completed + failed >= expected && self.received.load(Ordering::Relaxed) >= completed
    }
}

// -----------------------------------------------------------------------------
// ----- Run -------------------------------------------------------------------

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::snapshot();
    let tally = Arc::new(Tally::default());

    let rails: Vec<String> = (0..config.rails).map(|r| format!("rail{r}")).collect();
    let rail_names: Vec<&str> = rails.iter().map(String::as_str).collect();

    let fabric = MemoryFabric::new();
    let providers: Vec<_> = (0..config.nodes)
        .map(|node| fabric.provider(PeerId(node), &rail_names))
        .collect();

    let mut registries = Vec::with_capacity(providers.len());
    for provider in &providers {
        let handler: Arc<dyn FragmentHandler> = tally.clone();
        registries.push(ModuleRegistry::init(provider, &config.transport, handler)?);
    }

    info!(
        "{} running {} nodes over {} rails",
        APP_NAME, config.nodes, config.rails
    );

    let mut expected = 0;
    for (node, registry) in registries.iter().enumerate() {
        for target in (0..config.nodes).filter(|&t| t as usize != node) {
            expected += send_batch(registry, PeerId(target), config.messages);
        }
    }

    let started = Instant::now();
    let mut tick = tokio::time::interval(PROGRESS_TICK);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("{} interrupted", APP_NAME);
                break;
            }

            _ = tick.tick() => {
                let now = Instant::now();
                for registry in &registries {
                    registry.progress(now);
                }

                if tally.settled(expected) {
                    break;
                }
            }
        }
    }

    for registry in &registries {
        for module in registry.modules() {
            let stats = module.stats();
            info!(
                "{}: {} peers, {} errors, pool {}/{} outstanding",
                module.device_id(),
                stats.peers,
                stats.errors,
                stats.pool.outstanding,
                stats.pool.total
            );
        }
        registry.close();
    }

    info!(
        "{} done in {:?}: {} sent, {} received, {} failed of {}",
        APP_NAME,
        started.elapsed(),
        tally.completed.load(Ordering::Relaxed),
        tally.received.load(Ordering::Relaxed),
        tally.failed.load(Ordering::Relaxed),
        expected
    );

    Ok(())
}

/// Queue `count` random fragments for `target`, spread over the node's
/// modules. Returns how many were accepted.
fn send_batch(registry: &ModuleRegistry, target: PeerId, count: u32) -> u64 {
    let modules = registry.modules();
    if modules.is_empty() {
        return 0;
    }

    let mut rng = rand::rng();
    let mut accepted = 0;

    for seq in 0..count {
        let module: &TransportModule = &modules[seq as usize % modules.len()];
        let max_len = module.info().first_frag_size.clamp(1, MAX_DEMO_PAYLOAD);

        let mut payload = vec![0u8; rng.random_range(1..=max_len)];
        rng.fill(payload.as_mut_slice());

        let result = module.alloc().and_then(|mut frag| {
            frag.set_tag(u64::from(seq));
            match frag.write(&payload) {
                Ok(()) => module.send(target, frag),
                Err(err) => {
                    let _ = module.free(frag);
                    Err(err)
                }
            }
        });

        match result {
            Ok(()) => accepted += 1,
            Err(err) => {
                error!("{}: fragment {seq} to {target} rejected: {err}", module.device_id())
            }
        }
    }

    accepted
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
