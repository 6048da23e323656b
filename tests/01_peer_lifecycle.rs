mod support;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fragcrab::device::{ConnectionEvent, ConnectionEventKind, MemoryFabric};
use fragcrab::{PeerId, PeerState, TransportConfig, TransportError};

use support::{Node, RAIL, connect, pump, pump_until, small_config};

#[test]
fn connect_reaches_connected_on_both_sides() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);

    connect(&a, &b);

    let states = a.handler.snapshot().states;
    assert_eq!(states, [(b.id, PeerState::Connected)]);
    assert_eq!(b.handler.snapshot().states, [(a.id, PeerState::Connected)]);

    // Receive buffers are posted as soon as each side is up.
    assert_eq!(fabric.posted_receives(RAIL, a.id, b.id), config.recv_prepost);
    assert_eq!(fabric.posted_receives(RAIL, b.id, a.id), config.recv_prepost);
    assert_eq!(
        a.module().peer(b.id).stats().posted_receives,
        config.recv_prepost
    );
}

#[test]
fn send_to_closed_peer_connects_and_flushes_in_order() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);

    for tag in 0..5u64 {
        a.send(&b, tag, format!("frag-{tag}").as_bytes()).unwrap();
    }

    let peer = a.module().peer(b.id);
    assert_eq!(peer.state(), PeerState::Connecting);
    assert_eq!(peer.stats().pending, 5);

    pump_until(&[&a, &b], || b.handler.snapshot().received.len() == 5);

    let received: Vec<_> = b
        .handler
        .snapshot()
        .received
        .into_iter()
        .map(|(from, payload)| {
            assert_eq!(from, a.id);
            String::from_utf8(payload).unwrap()
        })
        .collect();
    assert_eq!(received, ["frag-0", "frag-1", "frag-2", "frag-3", "frag-4"]);

    pump_until(&[&a, &b], || a.handler.snapshot().completed.len() == 5);
    let tags: Vec<_> = a.handler.snapshot().completed.iter().map(|c| c.1).collect();
    assert_eq!(tags, [0, 1, 2, 3, 4]);
    assert!(a.handler.snapshot().failed.is_empty());
}

#[test]
fn retries_past_the_limit_fail_every_queued_fragment_once() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    fabric.set_unreachable(b.id, true);

    let start = Instant::now();
    for tag in 10..13u64 {
        a.send(&b, tag, b"lost").unwrap();
    }

    let peer = a.module().peer(b.id);
    for round in 1..=config.connect_retries {
        a.registry.progress(start + Duration::from_secs(u64::from(round)));
        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.stats().retries, round);
    }
    assert!(a.handler.snapshot().failed.is_empty());

    a.registry.progress(start + Duration::from_secs(60));
    assert_eq!(peer.state(), PeerState::Failed);

    let failed = a.handler.snapshot().failed;
    assert_eq!(failed.len(), 3);
    for ((peer_id, tag, err), expected) in failed.iter().zip(10..13u64) {
        assert_eq!(*peer_id, b.id);
        assert_eq!(*tag, expected);
        assert!(matches!(err, TransportError::ConnectionFailed { peer, .. } if *peer == b.id));
    }

    // Nothing further is reported once the peer has failed.
    a.registry.progress(start + Duration::from_secs(120));
    assert_eq!(a.handler.snapshot().failed.len(), 3);
    assert_eq!(peer.stats().pending, 0);
    assert_eq!(a.module().stats().pool.outstanding, 0);
}

#[test]
fn send_after_failure_is_rejected_without_an_upcall() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    fabric.set_unreachable(b.id, true);

    a.module().connect(b.id).unwrap();
    a.registry.progress(Instant::now() + Duration::from_secs(3600));
    a.registry.progress(Instant::now() + Duration::from_secs(7200));
    a.registry.progress(Instant::now() + Duration::from_secs(10800));
    assert_eq!(a.state_of(&b), PeerState::Failed);

    let err = a.send(&b, 1, b"late").unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed { .. }));
    assert!(a.handler.snapshot().failed.is_empty());
    assert_eq!(a.module().stats().pool.outstanding, 0);

    // Terminal: a later reachable fabric does not revive the peer.
    fabric.set_unreachable(b.id, false);
    a.module().connect(b.id).unwrap();
    pump(&[&a, &b], 5);
    assert_eq!(a.state_of(&b), PeerState::Failed);
}

#[test]
fn handshake_from_the_wrong_identity_fails_the_peer() {
    let fabric = MemoryFabric::new();
    let a = Node::new(&fabric, 1, &small_config());
    let stranger = PeerId(9);

    fabric.inject_event(
        RAIL,
        a.id,
        ConnectionEvent::new(stranger, ConnectionEventKind::Incoming),
    );
    fabric.inject_event(
        RAIL,
        a.id,
        ConnectionEvent::new(
            stranger,
            ConnectionEventKind::Handshake {
                claimed: PeerId(8),
            },
        ),
    );

    a.registry.progress(Instant::now());

    let peer = a.module().find_peer(stranger).expect("created on accept");
    assert_eq!(peer.state(), PeerState::Failed);
    assert_eq!(a.handler.snapshot().states, [(stranger, PeerState::Failed)]);
}

#[test]
fn local_shutdown_closes_both_sides() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    connect(&a, &b);

    a.module().peer(b.id).shutdown().unwrap();
    assert_eq!(a.state_of(&b), PeerState::Shutdown);

    pump_until(&[&a, &b], || b.state_of(&a) == PeerState::Shutdown);

    // Posted receive buffers came back on both sides.
    assert_eq!(a.module().stats().pool.outstanding, 0);
    assert_eq!(b.module().stats().pool.outstanding, 0);

    let err = a.send(&b, 3, b"after").unwrap_err();
    assert_eq!(err, TransportError::ConnectionClosed { peer: b.id });
    let err = b.send(&a, 4, b"after").unwrap_err();
    assert_eq!(err, TransportError::ConnectionClosed { peer: a.id });
    assert!(a.handler.snapshot().failed.is_empty());
    assert!(b.handler.snapshot().failed.is_empty());
}

#[test]
fn shutdown_fails_the_in_flight_send_once() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    connect(&a, &b);

    a.send(&b, 1, b"in flight").unwrap();
    a.send(&b, 2, b"queued").unwrap();
    assert!(a.module().peer(b.id).stats().send_in_flight);

    a.module().peer(b.id).shutdown().unwrap();
    pump(&[&a, &b], 3);

    let failed = a.handler.snapshot().failed;
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[0].1, 1);
    assert_eq!(failed[1].1, 2);
    assert!(
        failed
            .iter()
            .all(|f| f.2 == TransportError::ConnectionClosed { peer: b.id })
    );
    assert!(a.handler.snapshot().completed.is_empty());
    assert_eq!(a.module().stats().errors, 0);
}

#[test]
fn closing_the_module_fails_pending_work_and_rejects_new_work() {
    let fabric = MemoryFabric::new();
    let config = small_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    fabric.set_unreachable(b.id, true);

    a.send(&b, 1, b"one").unwrap();
    a.send(&b, 2, b"two").unwrap();
    let spare = a.module().alloc().unwrap();

    let stats = a.module().close();
    assert!(stats.closed);
    assert_eq!(stats.outstanding, 1);

    let failed = a.handler.snapshot().failed;
    assert_eq!(failed.len(), 2);
    assert!(
        failed
            .iter()
            .all(|f| f.2 == TransportError::ConnectionClosed { peer: b.id })
    );
    assert_eq!(a.state_of(&b), PeerState::Shutdown);

    assert!(matches!(
        a.module().alloc(),
        Err(TransportError::ResourceExhausted { .. })
    ));
    assert_eq!(
        a.module().send(b.id, spare),
        Err(TransportError::ConnectionClosed { peer: b.id })
    );
    assert_eq!(a.module().stats().pool.outstanding, 0);
    assert_eq!(a.handler.snapshot().failed.len(), 2);

    // A second close is a no-op.
    a.module().close();
    assert_eq!(a.handler.snapshot().failed.len(), 2);
    assert_eq!(a.registry.progress(Instant::now()), 0);
}

#[test]
fn peers_created_after_close_start_shut_down() {
    let fabric = MemoryFabric::new();
    let a = Node::new(&fabric, 1, &small_config());
    let spare = a.module().alloc().unwrap();

    a.module().close();

    let late = a.module().peer(PeerId(5));
    assert_eq!(late.state(), PeerState::Shutdown);
    assert_eq!(
        late.send(spare),
        Err(TransportError::ConnectionClosed { peer: PeerId(5) })
    );
    assert!(a.handler.snapshot().failed.is_empty());
    assert!(a.handler.snapshot().states.is_empty());
    assert_eq!(a.module().stats().pool.outstanding, 0);
}

// -----------------------------------------------------------------------------
// ----- Concurrency -----------------------------------------------------------

fn roomy_config() -> TransportConfig {
    TransportConfig {
        free_list_max: 1024,
        free_list_inc: 32,
        connect_timeout: Duration::from_secs(5),
        ..small_config()
    }
}

#[test]
fn sends_from_another_thread_during_connect_keep_fifo_order() {
    const COUNT: u64 = 500;

    let fabric = MemoryFabric::new();
    let config = roomy_config();
    let a = Node::new(&fabric, 1, &config);
    let b = Node::new(&fabric, 2, &config);
    let queued = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            for tag in 0..COUNT {
                loop {
                    match a.send(&b, tag, &tag.to_le_bytes()) {
                        Ok(()) => break,
                        Err(TransportError::ResourceExhausted { .. }) => thread::yield_now(),
                        Err(err) => panic!("send {tag} rejected: {err}"),
                    }
                }
                queued.fetch_add(1, Ordering::Release);
            }
            done.store(true, Ordering::Release);
        });

        // Start driving once the first send has kicked off the connect, so
        // the rest land while the peer is CONNECTING, CONNECT_ACK or up.
        while queued.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            pump(&[&a, &b], 1);
            let settled = done.load(Ordering::Acquire)
                && a.handler.snapshot().completed.len() == COUNT as usize
                && b.handler.snapshot().received.len() == COUNT as usize;
            if settled {
                break;
            }
            assert!(Instant::now() < deadline, "sends did not settle in time");
        }
    });

    let recorded = a.handler.snapshot();
    assert!(recorded.failed.is_empty());
    let tags: Vec<_> = recorded.completed.iter().map(|c| c.1).collect();
    assert_eq!(tags, (0..COUNT).collect::<Vec<_>>());

    let received: Vec<_> = b
        .handler
        .snapshot()
        .received
        .into_iter()
        .map(|(from, payload)| {
            assert_eq!(from, a.id);
            u64::from_le_bytes(payload.try_into().expect("8-byte payload"))
        })
        .collect();
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());
    assert_eq!(a.state_of(&b), PeerState::Connected);
}

#[test]
fn sends_racing_close_are_each_failed_or_rejected_once() {
    let fabric = MemoryFabric::new();
    let config = TransportConfig {
        free_list_max: 512,
        ..roomy_config()
    };
    let a = Node::new(&fabric, 1, &config);
    let targets: Vec<_> = (100..108).map(PeerId).collect();
    for &target in &targets {
        fabric.set_unreachable(target, true);
    }

    let accepted_count = AtomicUsize::new(0);

    let accepted = thread::scope(|scope| {
        let sender = scope.spawn(|| {
            let module = a.module();
            let mut accepted = Vec::new();

            for tag in 0u64.. {
                let mut frag = match module.alloc() {
                    Ok(frag) => frag,
                    Err(_) if module.is_closed() => break,
                    Err(_) => {
                        thread::yield_now();
                        continue;
                    }
                };
                frag.set_tag(tag);

                let target = targets[tag as usize % targets.len()];
                match module.send(target, frag) {
                    Ok(()) => {
                        accepted.push(tag);
                        accepted_count.fetch_add(1, Ordering::Release);
                    }
                    // Rejected sends get no upcall.
                    Err(err) => {
                        assert_eq!(err, TransportError::ConnectionClosed { peer: target });
                    }
                }
            }

            accepted
        });

        while accepted_count.load(Ordering::Acquire) < 50 {
            thread::yield_now();
        }
        a.module().close();

        sender.join().expect("sender thread")
    });

    assert!(accepted.len() >= 50);

    let failed = a.handler.snapshot().failed;
    assert!(
        failed.iter().all(|(peer, _, err)| {
            *err == TransportError::ConnectionClosed { peer: *peer }
        })
    );

    let failed_tags: BTreeSet<_> = failed.iter().map(|f| f.1).collect();
    assert_eq!(failed_tags.len(), failed.len(), "a fragment failed twice");
    assert_eq!(failed_tags, accepted.iter().copied().collect::<BTreeSet<_>>());

    assert!(a.handler.snapshot().completed.is_empty());
    assert_eq!(a.module().stats().pool.outstanding, 0);
    assert!(
        targets
            .iter()
            .all(|&t| a.module().peer(t).state() == PeerState::Shutdown)
    );
}
