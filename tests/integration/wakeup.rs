//! RNS / NIA modem-wake rendezvous.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use mycel_core::address::Metric;
use mycel_core::packet::Packet;
use mycel_node::event::rns_event_id;
use mycel_node::packager::Packager;

use crate::{manual_clock, peer_up, run_ticks, Net, Sink};

/// Scenario: the destination has been silent past the transmit window, so
/// the sender parks the datagram and probes with RNS; the peer answers
/// NIA, and the parked datagram goes out on the same interface.
#[tokio::test]
async fn rns_nia_wakes_a_sleeping_peer() {
    let clock = Arc::new(AtomicU64::new(10_000));
    let net = Net::new(2);
    net.link(0, 1);

    let mut a = Packager::new(b"sender");
    let mut p = Packager::new(b"sleeper");
    manual_clock(&mut a, &clock);
    manual_clock(&mut p, &clock);
    let ia = net.interface(0, vec![0]);
    let ip = net.interface(1, vec![0]);
    let (ia_id, ip_id) = (ia.id, ip.id);
    a.add_interface(ia);
    p.add_interface(ip);
    peer_up(&mut a, 0, ia_id, &mut p, 1, ip_id);

    let (sink, received) = Sink::new("Sleeper");
    let app_id = sink.id();
    p.add_application(Box::new(sink));

    // silence for longer than the 800 ms transmit window
    clock.fetch_add(1_000, Ordering::Relaxed);

    let peer_id = p.node_id;
    assert!(a.send(app_id, Bytes::from_static(b"wake up"), Some(peer_id), None, Metric::Tree, 3));

    // the datagram is parked and a probe is pending
    assert_eq!(a.peer(&peer_id).unwrap().queue.len(), 1);
    assert!(a.has_scheduled(&rns_event_id(&peer_id, &ia_id)));

    run_ticks(&mut [&mut a], &clock, 1, 5).await;
    let on_air = net.snoop(1);
    assert_eq!(on_air.len(), 1);
    assert!(Packet::decode(&on_air[0]).unwrap().flags.rns(), "only the probe went out");

    // the sleeper answers NIA and the parked datagram follows
    run_ticks(&mut [&mut a, &mut p], &clock, 6, 5).await;
    assert!(a.peer(&peer_id).unwrap().queue.is_empty(), "queue flushed after NIA");
    assert!(!a.has_scheduled(&rns_event_id(&peer_id, &ia_id)), "probe cancelled");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], Bytes::from_static(b"wake up"));
}

/// A peer that never answers its probes loses its parked datagrams.
#[tokio::test]
async fn unanswered_probes_drop_parked_datagrams() {
    let clock = Arc::new(AtomicU64::new(10_000));
    let net = Net::new(2);
    net.link(0, 1);
    // the sleeper's radio is dead: nothing it sends arrives
    net.set_filter(|from, _, _| from == 1);

    let mut a = Packager::new(b"sender");
    let mut p = Packager::new(b"dead-sleeper");
    manual_clock(&mut a, &clock);
    manual_clock(&mut p, &clock);
    let ia = net.interface(0, vec![0]);
    let ip = net.interface(1, vec![0]);
    let (ia_id, ip_id) = (ia.id, ip.id);
    a.add_interface(ia);
    p.add_interface(ip);
    peer_up(&mut a, 0, ia_id, &mut p, 1, ip_id);

    clock.fetch_add(1_000, Ordering::Relaxed);
    let peer_id = p.node_id;
    assert!(a.send([1u8; 16], Bytes::from_static(b"anyone?"), Some(peer_id), None, Metric::Tree, 3));
    assert_eq!(a.peer(&peer_id).unwrap().queue.len(), 1);

    // let every probe retry elapse
    run_ticks(&mut [&mut a, &mut p], &clock, 12, 40).await;
    assert!(a.peer(&peer_id).unwrap().queue.is_empty(), "parked datagrams dropped");
    assert!(!a.has_scheduled(&rns_event_id(&peer_id, &ia_id)));
}
