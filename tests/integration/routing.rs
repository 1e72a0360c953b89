//! Error reversal on relay schemas at an intermediate hop.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::Bytes;

use mycel_core::address::Address;
use mycel_core::flags::Flags;
use mycel_core::package::Package;
use mycel_core::packet::Packet;
use mycel_core::schema::get_schema;
use mycel_node::packager::Packager;

use crate::{manual_clock, peer_up, run_ticks, Net, Sink};

/// Scenario: A sends toward a remote address over a relay schema; the
/// intermediate hop has no route to the destination, so it sets the error
/// flag and reverses the packet toward the origin, which surfaces the
/// undeliverable payload to its application.
#[tokio::test]
async fn unroutable_relay_packet_reverses_to_origin() {
    let clock = Arc::new(AtomicU64::new(50_000));
    let net = Net::new(2);
    net.link(0, 1);

    let mut a = Packager::new(b"origin");
    let mut hop = Packager::new(b"relay-hop");
    manual_clock(&mut a, &clock);
    manual_clock(&mut hop, &clock);
    // schema 11: addressed, relayed one hop at a time, no ttl
    let ia = net.interface(0, vec![11]);
    let ih = net.interface(1, vec![11]);
    let (ia_id, ih_id) = (ia.id, ih.id);
    a.add_interface(ia);
    hop.add_interface(ih);
    peer_up(&mut a, 0, ia_id, &mut hop, 1, ih_id);

    // A owns an address in tree state 5; the hop can route back to it
    let addr_a = Address::from_coords(5, &[1]).unwrap();
    a.set_addr(addr_a.clone());
    hop.add_route(a.node_id, addr_a.clone());

    // the destination exists in the same tree state but nobody has a route
    let dest = Address::from_coords(5, &[2, 7]).unwrap();

    let (sink, received) = Sink::new("Origin");
    let app_id = sink.id();
    a.add_application(Box::new(sink));

    // the relay packet A would have emitted toward the destination
    let schema = get_schema(11).unwrap();
    let mut p = Packet::new(schema, Flags::default());
    p.set_id(9);
    p.set("tree_state", dest.tree_state);
    p.set("to_addr", Bytes::copy_from_slice(&dest.address));
    p.set("from_addr", Bytes::copy_from_slice(&addr_a.address));
    let payload = Package::from_blob(app_id, Bytes::from_static(b"are you there?"));
    p.set_body(payload.encode());
    net.inject(1, 0, p.encode().unwrap());

    // the hop processes the packet and turns it around
    run_ticks(&mut [&mut hop], &clock, 2, 10).await;
    let reversed: Vec<Packet> =
        net.snoop(0).iter().filter_map(|wire| Packet::decode(wire).ok()).collect();
    assert_eq!(reversed.len(), 1);
    assert!(reversed[0].flags.error(), "hop set the error flag");
    assert_eq!(reversed[0].to_addr(), Some(dest.address), "addresses are not swapped");
    assert_eq!(reversed[0].from_addr(), Some(addr_a.address));

    // the origin recognizes its own from_addr and surfaces the failure
    run_ticks(&mut [&mut a], &clock, 2, 10).await;
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], Bytes::from_static(b"are you there?"));
}

/// An error-flagged relay packet whose origin is also unroutable is
/// dropped instead of bouncing forever.
#[tokio::test]
async fn reversed_packet_without_origin_route_is_dropped() {
    let clock = Arc::new(AtomicU64::new(50_000));
    let net = Net::new(2);
    net.link(0, 1);

    let mut a = Packager::new(b"origin");
    let mut hop = Packager::new(b"relay-hop");
    manual_clock(&mut a, &clock);
    manual_clock(&mut hop, &clock);
    let ia = net.interface(0, vec![11]);
    let ih = net.interface(1, vec![11]);
    let (ia_id, ih_id) = (ia.id, ih.id);
    a.add_interface(ia);
    hop.add_interface(ih);
    peer_up(&mut a, 0, ia_id, &mut hop, 1, ih_id);

    // the hop knows neither the destination nor the origin
    let origin = Address::from_coords(5, &[1]).unwrap();
    let dest = Address::from_coords(5, &[2, 7]).unwrap();

    let schema = get_schema(11).unwrap();
    let mut flags = Flags::default();
    flags.set_error(true);
    let mut p = Packet::new(schema, flags);
    p.set_id(9);
    p.set("tree_state", dest.tree_state);
    p.set("to_addr", Bytes::copy_from_slice(&dest.address));
    p.set("from_addr", Bytes::copy_from_slice(&origin.address));
    p.set_body(Package::from_blob([1u8; 16], Bytes::from_static(b"lost")).encode());
    net.inject(1, 0, p.encode().unwrap());

    run_ticks(&mut [&mut hop], &clock, 3, 10).await;
    assert!(net.snoop(0).is_empty(), "unroutable error packet is dropped");
}
