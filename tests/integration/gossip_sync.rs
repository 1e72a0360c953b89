//! Gossip pull-sync between a fresh peer pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use mycel_node::gossip::{op, Gossip, GossipMessage, SIMPLE_GOSSIP_MAX};
use mycel_node::packager::Packager;

use crate::{manual_clock, peer_up, run_ticks, Net, Sink};

/// Scenario: B holds a published message; A subscribes to the topic and
/// discovers B. The new-peer sweep pulls the message over
/// REQUEST_IDS → RESPOND_IDS → REQUEST → RESPOND, the subscribed
/// application receives it exactly once, and the point answer is not
/// re-broadcast.
#[tokio::test]
async fn new_peer_pulls_missed_messages() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);

    let topic = [0x42u8; 16];
    let payload = Bytes::from(vec![0x77u8; 150]);
    assert!(payload.len() <= SIMPLE_GOSSIP_MAX, "fits the point-answer budget");

    let mut a = Packager::new(b"subscriber");
    let mut b = Packager::new(b"publisher");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    let ia = net.interface(0, vec![0, 2]);
    let ib = net.interface(1, vec![0, 2]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);

    // B publishes while the two nodes cannot hear each other
    let mut gossip_b = Gossip::new();
    gossip_b.publish(&mut b, topic, payload.clone());
    b.add_application(Box::new(gossip_b));
    run_ticks(&mut [&mut b], &clock, 5, 10).await; // flush into the void

    // A subscribes application X to the topic
    let (sink, received) = Sink::new("X");
    let app_x = sink.id();
    a.add_application(Box::new(sink));
    let mut gossip_a = Gossip::new();
    gossip_a.subscribe(topic, app_x);
    gossip_a.start(&mut a);
    a.add_application(Box::new(gossip_a));

    // now the link comes up and the peers discover each other
    net.link(0, 1);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    run_ticks(&mut [&mut a, &mut b], &clock, 40, 10).await;

    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1, "application X heard the message once");
        assert_eq!(received[0], payload);
    }

    // the pulled copy arrived as a RESPOND and must not have scheduled a
    // re-broadcast echo
    let respond = GossipMessage::new(op::RESPOND, topic, payload.clone());
    let respond_id = respond.id();
    let mut echo_id = vec![b'b'];
    echo_id.extend_from_slice(&respond_id);
    assert!(!a.has_scheduled(&echo_id), "point answers are not re-broadcast");
    let seen = a
        .with_app::<Gossip, _>(&Gossip::app_id(), |g, _| g.has_seen(&respond_id))
        .unwrap();
    assert!(seen);

    // a later periodic sweep re-offers the same id; dedup keeps the
    // application at exactly one delivery
    clock.fetch_add(25_000, Ordering::Relaxed);
    run_ticks(&mut [&mut a, &mut b], &clock, 40, 10).await;
    assert_eq!(received.lock().unwrap().len(), 1);
}

/// Large messages are announced by id and pulled, not flooded whole.
#[tokio::test]
async fn large_messages_travel_by_notify_and_pull() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);

    let topic = [0x43u8; 16];
    let payload = Bytes::from(vec![0x33u8; 500]);

    let mut a = Packager::new(b"listener");
    let mut b = Packager::new(b"publisher");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    let ia = net.interface(0, vec![0, 2]);
    let ib = net.interface(1, vec![0, 2]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    let (sink, received) = Sink::new("BigEars");
    let app_x = sink.id();
    a.add_application(Box::new(sink));
    let mut gossip_a = Gossip::new();
    gossip_a.subscribe(topic, app_x);
    a.add_application(Box::new(gossip_a));

    let gossip_b = Gossip::new();
    b.add_application(Box::new(gossip_b));
    b.with_app::<Gossip, _>(&Gossip::app_id(), |g, node| {
        g.publish(node, topic, payload.clone());
    });

    // NOTIFY floods; A pulls the full message by id
    run_ticks(&mut [&mut a, &mut b], &clock, 40, 10).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], payload);
}
