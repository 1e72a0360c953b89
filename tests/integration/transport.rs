//! Single-packet ACK and sequenced delivery with loss recovery.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::Bytes;

use mycel_core::address::Metric;
use mycel_core::packet::Packet;
use mycel_node::packager::Packager;

use crate::{manual_clock, peer_up, run_ticks, Net, Sink};

/// Scenario: a 50-byte send is ACKed and never retransmitted.
#[tokio::test]
async fn single_packet_ack_suppresses_retry() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);

    let mut a = Packager::new(b"node-a");
    let mut b = Packager::new(b"node-b");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    let ia = net.interface(0, vec![0]);
    let ib = net.interface(1, vec![0]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    let (sink, received) = Sink::new("AckTarget");
    let app_id = sink.id();
    b.add_application(Box::new(sink));

    let blob = Bytes::from(vec![0x5A; 50]);
    assert!(a.send(app_id, blob.clone(), Some(b.node_id), None, Metric::Tree, 3));

    run_ticks(&mut [&mut a, &mut b], &clock, 6, 10).await;
    assert_eq!(received.lock().unwrap().len(), 1);
    assert_eq!(received.lock().unwrap()[0], blob);

    // past the retry deadline: the ACK must have cancelled the retry, so
    // the application never hears the blob twice
    clock.fetch_add(3_000, std::sync::atomic::Ordering::Relaxed);
    run_ticks(&mut [&mut a, &mut b], &clock, 6, 10).await;
    assert_eq!(received.lock().unwrap().len(), 1, "no retransmission after ACK");
}

/// Scenario: an unACKed packet is retried until the budget runs out.
#[tokio::test]
async fn lost_packet_is_retried() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);
    // drop everything from B back to A, so ACKs never arrive
    net.set_filter(|from, _, _| from == 1);

    let mut a = Packager::new(b"node-a");
    let mut b = Packager::new(b"node-b");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    let ia = net.interface(0, vec![0]);
    let ib = net.interface(1, vec![0]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    let (sink, received) = Sink::new("RetryTarget");
    let app_id = sink.id();
    b.add_application(Box::new(sink));

    assert!(a.send(app_id, Bytes::from_static(b"again"), Some(b.node_id), None, Metric::Tree, 2));

    // first delivery
    run_ticks(&mut [&mut a, &mut b], &clock, 4, 10).await;
    assert_eq!(received.lock().unwrap().len(), 1);

    // retry fires at +2 s; B receives the same package again
    clock.fetch_add(2_100, std::sync::atomic::Ordering::Relaxed);
    run_ticks(&mut [&mut a, &mut b], &clock, 4, 10).await;
    assert_eq!(received.lock().unwrap().len(), 2, "one retry went out");
}

/// Scenario: a 2000-byte blob fragments, one fragment is lost in transit,
/// and the receiver recovers it with an RTX request after the sync delay.
#[tokio::test]
async fn sequenced_delivery_recovers_lost_fragment() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);

    // drop fragment index 3 (A → B), once
    let mut dropped = false;
    net.set_filter(move |from, _, wire| {
        if from != 0 || dropped {
            return false;
        }
        let Ok(p) = Packet::decode(wire) else { return false };
        if p.seq_id().is_some() && !p.flags.ack() && p.id() == 3 {
            dropped = true;
            return true;
        }
        false
    });

    let mut a = Packager::new(b"node-a");
    let mut b = Packager::new(b"node-b");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    // schema 2 only: 243-byte bodies, u8 sequence ids
    let ia = net.interface(0, vec![2]);
    let ib = net.interface(1, vec![2]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    let (sink, received) = Sink::new("SeqTarget");
    let app_id = sink.id();
    b.add_application(Box::new(sink));

    let blob: Bytes = (0..2000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    assert!(a.send(app_id, blob.clone(), Some(b.node_id), None, Metric::Tree, 3));

    // 9 fragments, one flushed per tick, plus ACK chatter
    run_ticks(&mut [&mut a, &mut b], &clock, 30, 10).await;
    assert!(received.lock().unwrap().is_empty(), "fragment 3 is missing");

    // the sequence-sync timer fires and B asks for the missing fragment
    clock.fetch_add(10_100, std::sync::atomic::Ordering::Relaxed);
    run_ticks(&mut [&mut a, &mut b], &clock, 10, 10).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1, "sequence completed after RTX");
    assert_eq!(received[0], blob);
}

/// Reassembly is abandoned once the RTX budget is exhausted.
#[tokio::test]
async fn reassembly_gives_up_when_source_stays_silent() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);

    // lose fragment 3 forever, and all RTX requests with it
    net.set_filter(move |from, _, wire| {
        let Ok(p) = Packet::decode(wire) else { return false };
        (from == 0 && p.seq_id().is_some() && p.id() == 3) || (from == 1 && p.flags.rtx())
    });

    let mut a = Packager::new(b"node-a");
    let mut b = Packager::new(b"node-b");
    manual_clock(&mut a, &clock);
    manual_clock(&mut b, &clock);
    let ia = net.interface(0, vec![2]);
    let ib = net.interface(1, vec![2]);
    let (ia_id, ib_id) = (ia.id, ib.id);
    a.add_interface(ia);
    b.add_interface(ib);
    peer_up(&mut a, 0, ia_id, &mut b, 1, ib_id);

    let (sink, received) = Sink::new("GiveUpTarget");
    let app_id = sink.id();
    b.add_application(Box::new(sink));

    let blob = Bytes::from(vec![1u8; 2000]);
    assert!(a.send(app_id, blob, Some(b.node_id), None, Metric::Tree, 3));
    run_ticks(&mut [&mut a, &mut b], &clock, 30, 10).await;

    // three sync rounds, then abandonment
    for _ in 0..4 {
        clock.fetch_add(10_100, std::sync::atomic::Ordering::Relaxed);
        run_ticks(&mut [&mut a, &mut b], &clock, 5, 10).await;
    }
    assert!(received.lock().unwrap().is_empty());
    // the sync event is no longer being rescheduled
    let ss_id = [b'S', b'S', 0, 0];
    assert!(!b.has_scheduled(&ss_id));
}
