//! Three-node spanning-tree convergence.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use mycel_core::ident::NodeId;
use mycel_node::gossip::Gossip;
use mycel_node::packager::Packager;
use mycel_node::tree::{claim_score, SpanningTree, TreeParams};

use crate::{manual_clock, peer_up, run_ticks, Net};

fn tree_node(net: &Net, idx: usize, device: &[u8], clock: &Arc<AtomicU64>) -> Packager {
    let mut node = Packager::new(device);
    manual_clock(&mut node, clock);
    let interface = net.interface(idx, vec![0, 2]);
    node.add_interface(interface);

    let mut gossip = Gossip::new();
    gossip.start(&mut node);
    node.add_application(Box::new(gossip));

    let mut tree = SpanningTree::with_params(TreeParams {
        max_start_delay_ms: 0,
        subscribe: true,
        ..TreeParams::default()
    });
    tree.start(&mut node);
    node.add_application(Box::new(tree));
    node
}

fn tree_view(node: &mut Packager) -> (NodeId, Option<NodeId>, usize) {
    node.with_app::<SpanningTree, _>(&SpanningTree::app_id(), |tree, node| {
        (
            *tree.best_root(),
            tree.parent().copied(),
            node.current_addr().map(|a| a.coords().len()).unwrap_or(0),
        )
    })
    .expect("tree app registered")
}

/// Scenario: three mutually connected nodes each start as their own root
/// and converge on the node with the best claim score; the other two
/// become its one-hop children and everyone learns routes to everyone.
#[tokio::test]
async fn three_nodes_converge_on_the_best_claim() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(3);
    net.link(0, 1);
    net.link(0, 2);
    net.link(1, 2);

    let mut n0 = tree_node(&net, 0, b"tree-device-0", &clock);
    let mut n1 = tree_node(&net, 1, b"tree-device-1", &clock);
    let mut n2 = tree_node(&net, 2, b"tree-device-2", &clock);

    let i0 = n0.interface_ids()[1]; // [0] is the loopback
    let i1 = n1.interface_ids()[1];
    let i2 = n2.interface_ids()[1];
    peer_up(&mut n0, 0, i0, &mut n1, 1, i1);
    peer_up(&mut n0, 0, i0, &mut n2, 2, i2);
    peer_up(&mut n1, 1, i1, &mut n2, 2, i2);

    // ~2 minutes of simulated time, a quarter second per scheduler round
    run_ticks(&mut [&mut n0, &mut n1, &mut n2], &clock, 480, 250).await;

    let ids = [n0.node_id, n1.node_id, n2.node_id];
    let expected_root = *ids.iter().min_by_key(|id| claim_score(id, 0)).unwrap();

    for node in [&mut n0, &mut n1, &mut n2] {
        let own_id = node.node_id;
        let (root, parent, coords_len) = tree_view(node);
        assert_eq!(root, expected_root, "node {} disagrees on the root", hex::encode(&own_id[..4]));
        if own_id == expected_root {
            assert_eq!(parent, None);
            assert_eq!(coords_len, 0, "the root sits at the empty address");
        } else {
            assert_eq!(parent, Some(expected_root), "children hang off the root");
            assert_eq!(coords_len, 1, "one hop from the root");
        }
    }

    // every node can route to every other node
    for node in [&mut n0, &mut n1, &mut n2] {
        let own_id = node.node_id;
        for other in ids {
            if other != own_id {
                assert!(
                    node.route_to(&other).is_some(),
                    "{} has no route to {}",
                    hex::encode(&own_id[..4]),
                    hex::encode(&other[..4])
                );
            }
        }
    }
}

/// A child whose parent goes silent re-elects itself root.
#[tokio::test]
async fn orphaned_child_reelects_itself() {
    let clock = Arc::new(AtomicU64::new(100_000));
    let net = Net::new(2);
    net.link(0, 1);

    let mut n0 = tree_node(&net, 0, b"tree-device-0", &clock);
    let mut n1 = tree_node(&net, 1, b"tree-device-1", &clock);
    let i0 = n0.interface_ids()[1];
    let i1 = n1.interface_ids()[1];
    peer_up(&mut n0, 0, i0, &mut n1, 1, i1);

    run_ticks(&mut [&mut n0, &mut n1], &clock, 240, 250).await;

    let root = *[n0.node_id, n1.node_id].iter().min_by_key(|id| claim_score(id, 0)).unwrap();
    let child_is_n1 = root == n0.node_id;
    let child_id = if child_is_n1 { n1.node_id } else { n0.node_id };
    let child = if child_is_n1 { &mut n1 } else { &mut n0 };
    let (r, parent, _) = tree_view(child);
    assert_eq!(r, root);
    assert_eq!(parent, Some(root));

    // the parent falls silent for longer than max_tree_age; only the child
    // keeps ticking
    for _ in 0..200 {
        child.process().await;
        clock.fetch_add(500, std::sync::atomic::Ordering::Relaxed);
    }

    let (r, parent, _) = tree_view(child);
    assert_eq!(r, child_id, "child re-elected itself");
    assert_eq!(parent, None);
}
