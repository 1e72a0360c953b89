//! myceld — Mycel mesh node daemon.
//!
//! Boots a Packager from config, registers the Gossip and SpanningTree
//! overlays, and runs the cooperative work loop. Radio interfaces are
//! injected by platform glue; a bare daemon runs with only the loopback
//! interface, which is enough to exercise the overlays locally.

use anyhow::Result;
use bytes::Bytes;

use mycel_node::gossip::Gossip;
use mycel_node::tree::SpanningTree;
use mycel_node::{Event, EventKind, MycelConfig, Packager};

/// Cadence for the peer timeout sweep. On radio builds the discovery
/// beacon drives this instead.
const PEER_TIMEOUT_SWEEP_MS: u64 = 60_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p myceld
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = MycelConfig::write_default_if_missing()?;
    let config = MycelConfig::load()?;
    tracing::info!(config = %config_path.display(), "myceld starting");

    let mut node = Packager::new(&config.device_id_bytes());
    tracing::info!(node_id = %hex::encode(node.node_id), "node identity derived");

    if config.gossip.enabled {
        let mut gossip = Gossip::with_params((&config.gossip).into());
        gossip.start(&mut node);
        node.add_application(Box::new(gossip));
    }

    if config.tree.enabled {
        let mut tree = SpanningTree::with_params((&config.tree).into());
        tree.start(&mut node);
        node.add_application(Box::new(tree));
    }

    let now = node.now();
    node.queue_event(Event::new(
        now + PEER_TIMEOUT_SWEEP_MS,
        Bytes::from_static(b"timeout_peers"),
        EventKind::TimeoutPeers { interval_ms: PEER_TIMEOUT_SWEEP_MS },
    ));

    // graceful shutdown on ctrl-c
    let stop = node.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            stop.stop();
        }
    });

    node.work(
        config.worker.interval_ms,
        config.worker.use_modem_sleep,
        config.worker.modem_sleep_ms,
        config.worker.modem_wake_ms,
    )
    .await;

    Ok(())
}
