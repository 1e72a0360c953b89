//! Mycel integration harness.
//!
//! Tests run two or three Packagers wired through an in-memory ether: each
//! node's "radio" driver pushes frames straight into its neighbors'
//! receive queues, with an optional in-flight drop filter for loss
//! scenarios. Time is a shared manual clock so retry and sync timers fire
//! deterministically.

mod gossip_sync;
mod routing;
mod transport;
mod tree_sync;
mod wakeup;

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use mycel_core::ident::InterfaceId;
use mycel_node::app::{AppError, AppFuture, AppMeta, Application};
use mycel_node::interface::{Datagram, Interface, InterfaceBuilder};
use mycel_node::packager::Packager;

/// Frames dropped when this returns true. Arguments: (from, to, wire).
pub type DropFilter = Box<dyn FnMut(usize, usize, &Bytes) -> bool + Send>;

/// The link-layer address of node `idx` on the test ether.
pub fn mac(idx: usize) -> Bytes {
    Bytes::from(vec![idx as u8 + 1; 6])
}

/// An in-memory ether connecting up to 255 nodes.
pub struct Net {
    inboxes: Vec<Arc<Mutex<VecDeque<Datagram>>>>,
    links: Arc<Mutex<HashSet<(usize, usize)>>>,
    filter: Arc<Mutex<Option<DropFilter>>>,
}

impl Net {
    pub fn new(nodes: usize) -> Self {
        Net {
            inboxes: (0..nodes).map(|_| Arc::new(Mutex::new(VecDeque::new()))).collect(),
            links: Arc::new(Mutex::new(HashSet::new())),
            filter: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a bidirectional link between two nodes.
    pub fn link(&self, a: usize, b: usize) {
        let mut links = self.links.lock().unwrap();
        links.insert((a, b));
        links.insert((b, a));
    }

    pub fn set_filter(&self, f: impl FnMut(usize, usize, &Bytes) -> bool + Send + 'static) {
        *self.filter.lock().unwrap() = Some(Box::new(f));
    }

    /// Peek at the raw frames currently queued for a node.
    pub fn snoop(&self, idx: usize) -> Vec<Bytes> {
        self.inboxes[idx].lock().unwrap().iter().map(|d| d.data.clone()).collect()
    }

    /// Inject a raw frame into a node's receive queue, as if `from` sent it.
    pub fn inject(&self, to: usize, from: usize, data: Bytes) {
        self.inboxes[to].lock().unwrap().push_back(Datagram {
            data,
            intrfc_id: None,
            addr: Some(mac(from)),
        });
    }

    /// Build node `idx`'s radio interface. Unicast frames follow the
    /// destination MAC; broadcast frames reach every linked node.
    pub fn interface(&self, idx: usize, schemas: Vec<u8>) -> Interface {
        let inboxes = self.inboxes.clone();
        let links = self.links.clone();
        let filter = self.filter.clone();

        let deliver = move |from: usize, to: usize, data: Bytes| {
            if !links.lock().unwrap().contains(&(from, to)) {
                return;
            }
            if let Some(f) = filter.lock().unwrap().as_mut() {
                if f(from, to, &data) {
                    return;
                }
            }
            inboxes[to].lock().unwrap().push_back(Datagram {
                data,
                intrfc_id: None,
                addr: Some(mac(from)),
            });
        };

        let own_inbox = self.inboxes[idx].clone();
        let send_deliver = deliver.clone();
        let cast_deliver = deliver;
        let cast_links = self.links.clone();
        let node_count = self.inboxes.len();

        InterfaceBuilder::new("testnet", 250_000, schemas)
            .recv_sync(move || own_inbox.lock().unwrap().pop_front())
            .send_sync(move |d: Datagram| {
                let Some(addr) = d.addr else { return };
                let to = addr[0] as usize - 1;
                send_deliver(idx, to, d.data);
            })
            .broadcast_sync(move |d: Datagram| {
                for to in 0..node_count {
                    if to != idx && cast_links.lock().unwrap().contains(&(idx, to)) {
                        cast_deliver(idx, to, d.data.clone());
                    }
                }
            })
            .build()
            .expect("test interface drivers are complete")
    }
}

/// Make both nodes peers of each other on the given interfaces.
pub fn peer_up(
    a: &mut Packager,
    a_idx: usize,
    a_intrfc: InterfaceId,
    b: &mut Packager,
    b_idx: usize,
    b_intrfc: InterfaceId,
) {
    let b_id = b.node_id;
    let a_id = a.node_id;
    a.add_peer(b_id, vec![(mac(b_idx), a_intrfc)]);
    b.add_peer(a_id, vec![(mac(a_idx), b_intrfc)]);
}

/// Install a shared manual clock on a node.
pub fn manual_clock(node: &mut Packager, clock: &Arc<AtomicU64>) {
    let c = clock.clone();
    node.set_clock(move || c.load(Ordering::Relaxed));
}

/// Run `ticks` scheduler rounds across all nodes, advancing the clock
/// `advance_ms` after each round.
pub async fn run_ticks(
    nodes: &mut [&mut Packager],
    clock: &Arc<AtomicU64>,
    ticks: usize,
    advance_ms: u64,
) {
    for _ in 0..ticks {
        for node in nodes.iter_mut() {
            node.process().await;
        }
        clock.fetch_add(advance_ms, Ordering::Relaxed);
    }
}

/// A test application that records every blob it receives.
pub struct Sink {
    meta: AppMeta,
    received: Arc<Mutex<Vec<Bytes>>>,
}

impl Sink {
    pub fn new(name: &str) -> (Self, Arc<Mutex<Vec<Bytes>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        (
            Sink {
                meta: AppMeta::new(name, "integration test sink", 0),
                received: received.clone(),
            },
            received,
        )
    }

    pub fn id(&self) -> [u8; 16] {
        self.meta.id
    }
}

impl Application for Sink {
    fn meta(&self) -> &AppMeta {
        &self.meta
    }

    fn receive(
        &mut self,
        _node: &mut Packager,
        blob: Bytes,
        _intrfc_id: InterfaceId,
        _mac: Bytes,
    ) -> Result<Option<AppFuture>, AppError> {
        self.received.lock().unwrap().push(blob);
        Ok(None)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
