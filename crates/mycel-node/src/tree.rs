//! Spanning-tree overlay — distributed election and address embedding.
//!
//! Every node scores candidate roots by XOR distance to a fixed target id
//! (lower wins) and grafts itself under the neighbor advertising the best
//! claim, receiving a coordinate that extends the parent's address. The
//! resulting tree embedding is what the Packager routes on. Claims age out;
//! a silent parent triggers re-election from scratch.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use rand::Rng;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use mycel_core::address::{Address, Metric};
use mycel_core::ident::{AppId, InterfaceId, NodeId};

use crate::app::{AppError, AppFuture, AppMeta, Application};
use crate::event::{AppEvent, Event, EventKind};
use crate::gossip::Gossip;
use crate::packager::Packager;

pub mod op {
    pub const SEND: u8 = 0;
    pub const RESPOND: u8 = 15;
    pub const REQUEST_ADDRESS_ASSIGNMENT: u8 = 240;
    pub const ASSIGN_ADDRESS: u8 = 255;
}

mod tag {
    pub const MAINTAIN: u8 = 0;
    pub const PERIODIC_BROADCAST: u8 = 1;
}

/// Fixed targets for the root election, one per overlay. Only the first
/// overlay is active; the table is part of the protocol.
pub const ROOT_ID_TARGETS: [[u8; 32]; 4] = [
    *b"12341234123412341234123412341234",
    *b"43214321432143214321432143214321",
    *b"56785678567856785678567856785678",
    *b"87658765876587658765876587658765",
];

/// Highest coordinate a parent can assign.
pub const MAX_COORD: u8 = 135;

const KNOWN_CLAIMS_CAP: usize = 10;

/// Tree state: the first byte of `crc32(root_claim_id)` big-endian.
/// Addresses are only comparable within one tree state.
pub fn tree_state(claim: &NodeId) -> u8 {
    (crc32fast::hash(claim) >> 24) as u8
}

/// XOR distance from a candidate root id to the overlay target, as a
/// 256-bit big-endian integer. Lower is better.
pub fn claim_score(node_id: &NodeId, overlay_idx: usize) -> [u8; 32] {
    let target = &ROOT_ID_TARGETS[overlay_idx];
    let mut score = [0u8; 32];
    for (i, byte) in score.iter_mut().enumerate() {
        *byte = node_id[i] ^ target[i];
    }
    score
}

/// Big-endian wide addition used to order claims by score plus recorded
/// distance from root.
fn score_plus(mut score: [u8; 32], add: u32) -> [u8; 32] {
    let mut carry = add as u64;
    for i in (0..32).rev() {
        if carry == 0 {
            break;
        }
        let sum = score[i] as u64 + (carry & 0xFF);
        score[i] = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
    score
}

// ── Wire format ───────────────────────────────────────────────────────────────

/// On-wire tree message. Fixed 90-byte layout, big-endian ts.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct TreeMessageWire {
    op: u8,
    ts: U64<BigEndian>,
    age: u8,
    claim: [u8; 32],
    address: [u8; 16],
    node_id: [u8; 32],
}

assert_eq_size!(TreeMessageWire, [u8; 90]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMessage {
    pub op: u8,
    pub ts: u64,
    pub age: u8,
    pub claim: NodeId,
    pub address: [u8; 16],
    pub node_id: NodeId,
}

impl TreeMessage {
    pub fn serialize(&self) -> Bytes {
        let wire = TreeMessageWire {
            op: self.op,
            ts: U64::new(self.ts),
            age: self.age,
            claim: self.claim,
            address: self.address,
            node_id: self.node_id,
        };
        Bytes::copy_from_slice(wire.as_bytes())
    }

    pub fn deserialize(blob: &[u8]) -> Option<Self> {
        let wire = TreeMessageWire::read_from(blob)?;
        Some(TreeMessage {
            op: wire.op,
            ts: wire.ts.get(),
            age: wire.age,
            claim: wire.claim,
            address: wire.address,
            node_id: wire.node_id,
        })
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TreeParams {
    /// Random start jitter ceiling, milliseconds.
    pub max_start_delay_ms: u64,
    /// Maintenance cadence, milliseconds.
    pub maintenance_delay_ms: u64,
    /// Claims and parents older than this are dead, seconds.
    pub max_tree_age_s: u64,
    /// SEND repeats per maintenance round.
    pub broadcast_count: u8,
    /// Gap between repeated SENDs, milliseconds.
    pub broadcast_interval_ms: u64,
    /// Publish the local address over gossip.
    pub publish: bool,
    /// Subscribe to the tree topic to learn remote routes.
    pub subscribe: bool,
}

impl Default for TreeParams {
    fn default() -> Self {
        TreeParams {
            max_start_delay_ms: 10_000,
            maintenance_delay_ms: 20_000,
            max_tree_age_s: 60,
            broadcast_count: 1,
            broadcast_interval_ms: crate::MODEM_INTERSECT_INTERVAL_MS,
            publish: true,
            subscribe: false,
        }
    }
}

/// A neighbor's advertised claim, anchored to when it was fresh.
#[derive(Debug, Clone)]
struct KnownClaim {
    claim: NodeId,
    anchored_ts_s: u64,
    d_tree: u32,
    peer_id: NodeId,
}

/// The spanning-tree overlay application.
pub struct SpanningTree {
    meta: AppMeta,
    params: TreeParams,
    gossip_app_id: AppId,
    current_best_root_id: NodeId,
    current_parent: Option<NodeId>,
    current_children: HashMap<NodeId, u8>,
    known_claims: VecDeque<KnownClaim>,
    tree_last_ts_s: u64,
}

impl SpanningTree {
    pub fn new() -> Self {
        SpanningTree::with_params(TreeParams::default())
    }

    pub fn with_params(params: TreeParams) -> Self {
        SpanningTree {
            meta: AppMeta::new(
                "SpanningTree",
                "Distributed spanning-tree address embedding",
                0,
            ),
            params,
            gossip_app_id: Gossip::app_id(),
            current_best_root_id: [0u8; 32],
            current_parent: None,
            current_children: HashMap::new(),
            known_claims: VecDeque::with_capacity(KNOWN_CLAIMS_CAP),
            tree_last_ts_s: 0,
        }
    }

    /// The deterministic app id (doubles as the gossip topic).
    pub fn app_id() -> AppId {
        AppMeta::new("SpanningTree", "Distributed spanning-tree address embedding", 0).id
    }

    pub fn best_root(&self) -> &NodeId {
        &self.current_best_root_id
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.current_parent.as_ref()
    }

    pub fn children(&self) -> &HashMap<NodeId, u8> {
        &self.current_children
    }

    pub fn is_root(&self, node: &Packager) -> bool {
        self.current_best_root_id == node.node_id
    }

    fn now_s(node: &Packager) -> u64 {
        node.now() / 1000
    }

    fn tree_age(&self, node: &Packager) -> u64 {
        Self::now_s(node).saturating_sub(self.tree_last_ts_s)
    }

    /// Elect self as root, then schedule the first maintenance round with
    /// start jitter. Subscribes to the tree topic when configured to.
    pub fn start(&mut self, node: &mut Packager) {
        self.current_best_root_id = node.node_id;
        self.current_parent = None;
        self.current_children.clear();
        self.tree_last_ts_s = Self::now_s(node);
        let own_state = tree_state(&node.node_id);
        node.set_addr(Address::root(own_state));

        let jitter = if self.params.max_start_delay_ms > 0 {
            rand::thread_rng().gen_range(0..self.params.max_start_delay_ms)
        } else {
            0
        };
        let now = node.now();
        self.schedule_maintenance_at(node, now + jitter);

        if self.params.subscribe {
            let topic = self.meta.id;
            let me = self.meta.id;
            let gossip_id = self.gossip_app_id;
            node.with_app::<Gossip, _>(&gossip_id, |g, _| {
                g.subscribe(topic, me);
            });
        }
    }

    /// Cancel scheduled work and drop the gossip subscription.
    pub fn stop(&mut self, node: &mut Packager) {
        node.cancel_event(Bytes::copy_from_slice(&self.meta.id));
        node.cancel_event(self.maintenance_event_id());
        let topic = self.meta.id;
        let me = self.meta.id;
        let gossip_id = self.gossip_app_id;
        node.with_app::<Gossip, _>(&gossip_id, |g, _| {
            g.unsubscribe(topic, &me);
        });
    }

    fn maintenance_event_id(&self) -> Bytes {
        let mut id = Vec::with_capacity(17);
        id.extend_from_slice(&self.meta.id);
        id.push(b's');
        Bytes::from(id)
    }

    fn schedule_maintenance_at(&self, node: &mut Packager, ts: u64) {
        node.queue_event(Event::new(
            ts,
            self.maintenance_event_id(),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::MAINTAIN, data: Bytes::new() },
            },
        ));
    }

    fn schedule_maintenance(&self, node: &mut Packager) {
        let ts = node.now() + self.params.maintenance_delay_ms;
        self.schedule_maintenance_at(node, ts);
    }

    fn message(&self, node: &Packager, op_code: u8) -> TreeMessage {
        let address = node.current_addr().map(|a| a.address).unwrap_or([0u8; 16]);
        TreeMessage {
            op: op_code,
            ts: node.now(),
            age: self.tree_age(node).min(255) as u8,
            claim: self.current_best_root_id,
            address,
            node_id: node.node_id,
        }
    }

    fn broadcast_claim(&mut self, node: &mut Packager) {
        let tm = self.message(node, op::SEND);
        node.broadcast(self.meta.id, tm.serialize(), None);
    }

    fn respond_claim(&mut self, node: &mut Packager, peer_id: NodeId) {
        let tm = self.message(node, op::RESPOND);
        node.send(self.meta.id, tm.serialize(), Some(peer_id), None, Metric::Tree, 3);
    }

    fn request_address_assignment(&mut self, node: &mut Packager, peer_id: NodeId, claim: NodeId) {
        let tm = TreeMessage {
            op: op::REQUEST_ADDRESS_ASSIGNMENT,
            ts: node.now(),
            age: 0,
            claim,
            address: [0u8; 16],
            node_id: node.node_id,
        };
        node.send(self.meta.id, tm.serialize(), Some(peer_id), None, Metric::Tree, 3);
    }

    fn assign_address(&mut self, node: &mut Packager, peer_id: NodeId, coords: &[u8]) {
        let Ok(addr) = Address::from_coords(tree_state(&self.current_best_root_id), coords) else {
            return;
        };
        let mut tm = self.message(node, op::ASSIGN_ADDRESS);
        tm.address = addr.address;
        node.send(self.meta.id, tm.serialize(), Some(peer_id), None, Metric::Tree, 3);
    }

    /// Lowest coordinate in [1, MAX_COORD] not yet assigned to a child.
    fn lowest_available_coord(&self) -> Option<u8> {
        (1..=MAX_COORD).find(|c| !self.current_children.values().any(|v| v == c))
    }

    fn record_claim(&mut self, node: &Packager, tm: &TreeMessage, peer_id: NodeId) {
        if (tm.age as u64) >= self.params.max_tree_age_s {
            return;
        }
        let state = tree_state(&tm.claim);
        let addr = Address::from_bytes(state, tm.address);
        let root = Address::root(state);
        let claim = KnownClaim {
            claim: tm.claim,
            anchored_ts_s: Self::now_s(node).saturating_sub(tm.age as u64),
            d_tree: Address::d_tree(&root, &addr),
            peer_id,
        };
        if self.known_claims.len() >= KNOWN_CLAIMS_CAP {
            self.known_claims.pop_front();
        }
        self.known_claims.push_back(claim);
    }

    /// Publish our address under the tree topic so distant nodes can
    /// install routes to us.
    fn publish_over_gossip(&mut self, node: &mut Packager, addr: Option<&Address>) {
        if !self.params.publish || !node.has_application(&self.gossip_app_id) {
            return;
        }
        let mut tm = self.message(node, op::SEND);
        if let Some(addr) = addr {
            tm.address = addr.address;
        }
        let topic = self.meta.id;
        let gossip_id = self.gossip_app_id;
        let wire = tm.serialize();
        node.with_app::<Gossip, _>(&gossip_id, |g, n| {
            g.publish(n, topic, wire);
        });
    }

    /// Accept a coordinate assignment from a better-claiming parent.
    fn accept_assignment(&mut self, node: &mut Packager, tm: &TreeMessage, peer_id: Option<NodeId>) {
        self.current_best_root_id = tm.claim;
        self.current_parent = peer_id;
        self.current_children.clear();
        let addr = Address::from_bytes(tree_state(&tm.claim), tm.address);
        tracing::debug!(
            root = %hex::encode(&tm.claim[..8]),
            addr = %addr,
            "joined tree"
        );
        node.set_addr(addr.clone());
        self.publish_over_gossip(node, Some(&addr));
    }

    /// Tear down local tree state and elect self again.
    fn reelect_self(&mut self, node: &mut Packager) {
        tracing::debug!("tree too old, re-electing self as root");
        self.current_best_root_id = node.node_id;
        self.current_parent = None;
        self.current_children.clear();
        let addr = Address::root(tree_state(&node.node_id));
        node.set_addr(addr.clone());
        self.publish_over_gossip(node, Some(&addr));
    }

    /// One maintenance round: age out state, chase the best known claim,
    /// announce ours, and reschedule.
    fn maintain(&mut self, node: &mut Packager) {
        let now_s = Self::now_s(node);

        if self.tree_age(node) > self.params.max_tree_age_s {
            self.reelect_self(node);
        }

        let max_age = self.params.max_tree_age_s;
        self.known_claims.retain(|c| now_s.saturating_sub(c.anchored_ts_s) < max_age);

        if !self.known_claims.is_empty() {
            let current_state = tree_state(&self.current_best_root_id);
            let current_d_tree = node
                .current_addr()
                .map(|a| Address::d_tree(a, &Address::root(current_state)))
                .unwrap_or(0);
            let our_score = claim_score(&self.current_best_root_id, 0);

            let best = self
                .known_claims
                .iter()
                .min_by_key(|c| score_plus(claim_score(&c.claim, 0), c.d_tree))
                .cloned()
                .unwrap();
            let best_score = claim_score(&best.claim, 0);

            let strictly_better = best_score < our_score;
            let closer_tie = best_score == our_score
                && (best.d_tree as i64) < current_d_tree as i64 - 1;
            if strictly_better || closer_tie {
                self.request_address_assignment(node, best.peer_id, best.claim);
            }
        }

        if self.is_root(node) {
            self.tree_last_ts_s = now_s;
        }

        self.periodic_broadcast(node, self.params.broadcast_count);
        self.publish_over_gossip(node, None);
        self.schedule_maintenance(node);
    }

    /// Broadcast the claim `count` times, `broadcast_interval_ms` apart.
    fn periodic_broadcast(&mut self, node: &mut Packager, count: u8) {
        if count == 0 {
            self.schedule_maintenance(node);
            return;
        }
        self.broadcast_claim(node);
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.broadcast_interval_ms,
            Bytes::copy_from_slice(&self.meta.id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent {
                    tag: tag::PERIODIC_BROADCAST,
                    data: Bytes::copy_from_slice(&[count - 1]),
                },
            },
        ));
    }
}

impl Default for SpanningTree {
    fn default() -> Self {
        SpanningTree::new()
    }
}

impl Application for SpanningTree {
    fn meta(&self) -> &AppMeta {
        &self.meta
    }

    fn receive(
        &mut self,
        node: &mut Packager,
        blob: Bytes,
        intrfc_id: InterfaceId,
        mac: Bytes,
    ) -> Result<Option<AppFuture>, AppError> {
        let Some(tm) = TreeMessage::deserialize(&blob) else {
            return Ok(None);
        };
        let peer_id = node.peer_for_mac(&mac, &intrfc_id);
        let their_score = claim_score(&tm.claim, 0);
        let our_score = claim_score(&self.current_best_root_id, 0);

        match tm.op {
            op::SEND => {
                if tm.node_id != node.node_id {
                    node.add_route(
                        tm.node_id,
                        Address::from_bytes(tree_state(&tm.claim), tm.address),
                    );
                    if Some(tm.node_id) != peer_id {
                        // relayed over gossip for route discovery; nothing to
                        // negotiate with a non-neighbor
                        return Ok(None);
                    }
                }
                if let Some(peer_id) = peer_id {
                    self.record_claim(node, &tm, peer_id);
                    if our_score < their_score {
                        self.respond_claim(node, peer_id);
                    }
                }
            }
            op::RESPOND => {
                if let Some(peer_id) = peer_id {
                    self.record_claim(node, &tm, peer_id);
                }
            }
            op::REQUEST_ADDRESS_ASSIGNMENT => {
                let local_state = node.current_addr().map(|a| a.tree_state);
                if local_state != Some(tree_state(&tm.claim)) {
                    // a request for some other tree incarnation
                    return Ok(None);
                }
                let Some(peer_id) = peer_id else {
                    return Ok(None);
                };
                let parent_coords: Vec<u8> =
                    node.current_addr().map(|a| a.coords().to_vec()).unwrap_or_default();
                if let Some(existing) = self.current_children.get(&peer_id).copied() {
                    let mut coords = parent_coords;
                    coords.push(existing);
                    self.assign_address(node, peer_id, &coords);
                    return Ok(None);
                }
                let Some(coord) = self.lowest_available_coord() else {
                    return Ok(None); // address space under this node exhausted
                };
                let mut coords = parent_coords;
                coords.push(coord);
                self.current_children.insert(peer_id, coord);
                self.assign_address(node, peer_id, &coords);
            }
            op::ASSIGN_ADDRESS => {
                if their_score < our_score && tm.node_id != node.node_id {
                    self.accept_assignment(node, &tm, peer_id);
                } else if let Some(peer_id) = peer_id {
                    self.respond_claim(node, peer_id);
                }
            }
            other => {
                tracing::trace!(op = other, "unknown tree op");
            }
        }

        if Some(tm.node_id) == self.current_parent {
            self.tree_last_ts_s = Self::now_s(node).saturating_sub(tm.age as u64);
        }
        Ok(None)
    }

    fn on_event(&mut self, node: &mut Packager, event: AppEvent) -> Option<AppFuture> {
        match event.tag {
            tag::MAINTAIN => self.maintain(node),
            tag::PERIODIC_BROADCAST => {
                let count = event.data.first().copied().unwrap_or(0);
                self.periodic_broadcast(node, count);
            }
            _ => {}
        }
        None
    }

    fn on_peer_removed(&mut self, _node: &mut Packager, peer_id: &NodeId) {
        self.current_children.remove(peer_id);
        self.known_claims.retain(|c| &c.peer_id != peer_id);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
