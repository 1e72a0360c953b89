//! The Packager — Mycel's transport core.
//!
//! One Packager owns every piece of mutable runtime state: interfaces,
//! peers, routes, caches, the event schedule, and the registered
//! applications. It is driven by a single cooperative task (`work`), so no
//! state needs locking; callbacks receive `&mut Packager` directly.
//!
//! Inbound flow: driver → Interface inbox → `receive` → control handling /
//! forwarding / reassembly → `deliver` → Application. Outbound flow:
//! `send`/`broadcast` → fragmentation → Interface outbox → driver. All
//! retries and timeouts run through the event schedule; nothing sleeps
//! inside an I/O path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use mycel_core::address::{Address, Metric};
use mycel_core::flags::{Control, Flags};
use mycel_core::ident::{node_id as derive_node_id, AppId, InterfaceId, NodeId};
use mycel_core::package::Package;
use mycel_core::packet::Packet;
use mycel_core::schema::{get_schemas, routing_schema_ids, Schema};
use mycel_core::sequence::Sequence;
use mycel_core::TtlCache;

use crate::app::{AppFuture, Application};
use crate::event::{retry_event_id, rns_event_id, seq_sync_event_id, AppEvent, Event, EventKind};
use crate::hooks::{HookEvent, Observer};
use crate::interface::{Datagram, Interface};
use crate::peer::{Peer, PEER_TIMEOUT_TICKS};
use crate::{
    MODEM_INTERSECT_INTERVAL_MS, MODEM_INTERSECT_RTX_TIMES, MODEM_SLEEP_MS, MODEM_WAKE_MS,
    SEND_RETRY_COUNT, SEND_RETRY_DELAY_MS, SEQ_SYNC_DELAY_MS,
};

const NEW_EVENTS_CAP: usize = 64;
const CANCEL_EVENTS_CAP: usize = 64;
const SLEEPSKIP_CAP: usize = 10;
const NODE_ADDR_CAP: usize = 2;
const INVERSE_ROUTE_CAP: usize = 2;
const SEQ_CACHE_SIZE: usize = 10;
const PACKET_CACHE_SIZE: usize = 10;
/// TTL for cached outbound packets and sequences, in seconds.
const TX_CACHE_TTL_S: u64 = 60;
/// Reassembly retry budget; each reception from the source resets it.
const IN_SEQ_RETRIES: u8 = 3;

/// Where an inbound sequence came from, for retransmission requests.
#[derive(Debug, Clone)]
pub enum SeqSource {
    /// A direct neighbor; RTX goes straight to it.
    Neighbor(NodeId),
    /// A remote originator; RTX is routed toward its address.
    Remote(Address),
    /// Unattributable; missing fragments cannot be requested.
    Unknown,
}

/// Reassembly state for one inbound sequence.
#[derive(Debug)]
pub struct InSequence {
    pub seq: Sequence,
    pub src: SeqSource,
    pub retry: u8,
    pub intrfc_id: InterfaceId,
}

/// What to do with a relay-schema packet (no ttl) at an intermediate hop,
/// as a pure function of reachability and the error flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    /// Forward in the direction the flags indicate.
    Deliverable,
    /// Destination unreachable: set the error flag and reverse.
    SetError,
    /// Already reversed and the origin is unreachable too.
    Drop,
}

pub fn relay_action(to_reachable: bool, from_reachable: bool, error: bool) -> RelayAction {
    match (error, to_reachable, from_reachable) {
        (false, true, _) => RelayAction::Deliverable,
        (false, false, _) => RelayAction::SetError,
        (true, _, true) => RelayAction::Deliverable,
        (true, _, false) => RelayAction::Drop,
    }
}

/// Handle for flipping a running work loop off from outside.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

pub struct Packager {
    pub node_id: NodeId,
    interfaces: Vec<Interface>,
    loopback_id: InterfaceId,
    peers: HashMap<NodeId, Peer>,
    inverse_peers: HashMap<(Bytes, InterfaceId), NodeId>,
    routes: HashMap<Address, NodeId>,
    inverse_routes: HashMap<NodeId, VecDeque<Address>>,
    banned: Vec<NodeId>,
    node_addrs: VecDeque<Address>,
    apps: HashMap<AppId, Box<dyn Application>>,
    packet_id: u8,
    seq_id: u8,
    seq_cache: TtlCache<u8, Sequence>,
    packet_cache: TtlCache<u8, Packet>,
    in_seqs: HashMap<u8, InSequence>,
    schedule: HashMap<Bytes, Event>,
    new_events: VecDeque<Event>,
    cancel_events: VecDeque<Bytes>,
    running: Arc<AtomicBool>,
    sleepskip: VecDeque<()>,
    observers: Vec<Observer>,
    pending: Vec<AppFuture>,
    clock: Box<dyn Fn() -> u64 + Send>,
    lightsleep: Box<dyn FnMut(u64) + Send>,
}

impl Packager {
    /// Build a Packager for a device. The node id is
    /// `sha256(sha256(unique_device_id))`; a loopback interface for
    /// inter-application delivery is registered immediately.
    pub fn new(unique_device_id: &[u8]) -> Self {
        let start = Instant::now();
        let loopback = Interface::loopback();
        let loopback_id = loopback.id;
        Packager {
            node_id: derive_node_id(unique_device_id),
            interfaces: vec![loopback],
            loopback_id,
            peers: HashMap::new(),
            inverse_peers: HashMap::new(),
            routes: HashMap::new(),
            inverse_routes: HashMap::new(),
            banned: Vec::new(),
            node_addrs: VecDeque::with_capacity(NODE_ADDR_CAP),
            apps: HashMap::new(),
            packet_id: 0,
            seq_id: 0,
            seq_cache: TtlCache::new(SEQ_CACHE_SIZE),
            packet_cache: TtlCache::new(PACKET_CACHE_SIZE),
            in_seqs: HashMap::new(),
            schedule: HashMap::new(),
            new_events: VecDeque::with_capacity(NEW_EVENTS_CAP),
            cancel_events: VecDeque::with_capacity(CANCEL_EVENTS_CAP),
            running: Arc::new(AtomicBool::new(false)),
            sleepskip: VecDeque::with_capacity(SLEEPSKIP_CAP),
            observers: Vec::new(),
            pending: Vec::new(),
            clock: Box::new(move || start.elapsed().as_millis() as u64),
            lightsleep: Box::new(|ms| std::thread::sleep(std::time::Duration::from_millis(ms))),
        }
    }

    /// Replace the millisecond clock (tests drive time manually).
    pub fn set_clock(&mut self, clock: impl Fn() -> u64 + Send + 'static) {
        self.clock = Box::new(clock);
    }

    /// Replace the platform low-power sleep call.
    pub fn set_lightsleep(&mut self, f: impl FnMut(u64) + Send + 'static) {
        self.lightsleep = Box::new(f);
    }

    pub fn now(&self) -> u64 {
        (self.clock)()
    }

    pub fn add_observer(&mut self, observer: Observer) {
        self.observers.push(observer);
    }

    fn notify(&mut self, event: HookEvent) {
        if self.observers.is_empty() {
            return;
        }
        let mut observers = std::mem::take(&mut self.observers);
        for observer in observers.iter_mut() {
            observer(&event);
        }
        // keep observers registered during the callbacks, if any
        observers.append(&mut self.observers);
        self.observers = observers;
    }

    fn sleepskip_push(&mut self) {
        if self.sleepskip.len() >= SLEEPSKIP_CAP {
            self.sleepskip.pop_front();
        }
        self.sleepskip.push_back(());
    }

    // ── Interfaces ────────────────────────────────────────────────────────────

    pub fn add_interface(&mut self, interface: Interface) {
        tracing::debug!(name = %interface.name, id = %hex::encode(interface.id), "interface added");
        self.interfaces.push(interface);
    }

    pub fn remove_interface(&mut self, id: &InterfaceId) {
        self.interfaces.retain(|i| &i.id != id);
    }

    pub fn interface_ids(&self) -> Vec<InterfaceId> {
        self.interfaces.iter().map(|i| i.id).collect()
    }

    pub fn loopback_id(&self) -> InterfaceId {
        self.loopback_id
    }

    fn interface_index(&self, id: &InterfaceId) -> Option<usize> {
        self.interfaces.iter().position(|i| &i.id == id)
    }

    // ── Peers, routes, bans ───────────────────────────────────────────────────

    /// Upsert a peer, deduplicating (MAC, interface) pairs and refreshing
    /// its liveness. Banned ids are ignored.
    pub fn add_peer(&mut self, peer_id: NodeId, interfaces: Vec<(Bytes, InterfaceId)>) {
        if self.banned.contains(&peer_id) {
            return;
        }
        let now = self.now();
        let is_new = !self.peers.contains_key(&peer_id);
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| Peer::new(peer_id, Vec::new(), now));
        for (mac, intrfc_id) in interfaces {
            if !peer.interfaces.iter().any(|(m, i)| *m == mac && *i == intrfc_id) {
                peer.interfaces.push((mac.clone(), intrfc_id));
            }
            self.inverse_peers.entry((mac, intrfc_id)).or_insert(peer_id);
        }
        peer.last_rx = now;
        peer.timeout = PEER_TIMEOUT_TICKS;
        if is_new {
            tracing::debug!(peer = %hex::encode(&peer_id[..8]), "peer added");
            self.notify(HookEvent::PeerAdded(peer_id));
            self.for_each_app(|app, node| app.on_peer_added(node, &peer_id));
        }
    }

    /// Drop a peer along with every route that points at it.
    pub fn remove_peer(&mut self, peer_id: &NodeId) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        for addr in &peer.addrs {
            self.routes.remove(addr);
        }
        self.inverse_routes.remove(peer_id);
        self.inverse_peers.retain(|_, v| v != peer_id);
        tracing::debug!(peer = %hex::encode(&peer_id[..8]), "peer removed");
        let peer_id = *peer_id;
        self.notify(HookEvent::PeerRemoved(peer_id));
        self.for_each_app(|app, node| app.on_peer_removed(node, &peer_id));
    }

    pub fn peer(&self, peer_id: &NodeId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Resolve the peer behind a (MAC, interface) pair.
    pub fn peer_for_mac(&self, mac: &Bytes, intrfc_id: &InterfaceId) -> Option<NodeId> {
        self.inverse_peers.get(&(mac.clone(), *intrfc_id)).copied()
    }

    /// Record that `address` belongs to `node_id`, keeping one address per
    /// tree state per node (at most two states during a transition).
    pub fn add_route(&mut self, node_id: NodeId, address: Address) {
        if self.banned.contains(&node_id) {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&node_id) {
            if !peer.addrs.contains(&address) {
                peer.set_addr(address.clone());
            }
        }
        self.routes.insert(address.clone(), node_id);
        let addrs = self.inverse_routes.entry(node_id).or_default();
        addrs.retain(|a| a.tree_state != address.tree_state);
        while addrs.len() >= INVERSE_ROUTE_CAP {
            addrs.pop_front();
        }
        addrs.push_back(address);
    }

    pub fn remove_route(&mut self, address: &Address) {
        let Some(node_id) = self.routes.remove(address) else {
            return;
        };
        if let Some(addrs) = self.inverse_routes.get_mut(&node_id) {
            addrs.retain(|a| a != address);
        }
    }

    pub fn routes(&self) -> &HashMap<Address, NodeId> {
        &self.routes
    }

    pub fn route_to(&self, node_id: &NodeId) -> Option<&VecDeque<Address>> {
        self.inverse_routes.get(node_id)
    }

    /// Ban a node: it is dropped as a peer and future peer/route adds for
    /// it are ignored.
    pub fn ban(&mut self, node_id: NodeId) {
        if !self.banned.contains(&node_id) {
            self.banned.push(node_id);
        }
        self.remove_peer(&node_id);
    }

    pub fn unban(&mut self, node_id: &NodeId) {
        self.banned.retain(|b| b != node_id);
    }

    /// Tick every peer's timeout counter, evicting the silent ones. Driven
    /// by the discovery layer's cadence (or a TimeoutPeers event).
    pub fn timeout_peers(&mut self) {
        let mut expired = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            peer.timeout = peer.timeout.saturating_sub(1);
            if peer.timeout == 0 {
                expired.push(*id);
            }
        }
        for id in expired {
            self.remove_peer(&id);
        }
    }

    // ── Local addresses ───────────────────────────────────────────────────────

    /// Set the node's tree-embedded address, keeping the previous tree
    /// state's address alive through the transition.
    pub fn set_addr(&mut self, addr: Address) {
        self.node_addrs.retain(|a| a.tree_state != addr.tree_state);
        while self.node_addrs.len() >= NODE_ADDR_CAP {
            self.node_addrs.pop_front();
        }
        self.node_addrs.push_back(addr.clone());
        self.notify(HookEvent::AddrSet(addr.clone()));
        self.for_each_app(|app, node| app.on_addr_set(node, &addr));
    }

    /// The current address (most recently set).
    pub fn current_addr(&self) -> Option<&Address> {
        self.node_addrs.back()
    }

    pub fn node_addrs(&self) -> &VecDeque<Address> {
        &self.node_addrs
    }

    fn is_local_addr(&self, addr: &Address) -> bool {
        self.node_addrs.contains(addr)
    }

    // ── Applications ──────────────────────────────────────────────────────────

    pub fn add_application(&mut self, app: Box<dyn Application>) {
        let id = app.id();
        tracing::debug!(app = %app.meta().name, id = %hex::encode(id), "application registered");
        self.apps.insert(id, app);
    }

    pub fn remove_application(&mut self, app_id: &AppId) {
        self.apps.remove(app_id);
    }

    pub fn has_application(&self, app_id: &AppId) -> bool {
        self.apps.contains_key(app_id)
    }

    /// Run a closure against a registered application of a known concrete
    /// type. The application is out of the registry for the duration, so
    /// the closure gets full mutable access to the Packager.
    pub fn with_app<A: Application + 'static, R>(
        &mut self,
        app_id: &AppId,
        f: impl FnOnce(&mut A, &mut Packager) -> R,
    ) -> Option<R> {
        let mut app = self.apps.remove(app_id)?;
        let result = app.as_any_mut().downcast_mut::<A>().map(|a| f(a, self));
        self.apps.entry(*app_id).or_insert(app);
        result
    }

    /// Hand a blob to a registered application's receive callback.
    pub fn dispatch_to_app(
        &mut self,
        app_id: AppId,
        blob: Bytes,
        intrfc_id: InterfaceId,
        mac: Bytes,
    ) -> bool {
        let Some(mut app) = self.apps.remove(&app_id) else {
            return false;
        };
        let result = app.receive(self, blob, intrfc_id, mac);
        self.apps.entry(app_id).or_insert(app);
        match result {
            Ok(Some(future)) => {
                self.pending.push(future);
                true
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(app = %hex::encode(app_id), error = %e, "application receive failed");
                self.notify(HookEvent::ReceiveFailed(app_id));
                false
            }
        }
    }

    fn for_each_app(&mut self, f: impl Fn(&mut Box<dyn Application>, &mut Packager)) {
        let ids: Vec<AppId> = self.apps.keys().copied().collect();
        for id in ids {
            if let Some(mut app) = self.apps.remove(&id) {
                f(&mut app, self);
                self.apps.entry(id).or_insert(app);
            }
        }
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Queue an event for the next tick. An event with an id already in the
    /// schedule overwrites it.
    pub fn queue_event(&mut self, event: Event) {
        if self.new_events.len() >= NEW_EVENTS_CAP {
            self.new_events.pop_front();
        }
        self.new_events.push_back(event);
    }

    /// Cancel a scheduled event by id at the start of the next tick.
    pub fn cancel_event(&mut self, id: Bytes) {
        if self.cancel_events.len() >= CANCEL_EVENTS_CAP {
            self.cancel_events.pop_front();
        }
        self.cancel_events.push_back(id);
    }

    pub fn has_scheduled(&self, id: &[u8]) -> bool {
        self.schedule.contains_key(id) || self.new_events.iter().any(|e| e.id == id)
    }

    // ── Outbound: broadcast ───────────────────────────────────────────────────

    /// Package the blob and broadcast it — on one interface, or on every
    /// interface using a schema they all support. Returns false when no
    /// capable schema exists. Broadcasts are never acknowledged or retried.
    pub fn broadcast(&mut self, app_id: AppId, blob: Bytes, interface: Option<InterfaceId>) -> bool {
        self.sleepskip_push();
        let pkg = Package::from_blob(app_id, blob).encode();

        let (mut sids, targets): (HashSet<u8>, Vec<usize>) = match interface {
            Some(id) => {
                let Some(idx) = self.interface_index(&id) else {
                    return false;
                };
                (self.interfaces[idx].supported_schemas.iter().copied().collect(), vec![idx])
            }
            None => {
                if self.interfaces.is_empty() {
                    return false;
                }
                let mut sids: HashSet<u8> =
                    self.interfaces[0].supported_schemas.iter().copied().collect();
                for i in &self.interfaces[1..] {
                    let set: HashSet<u8> = i.supported_schemas.iter().copied().collect();
                    sids.retain(|s| set.contains(s));
                }
                (sids, (0..self.interfaces.len()).collect())
            }
        };

        let Some(schema) = best_schema(&sids, pkg.len()) else {
            return false;
        };

        let packets: Vec<Packet> = if pkg.len() <= schema.max_body() {
            let mut p = Packet::new(schema, Flags::default());
            p.set_id(self.packet_id as u16);
            p.set("seq_id", self.seq_id);
            p.set("seq_size", 0u8);
            p.set_body(pkg);
            if schema.has_checksum() {
                let _ = p.set_checksum();
            }
            vec![p]
        } else {
            sids.retain(|s| {
                mycel_core::schema::get_schema(*s).map_or(false, |s| s.supports_sequence())
            });
            let Some(schema) = best_schema(&sids, pkg.len()) else {
                return false;
            };
            let Ok(seq) = Sequence::for_blob(schema, self.seq_id, &pkg) else {
                return false;
            };
            let template = Packet::new(schema, Flags::default());
            let packets = (0..seq.seq_size as u16)
                .filter_map(|i| seq.get_packet(i, Flags::default(), &template))
                .collect();
            let now = self.now();
            self.seq_cache.add(self.seq_id, seq, TX_CACHE_TTL_S, now);
            self.seq_id = self.seq_id.wrapping_add(1);
            packets
        };

        for idx in targets {
            let intrfc_id = self.interfaces[idx].id;
            for p in &packets {
                if let Ok(wire) = p.encode() {
                    self.interfaces[idx].broadcast(Datagram::new(wire, intrfc_id, None));
                }
            }
        }
        true
    }

    // ── Outbound: addressed send ──────────────────────────────────────────────

    /// Choose the next hop toward an address: the route's owner if it is a
    /// direct peer, else the peer whose address (in the same tree state)
    /// minimizes the metric.
    pub fn next_hop(&self, to_addr: &Address, metric: Metric) -> Option<(NodeId, Address)> {
        if let Some(owner) = self.routes.get(to_addr) {
            if self.peers.contains_key(owner) {
                return Some((*owner, to_addr.clone()));
            }
        }
        let mut candidates: Vec<(NodeId, &Address)> = Vec::new();
        for (id, peer) in &self.peers {
            for addr in &peer.addrs {
                if addr.tree_state == to_addr.tree_state {
                    candidates.push((*id, addr));
                }
            }
        }
        candidates
            .into_iter()
            .min_by(|a, b| {
                Address::distance(metric, a.1, to_addr)
                    .total_cmp(&Address::distance(metric, b.1, to_addr))
            })
            .map(|(id, addr)| (id, addr.clone()))
    }

    /// Send a Package to a node — directly if it is a peer, else routed via
    /// the tree embedding. Returns false when there is no destination, no
    /// route, no capable schema, or no usable interface.
    pub fn send(
        &mut self,
        app_id: AppId,
        blob: Bytes,
        node_id: Option<NodeId>,
        to_addr: Option<Address>,
        metric: Metric,
        retries: u8,
    ) -> bool {
        if node_id.is_none() && to_addr.is_none() {
            return false;
        }
        let is_local = node_id.map_or(false, |n| self.peers.contains_key(&n));
        let mut to_addr = to_addr;

        let peer_id = if is_local {
            node_id.unwrap()
        } else {
            if to_addr.is_none() {
                // resolve the destination address for a known remote node,
                // preferring the current tree state
                let Some(nid) = node_id else {
                    return false;
                };
                let Some(addrs) = self.inverse_routes.get(&nid) else {
                    return false;
                };
                let current_state = self.current_addr().map(|a| a.tree_state);
                to_addr = addrs
                    .iter()
                    .find(|a| Some(a.tree_state) == current_state)
                    .or_else(|| addrs.front())
                    .cloned();
                if to_addr.is_none() {
                    return false;
                }
            }
            match self.next_hop(to_addr.as_ref().unwrap(), metric) {
                Some((peer_id, _)) => peer_id,
                None => return false,
            }
        };

        let pkg = Package::from_blob(app_id, blob).encode();

        // a schema every interface of the chosen peer understands
        let pairs = match self.peers.get(&peer_id) {
            Some(peer) => peer.interfaces.clone(),
            None => return false,
        };
        let mut sids: Option<HashSet<u8>> = None;
        for (_, intrfc_id) in &pairs {
            if let Some(idx) = self.interface_index(intrfc_id) {
                let set: HashSet<u8> =
                    self.interfaces[idx].supported_schemas.iter().copied().collect();
                sids = Some(match sids {
                    None => set,
                    Some(prev) => prev.intersection(&set).copied().collect(),
                });
            }
        }
        let Some(mut sids) = sids else {
            return false;
        };
        if !is_local {
            let routable: HashSet<u8> = routing_schema_ids().into_iter().collect();
            sids.retain(|s| routable.contains(s));
        }
        let Some(schema) = best_schema(&sids, pkg.len()) else {
            return false;
        };

        // the peer's fastest interface
        let mut best: Option<(Bytes, InterfaceId, u32)> = None;
        for (mac, intrfc_id) in &pairs {
            if let Some(idx) = self.interface_index(intrfc_id) {
                let bitrate = self.interfaces[idx].bitrate;
                if best.as_ref().map_or(true, |(_, _, b)| bitrate > *b) {
                    best = Some((mac.clone(), *intrfc_id, bitrate));
                }
            }
        }
        let Some((mac, intrfc_id, _)) = best else {
            return false;
        };

        let mut template = Packet::new(schema, Flags::default());
        if !is_local {
            let dest = to_addr.clone().unwrap();
            let Some(from) = self.current_addr() else {
                return false;
            };
            template.set("to_addr", Bytes::copy_from_slice(&dest.address));
            template.set("from_addr", Bytes::copy_from_slice(&from.address));
            template.set("tree_state", dest.tree_state);
            template.set("ttl", 255u8);
        }

        if pkg.len() > schema.max_body() {
            // fragment; loss is recovered via the receiver's RTX requests
            let Ok(seq) = Sequence::for_blob(schema, self.seq_id, &pkg) else {
                return false;
            };
            for i in 0..seq.seq_size as u16 {
                if let Some(p) = seq.get_packet(i, Flags::default(), &template) {
                    if let Ok(wire) = p.encode() {
                        self.send_datagram(
                            Datagram::new(wire, intrfc_id, Some(mac.clone())),
                            &peer_id,
                        );
                    }
                }
            }
            let now = self.now();
            self.seq_cache.add(self.seq_id, seq, TX_CACHE_TTL_S, now);
            self.seq_id = self.seq_id.wrapping_add(1);
        } else {
            // single packet: demand an ACK and arm a retry
            let mut p = template;
            p.flags.set_control(Control::Ask);
            p.set_id(self.packet_id as u16);
            p.set("seq_id", self.seq_id);
            p.set("seq_size", 0u8);
            p.set_body(pkg);
            if schema.has_checksum() {
                let _ = p.set_checksum();
            }
            let Ok(wire) = p.encode() else {
                return false;
            };
            self.send_datagram(Datagram::new(wire, intrfc_id, Some(mac)), &peer_id);
            let now = self.now();
            let pid = self.packet_id;
            self.packet_cache.add(pid, p, TX_CACHE_TTL_S, now);
            self.queue_event(Event::new(
                now + SEND_RETRY_DELAY_MS,
                retry_event_id(pid),
                EventKind::RetrySend { packet_id: pid, retries, node_id, to_addr, metric },
            ));
            self.packet_id = self.packet_id.wrapping_add(1);
        }
        true
    }

    /// Re-send a cached unacknowledged packet. Fired by the RP event; each
    /// attempt re-enters `send`, which arms the next retry.
    fn retry_send(
        &mut self,
        packet_id: u8,
        retries: u8,
        node_id: Option<NodeId>,
        to_addr: Option<Address>,
        metric: Metric,
    ) {
        if retries == 0 {
            return;
        }
        let now = self.now();
        let Some(cached) = self.packet_cache.get(&packet_id, now) else {
            return;
        };
        let body = cached.body();
        if node_id.is_none() && to_addr.is_none() {
            return;
        }
        let Ok(pkg) = Package::decode(&body) else {
            return;
        };
        tracing::debug!(packet_id, retries, "retrying unacknowledged packet");
        self.send(pkg.app_id, pkg.blob, node_id, to_addr, metric, retries - 1);
    }

    // ── Outbound: low-level ───────────────────────────────────────────────────

    /// Best (MAC, interface) pair for reaching a node: directly when it is
    /// a peer, else via the next hop toward an address.
    fn get_interface(
        &self,
        node_id: Option<&NodeId>,
        to_addr: Option<&Address>,
        exclude: &[NodeId],
        metric: Metric,
    ) -> Option<(Bytes, InterfaceId, NodeId)> {
        let mut to_addr = to_addr.cloned();
        if let Some(nid) = node_id {
            if self.peers.contains_key(nid) && !exclude.contains(nid) {
                let peer = self.peers.get(nid)?;
                let (mac, intrfc_id) = self.best_pair(peer)?;
                return Some((mac, intrfc_id, *nid));
            }
            if let Some(addrs) = self.inverse_routes.get(nid) {
                let current_state = self.current_addr().map(|a| a.tree_state);
                to_addr = addrs
                    .iter()
                    .find(|a| Some(a.tree_state) == current_state)
                    .or_else(|| addrs.front())
                    .cloned();
            }
        }
        let to_addr = to_addr?;
        let (peer_id, _) = self.next_hop(&to_addr, metric)?;
        if exclude.contains(&peer_id) {
            return None;
        }
        let peer = self.peers.get(&peer_id)?;
        let (mac, intrfc_id) = self.best_pair(peer)?;
        Some((mac, intrfc_id, peer_id))
    }

    fn best_pair(&self, peer: &Peer) -> Option<(Bytes, InterfaceId)> {
        let mut best: Option<(Bytes, InterfaceId, u32)> = None;
        for (mac, intrfc_id) in &peer.interfaces {
            if let Some(idx) = self.interface_index(intrfc_id) {
                let bitrate = self.interfaces[idx].bitrate;
                if best.as_ref().map_or(true, |(_, _, b)| bitrate > *b) {
                    best = Some((mac.clone(), *intrfc_id, bitrate));
                }
            }
        }
        best.map(|(mac, id, _)| (mac, id))
    }

    /// Hand a datagram to its interface — or, when the peer is outside its
    /// transmit window, park it and start the RNS handshake instead.
    fn send_datagram(&mut self, datagram: Datagram, peer_id: &NodeId) {
        self.sleepskip_push();
        let Some(idx) = datagram.intrfc_id.and_then(|id| self.interface_index(&id)) else {
            return;
        };
        let now = self.now();
        let can_tx = self.peers.get(peer_id).map_or(true, |p| p.can_tx(now));
        if can_tx {
            self.interfaces[idx].send(datagram);
        } else {
            let intrfc_id = self.interfaces[idx].id;
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.enqueue(datagram);
            }
            self.rns(*peer_id, intrfc_id, MODEM_INTERSECT_RTX_TIMES);
        }
    }

    /// Probe a sleeping peer with an RNS control packet, rescheduling until
    /// the retry budget is spent. Duplicate probes are suppressed while one
    /// is pending.
    pub fn rns(&mut self, peer_id: NodeId, intrfc_id: InterfaceId, retries: u8) {
        let event_id = rns_event_id(&peer_id, &intrfc_id);
        if self.has_scheduled(&event_id) {
            return;
        }
        if !self.peers.contains_key(&peer_id) {
            return;
        }
        if retries < 1 {
            // the peer never answered; drop whatever was waiting on it
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.queue.clear();
            }
            return;
        }
        let now = self.now();
        self.queue_event(Event::new(
            now + MODEM_INTERSECT_INTERVAL_MS,
            event_id,
            EventKind::Rns { peer_id, intrfc_id, retries: retries - 1 },
        ));

        let Some(idx) = self.interface_index(&intrfc_id) else {
            return;
        };
        let mac = self
            .peers
            .get(&peer_id)
            .and_then(|p| p.interfaces.iter().find(|(_, i)| *i == intrfc_id))
            .map(|(mac, _)| mac.clone());
        let Some(mac) = mac else {
            return;
        };
        let mut flags = Flags::default();
        flags.set_control(Control::Rns);
        let mut p = Packet::new(self.interfaces[idx].default_schema(), flags);
        p.set_id(self.packet_id as u16);
        p.set_body(Bytes::new());
        if p.schema.has_checksum() {
            let _ = p.set_checksum();
        }
        if let Ok(wire) = p.encode() {
            self.interfaces[idx].send(Datagram::new(wire, intrfc_id, Some(mac)));
        }
        self.packet_id = self.packet_id.wrapping_add(1);
        self.notify(HookEvent::RnsSent(peer_id));
    }

    /// Send a packet to a specific node, or forward it along its addresses
    /// when acting as an intermediate hop. Handles ttl accounting and
    /// error reversal. Returns false when the packet cannot progress.
    pub fn send_packet(&mut self, packet: &mut Packet, node_id: Option<NodeId>) -> bool {
        let known = node_id.map_or(false, |n| {
            self.peers.contains_key(&n) || self.inverse_routes.contains_key(&n)
        });
        let target = if known {
            self.get_interface(node_id.as_ref(), None, &[], Metric::Tree)
        } else if packet.to_addr().is_some() && packet.from_addr().is_some() {
            // intermediate hop
            let metric = if packet.flags.mode() { Metric::Cpl } else { Metric::Tree };
            let tree_state = packet.tree_state().unwrap_or(0);
            let to_addr = Address::from_bytes(tree_state, packet.to_addr().unwrap());
            let from_addr = Address::from_bytes(tree_state, packet.from_addr().unwrap());

            if packet.ttl().is_none() {
                // relay schema: reachability decides reversal
                let to_reachable = self
                    .routes
                    .get(&to_addr)
                    .map_or(false, |n| self.peers.contains_key(n));
                let from_reachable = self
                    .routes
                    .get(&from_addr)
                    .map_or(false, |n| self.peers.contains_key(n));
                match relay_action(to_reachable, from_reachable, packet.flags.error()) {
                    RelayAction::Deliverable => {}
                    RelayAction::SetError => packet.flags.set_error(true),
                    RelayAction::Drop => return false,
                }
            }

            let target = if packet.flags.error() {
                let exclude: Vec<NodeId> = self.routes.get(&to_addr).copied().into_iter().collect();
                self.get_interface(None, Some(&from_addr), &exclude, metric)
            } else {
                let exclude: Vec<NodeId> =
                    self.routes.get(&from_addr).copied().into_iter().collect();
                self.get_interface(None, Some(&to_addr), &exclude, metric)
            };

            if let Some(ttl) = packet.ttl() {
                let next_ttl = if packet.flags.error() { ttl as i16 + 1 } else { ttl as i16 - 1 };
                if next_ttl <= 0 && !packet.flags.error() {
                    return false;
                }
                if next_ttl >= 255 && packet.flags.error() {
                    return false;
                }
                packet.set("ttl", next_ttl as u8);
            }
            target
        } else {
            return false;
        };

        let Some((mac, intrfc_id, peer_id)) = target else {
            return false;
        };
        let Ok(wire) = packet.encode() else {
            return false;
        };
        self.send_datagram(Datagram::new(wire, intrfc_id, Some(mac)), &peer_id);
        true
    }

    // ── Sequences: RTX ────────────────────────────────────────────────────────

    /// Request retransmission of an inbound sequence's missing fragments,
    /// decrementing its retry budget and rescheduling. The reassembly is
    /// abandoned when the budget runs out or the source became unroutable.
    pub fn sync_sequence(&mut self, seq_id: u8) {
        let Some(entry) = self.in_seqs.get(&seq_id) else {
            return;
        };
        if entry.retry == 0 {
            tracing::debug!(seq_id, "abandoning reassembly, source unresponsive");
            self.in_seqs.remove(&seq_id);
            return;
        }
        let schema = entry.seq.schema;
        let wire_seq_size = (entry.seq.seq_size - 1) as u16;
        let src = entry.src.clone();
        let missing = entry.seq.get_missing();

        let mut flags = Flags::default();
        flags.set_control(Control::Rtx);
        let mut template = Packet::new(schema, flags);
        template.set("seq_id", seq_id);
        match schema.field("seq_size") {
            Some(f) if f.len == 2 => template.set("seq_size", wire_seq_size),
            _ => template.set("seq_size", wire_seq_size as u8),
        };
        template.set_body(Bytes::new());

        let src_node = match &src {
            SeqSource::Neighbor(n) => Some(*n),
            SeqSource::Remote(addr) => {
                let from = self
                    .node_addrs
                    .iter()
                    .find(|a| a.tree_state == addr.tree_state)
                    .cloned();
                let Some(from) = from else {
                    // tree state moved on; the source address is meaningless
                    tracing::debug!(seq_id, "abandoning reassembly, tree state changed");
                    self.in_seqs.remove(&seq_id);
                    return;
                };
                template.set("to_addr", Bytes::copy_from_slice(&addr.address));
                template.set("from_addr", Bytes::copy_from_slice(&from.address));
                template.set("tree_state", addr.tree_state);
                if schema.has("ttl") {
                    template.set("ttl", 255u8);
                }
                self.routes.get(addr).copied()
            }
            SeqSource::Unknown => None,
        };

        for index in missing {
            let mut p = template.clone();
            p.set_id(index);
            if schema.has_checksum() {
                let _ = p.set_checksum();
            }
            self.send_packet(&mut p, src_node);
        }

        if let Some(entry) = self.in_seqs.get_mut(&seq_id) {
            entry.retry -= 1;
        }
        let now = self.now();
        self.queue_event(Event::new(
            now + SEQ_SYNC_DELAY_MS,
            seq_sync_event_id(seq_id),
            EventKind::SyncSequence { seq_id },
        ));
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn send_ack(&mut self, p: &Packet, src: Option<NodeId>) {
        let mut flags = p.flags;
        flags.set_control(Control::Ack);
        let mut ack = Packet::new(p.schema, flags);
        ack.set_id(p.id());
        ack.set_body(Bytes::new());
        if let (Some(to), Some(from)) = (p.to_addr(), p.from_addr()) {
            ack.set("to_addr", Bytes::copy_from_slice(&from));
            ack.set("from_addr", Bytes::copy_from_slice(&to));
            ack.set("tree_state", p.tree_state().unwrap_or(0));
        }
        if p.ttl().is_some() {
            ack.set("ttl", 255u8);
        }
        if let Some(seq_id) = p.seq_id() {
            ack.set("seq_id", seq_id);
            match p.schema.field("seq_size") {
                Some(f) if f.len == 2 => ack.set("seq_size", p.seq_size().unwrap_or(0)),
                _ => ack.set("seq_size", p.seq_size().unwrap_or(0) as u8),
            };
        }
        if ack.schema.has_checksum() {
            let _ = ack.set_checksum();
        }
        self.send_packet(&mut ack, src);
    }

    /// Handle one decoded inbound packet: forward it if it is routable and
    /// not ours, honor control flags, reassemble sequences, and deliver.
    pub fn receive(&mut self, mut p: Packet, intrfc_id: InterfaceId, mac: Bytes) {
        self.sleepskip_push();

        if !p.checksum_ok() {
            tracing::trace!(schema = p.schema.id, "dropping packet with bad checksum");
            return;
        }

        if let Some(to) = p.to_addr() {
            let addr = Address::from_bytes(p.tree_state().unwrap_or(0), to);
            if !self.is_local_addr(&addr) {
                if p.flags.error() {
                    if let Some(from) = p.from_addr() {
                        let origin = Address::from_bytes(p.tree_state().unwrap_or(0), from);
                        if self.is_local_addr(&origin) {
                            // our own packet, reversed back: the destination
                            // was unreachable. Surface it to the application.
                            tracing::debug!(dest = %addr, "packet returned undeliverable");
                            if let Ok(pkg) = Package::decode(&p.body()) {
                                self.deliver(pkg, intrfc_id, mac);
                            }
                            return;
                        }
                    }
                }
                self.send_packet(&mut p, None);
                return;
            }
        }

        let src = self.peer_for_mac(&mac, &intrfc_id);
        if let Some(src) = src {
            let now = self.now();
            if let Some(peer) = self.peers.get_mut(&src) {
                peer.last_rx = now;
            }
        }

        if p.flags.ack() {
            // acknowledgment for a single packet (fragment ACKs carry the
            // same shape and cancel nothing)
            self.cancel_event(retry_event_id(p.id() as u8));
            return;
        }

        let seq_count = p.seq_size().map(|s| s as usize + 1).unwrap_or(1);
        if p.seq_id().is_some() && !p.flags.rtx() && seq_count > 1 {
            self.receive_fragment(&p, src, intrfc_id, mac);
            return;
        }

        if p.seq_id().is_some() && p.flags.rtx() {
            // fragment retransmission request against our cached sequence
            let seq_id = p.seq_id().unwrap();
            let now = self.now();
            let Some(seq) = self.seq_cache.get(&seq_id, now).cloned() else {
                return;
            };
            let mut template = Packet::new(seq.schema, Flags::default());
            if let (Some(to), Some(from)) = (p.to_addr(), p.from_addr()) {
                template.set("to_addr", Bytes::copy_from_slice(&from));
                template.set("from_addr", Bytes::copy_from_slice(&to));
                template.set("tree_state", p.tree_state().unwrap_or(0));
                if seq.schema.has("ttl") {
                    template.set("ttl", 255u8);
                }
            }
            if let Some(mut fragment) = seq.get_packet(p.id(), Flags::default(), &template) {
                self.send_packet(&mut fragment, src);
            }
            return;
        }

        if p.flags.rtx() {
            // retransmission request for a cached single packet
            let pid = p.id() as u8;
            let now = self.now();
            if let Some(mut cached) = self.packet_cache.get(&pid, now).cloned() {
                self.send_packet(&mut cached, src);
            }
            return;
        }

        if p.flags.nia() {
            // peer answered our RNS: cancel the probe, it is awake
            if let Some(src) = src {
                self.cancel_event(rns_event_id(&src, &intrfc_id));
                let now = self.now();
                if let Some(peer) = self.peers.get_mut(&src) {
                    peer.last_rx = now;
                }
            }
            return;
        }

        if p.flags.rns() {
            // peer probing us before transmitting: answer on the same link
            if src.is_some() {
                let Some(idx) = self.interface_index(&intrfc_id) else {
                    return;
                };
                let mut flags = Flags::default();
                flags.set_control(Control::Nia);
                let mut nia = Packet::new(self.interfaces[idx].default_schema(), flags);
                nia.set_id(self.packet_id as u16);
                nia.set_body(Bytes::new());
                if nia.schema.has_checksum() {
                    let _ = nia.set_checksum();
                }
                if let Ok(wire) = nia.encode() {
                    self.interfaces[idx].send(Datagram::new(wire, intrfc_id, Some(mac)));
                }
                self.packet_id = self.packet_id.wrapping_add(1);
            }
            return;
        }

        if p.flags.ask() {
            self.send_ack(&p, src);
        }

        if let Ok(pkg) = Package::decode(&p.body()) {
            self.deliver(pkg, intrfc_id, mac);
        }
    }

    /// Fold one fragment into its reassembly, delivering on completion or
    /// (re)arming the sequence-sync timer.
    fn receive_fragment(&mut self, p: &Packet, src: Option<NodeId>, intrfc_id: InterfaceId, mac: Bytes) {
        let seq_id = p.seq_id().unwrap();
        let event_id = seq_sync_event_id(seq_id);
        self.cancel_event(event_id.clone());

        if !self.in_seqs.contains_key(&seq_id) {
            let Ok(seq) = Sequence::for_incoming(p.schema, seq_id, p.seq_size().unwrap_or(0))
            else {
                return;
            };
            let seq_src = if let Some(from) = p.from_addr() {
                let addr = Address::from_bytes(p.tree_state().unwrap_or(0), from);
                match self.routes.get(&addr) {
                    Some(n) if self.peers.contains_key(n) => SeqSource::Neighbor(*n),
                    _ => SeqSource::Remote(addr),
                }
            } else if let Some(src) = src {
                SeqSource::Neighbor(src)
            } else {
                SeqSource::Unknown
            };
            self.in_seqs
                .insert(seq_id, InSequence { seq, src: seq_src, retry: IN_SEQ_RETRIES, intrfc_id });
        }

        let entry = self.in_seqs.get_mut(&seq_id).unwrap();
        entry.retry = IN_SEQ_RETRIES; // the source is evidently reachable
        let complete = match entry.seq.add_packet(p) {
            Ok(done) => done,
            Err(_) => {
                // fragment incoherent with the declared geometry
                self.in_seqs.remove(&seq_id);
                return;
            }
        };

        if complete {
            let entry = self.in_seqs.remove(&seq_id).unwrap();
            if let Ok(pkg) = Package::decode(entry.seq.data()) {
                self.deliver(pkg, intrfc_id, mac.clone());
            }
        } else {
            let now = self.now();
            self.queue_event(Event::new(
                now + SEQ_SYNC_DELAY_MS,
                event_id,
                EventKind::SyncSequence { seq_id },
            ));
        }

        if p.flags.ask() {
            self.send_ack(p, src);
        }
    }

    /// Validate and dispatch a Package to its application. Digest or
    /// registry misses are silent (observable through hooks only).
    pub fn deliver(&mut self, pkg: Package, intrfc_id: InterfaceId, mac: Bytes) -> bool {
        if !pkg.verify() || !self.apps.contains_key(&pkg.app_id) {
            self.notify(HookEvent::DeliverFailed(pkg.app_id));
            return false;
        }
        self.dispatch_to_app(pkg.app_id, pkg.blob, intrfc_id, mac)
    }

    // ── Scheduler ─────────────────────────────────────────────────────────────

    fn dispatch_event(&mut self, kind: EventKind) {
        match kind {
            EventKind::RetrySend { packet_id, retries, node_id, to_addr, metric } => {
                self.retry_send(packet_id, retries, node_id, to_addr, metric);
            }
            EventKind::SyncSequence { seq_id } => self.sync_sequence(seq_id),
            EventKind::Rns { peer_id, intrfc_id, retries } => {
                self.rns(peer_id, intrfc_id, retries);
            }
            EventKind::TimeoutPeers { interval_ms } => {
                self.timeout_peers();
                if interval_ms > 0 {
                    let now = self.now();
                    self.queue_event(Event::new(
                        now + interval_ms,
                        Bytes::from_static(b"timeout_peers"),
                        EventKind::TimeoutPeers { interval_ms },
                    ));
                }
            }
            EventKind::App { app_id, event } => {
                if let Some(mut app) = self.apps.remove(&app_id) {
                    let future = app.on_event(self, event);
                    self.apps.entry(app_id).or_insert(app);
                    if let Some(future) = future {
                        self.pending.push(future);
                    }
                }
            }
        }
    }

    /// One scheduler tick: admit and cancel events, run the interfaces,
    /// decode and dispatch everything received, fire due events, and flush
    /// queues for peers that are awake.
    pub async fn process(&mut self) {
        // admit queued events (same id overwrites), then apply cancellations
        while let Some(event) = self.new_events.pop_front() {
            self.schedule.insert(event.id.clone(), event);
        }
        while let Some(id) = self.cancel_events.pop_front() {
            self.schedule.remove(&id);
        }

        // drive every interface's driver concurrently
        futures::future::join_all(self.interfaces.iter_mut().map(|i| i.process())).await;

        // drain inboxes; a malformed datagram must not kill the worker
        let mut idx = 0;
        while idx < self.interfaces.len() {
            let intrfc_id = self.interfaces[idx].id;
            loop {
                if idx >= self.interfaces.len() {
                    break;
                }
                let Some(datagram) = self.interfaces[idx].receive() else {
                    break;
                };
                let mac = datagram.addr.clone().unwrap_or_default();
                match Packet::decode(&datagram.data) {
                    Ok(p) => self.receive(p, intrfc_id, mac),
                    Err(e) => tracing::trace!(error = %e, "dropping malformed datagram"),
                }
            }
            idx += 1;
        }

        // fire due events
        let now = self.now();
        let due: Vec<Bytes> = self
            .schedule
            .iter()
            .filter(|(_, e)| e.ts <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            if let Some(event) = self.schedule.remove(&id) {
                self.dispatch_event(event.kind);
            }
        }

        // await any suspended application callbacks
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            futures::future::join_all(pending).await;
        }

        // flush parked datagrams for peers inside their transmit window
        let now = self.now();
        let ready: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.can_tx(now) && !p.queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for peer_id in ready {
            let datagrams: Vec<Datagram> = match self.peers.get_mut(&peer_id) {
                Some(peer) => peer.queue.drain(..).collect(),
                None => continue,
            };
            for d in datagrams {
                if let Some(idx) = d.intrfc_id.and_then(|id| self.interface_index(&id)) {
                    self.interfaces[idx].send(d);
                }
            }
        }
    }

    /// A handle that can stop the work loop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { running: self.running.clone() }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The cooperative work loop: `process` then sleep, with optional modem
    /// sleep once the node has been awake for `wake_ms`. Recent I/O posts
    /// sleepskip tokens; each token skips one sleep cycle so traffic
    /// bursts are not interrupted.
    pub async fn work(
        &mut self,
        interval_ms: u64,
        use_modem_sleep: bool,
        modem_sleep_ms: u64,
        modem_wake_ms: u64,
    ) {
        self.running.store(true, Ordering::Relaxed);
        let mut awake_since = self.now();
        while self.running.load(Ordering::Relaxed) {
            self.process().await;
            tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
            if use_modem_sleep && self.now() - awake_since > modem_wake_ms {
                if self.sleepskip.pop_front().is_some() {
                    self.notify(HookEvent::SleepSkip);
                } else {
                    self.notify(HookEvent::ModemSleep);
                    (self.lightsleep)(modem_sleep_ms);
                    for interface in &mut self.interfaces {
                        interface.wake();
                    }
                }
                awake_since = self.now();
            }
        }
    }

    /// `work` with the platform's default modem timings.
    pub async fn work_default(&mut self, interval_ms: u64, use_modem_sleep: bool) {
        self.work(interval_ms, use_modem_sleep, MODEM_SLEEP_MS, MODEM_WAKE_MS).await;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Default retry budget, exposed so callers can spell `send(...)` with
    /// the standard arguments.
    pub fn default_retries() -> u8 {
        SEND_RETRY_COUNT
    }
}

/// The capable schema with the largest body, or None.
fn best_schema(sids: &HashSet<u8>, payload_len: usize) -> Option<&'static Schema> {
    let ids: Vec<u8> = sids.iter().copied().collect();
    let mut schemas: Vec<&'static Schema> = get_schemas(&ids)
        .into_iter()
        .filter(|s| s.max_blob() >= payload_len)
        .collect();
    schemas.sort_by(|a, b| b.max_body().cmp(&a.max_body()));
    schemas.first().copied()
}
