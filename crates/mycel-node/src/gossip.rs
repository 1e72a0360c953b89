//! Gossip overlay — topic-scoped dissemination with pull-based anti-entropy.
//!
//! Small messages flood by re-broadcast; large messages are announced by id
//! (NOTIFY) and pulled on demand (REQUEST → PUBLISH/RESPOND). Periodic
//! REQUEST_IDS sweeps reconcile caches with every peer, and a new peer is
//! swept immediately. Message identity is `sha256(serialized)[0:16]`, which
//! also provides the dedup set.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use mycel_core::address::Metric;
use mycel_core::ident::{AppId, InterfaceId, NodeId};
use mycel_core::TtlCache;

use crate::app::{AppError, AppFuture, AppMeta, Application};
use crate::event::{AppEvent, Event, EventKind};
use crate::packager::Packager;

/// Largest payload that floods as a plain re-broadcast: the LoRa MTU minus
/// the gossip header (op + topic) and the Package header.
pub const SIMPLE_GOSSIP_MAX: usize = 235 - 17 - 32;

/// Seen-id ring: bounds the dedup memory.
const SEEN_CAP: usize = 100;
const MESSAGE_CACHE_SIZE: usize = 100;
/// Cached messages answer pulls for this long.
const MESSAGE_TTL_S: u64 = 300;

pub mod op {
    pub const REQUEST: u8 = 0;
    pub const REQUEST_IDS: u8 = 1;
    pub const NOTIFY: u8 = 15;
    pub const PUBLISH: u8 = 240;
    pub const RESPOND: u8 = 254;
    pub const RESPOND_IDS: u8 = 255;
}

mod tag {
    pub const SYNC_ALL: u8 = 0;
    pub const REQUEST_IDS: u8 = 1;
    pub const ECHO_BROADCAST: u8 = 2;
    pub const ECHO_NOTIFY: u8 = 3;
    pub const ECHO_REQUEST: u8 = 4;
    pub const ECHO_RESPOND: u8 = 5;
}

/// One gossip frame: `op:u8 || topic_id:16 || data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub op: u8,
    pub topic_id: [u8; 16],
    pub data: Bytes,
}

impl GossipMessage {
    pub fn new(op: u8, topic_id: [u8; 16], data: Bytes) -> Self {
        GossipMessage { op, topic_id, data }
    }

    pub fn serialize(&self) -> Bytes {
        let mut out = Vec::with_capacity(17 + self.data.len());
        out.push(self.op);
        out.extend_from_slice(&self.topic_id);
        out.extend_from_slice(&self.data);
        Bytes::from(out)
    }

    pub fn deserialize(blob: &[u8]) -> Option<Self> {
        if blob.len() < 17 {
            return None;
        }
        Some(GossipMessage {
            op: blob[0],
            topic_id: blob[1..17].try_into().unwrap(),
            data: Bytes::copy_from_slice(&blob[17..]),
        })
    }

    /// Message identity and dedup key.
    pub fn id(&self) -> [u8; 16] {
        let digest = Sha256::digest(self.serialize());
        digest[..16].try_into().unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct GossipParams {
    /// Delay before the first anti-entropy sweep, seconds.
    pub start_delay_s: u64,
    /// Cadence of the per-peer REQUEST_IDS sweep, seconds.
    pub sync_interval_s: u64,
    /// Delay before a message's single echo repeat, milliseconds.
    pub echo_delay_ms: u64,
}

impl Default for GossipParams {
    fn default() -> Self {
        GossipParams { start_delay_s: 10, sync_interval_s: 20, echo_delay_ms: 20 }
    }
}

/// The gossip overlay application.
pub struct Gossip {
    meta: AppMeta,
    params: GossipParams,
    subscriptions: HashMap<[u8; 16], Vec<AppId>>,
    seen: VecDeque<[u8; 16]>,
    cache: TtlCache<[u8; 16], GossipMessage>,
}

impl Gossip {
    pub fn new() -> Self {
        Gossip::with_params(GossipParams::default())
    }

    pub fn with_params(params: GossipParams) -> Self {
        Gossip {
            meta: AppMeta::new(
                "Gossip",
                "Topic-scoped gossip overlay with pull-based anti-entropy",
                0,
            ),
            params,
            subscriptions: HashMap::new(),
            seen: VecDeque::with_capacity(SEEN_CAP),
            cache: TtlCache::new(MESSAGE_CACHE_SIZE),
        }
    }

    /// The deterministic app id every node derives for this overlay.
    pub fn app_id() -> AppId {
        AppMeta::new("Gossip", "Topic-scoped gossip overlay with pull-based anti-entropy", 0).id
    }

    /// Register interest: packages for `topic_id` go to `app_id`.
    pub fn subscribe(&mut self, topic_id: [u8; 16], app_id: AppId) {
        let apps = self.subscriptions.entry(topic_id).or_default();
        if !apps.contains(&app_id) {
            apps.push(app_id);
        }
    }

    pub fn unsubscribe(&mut self, topic_id: [u8; 16], app_id: &AppId) {
        if let Some(apps) = self.subscriptions.get_mut(&topic_id) {
            apps.retain(|a| a != app_id);
            if apps.is_empty() {
                self.subscriptions.remove(&topic_id);
            }
        }
    }

    pub fn subscriptions(&self) -> &HashMap<[u8; 16], Vec<AppId>> {
        &self.subscriptions
    }

    /// Cached messages for a topic (operator/debug surface).
    pub fn messages(&self, topic_id: &[u8; 16]) -> Vec<GossipMessage> {
        self.cache
            .iter()
            .filter(|(_, gm)| &gm.topic_id == topic_id)
            .map(|(_, gm)| gm.clone())
            .collect()
    }

    pub fn has_seen(&self, gm_id: &[u8; 16]) -> bool {
        self.seen.contains(gm_id)
    }

    /// Begin the periodic anti-entropy sweep.
    pub fn start(&mut self, node: &mut Packager) {
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.start_delay_s * 1000,
            Bytes::copy_from_slice(&self.meta.id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::SYNC_ALL, data: Bytes::new() },
            },
        ));
    }

    pub fn stop(&mut self, node: &mut Packager) {
        node.cancel_event(Bytes::copy_from_slice(&self.meta.id));
    }

    /// Publish a message on a topic: deliver locally, then flood or notify.
    pub fn publish(&mut self, node: &mut Packager, topic_id: [u8; 16], data: Bytes) {
        self.deliver(node, GossipMessage::new(op::PUBLISH, topic_id, data));
    }

    /// Local delivery plus onward dissemination for an accepted message.
    fn deliver(&mut self, node: &mut Packager, gm: GossipMessage) {
        let gm_id = gm.id();
        if self.seen.contains(&gm_id) {
            return;
        }
        if gm.op == op::PUBLISH || gm.op == op::RESPOND {
            if self.seen.len() >= SEEN_CAP {
                self.seen.pop_front();
            }
            self.seen.push_back(gm_id);
            let now = node.now();
            self.cache.add(gm_id, gm.clone(), MESSAGE_TTL_S, now);
        }

        if let Some(apps) = self.subscriptions.get(&gm.topic_id) {
            let loopback = node.loopback_id();
            let mac = Bytes::copy_from_slice(&self.meta.id);
            for app_id in apps.clone() {
                node.dispatch_to_app(app_id, gm.data.clone(), loopback, mac.clone());
            }
        }

        if gm.op == op::RESPOND && gm.data.len() <= SIMPLE_GOSSIP_MAX {
            // a point answer to a pull, not new information
            return;
        }
        if gm.data.len() > SIMPLE_GOSSIP_MAX {
            self.notify(node, gm.topic_id, gm_id, 1);
        } else {
            self.broadcast_message(node, &gm, 1);
        }
    }

    /// Broadcast a message, echoing once after a short delay.
    fn broadcast_message(&mut self, node: &mut Packager, gm: &GossipMessage, count: u8) {
        let wire = gm.serialize();
        node.broadcast(self.meta.id, wire.clone(), None);
        if count == 0 {
            return;
        }
        let mut event_id = vec![b'b'];
        event_id.extend_from_slice(&gm.id());
        let mut data = vec![count - 1];
        data.extend_from_slice(&wire);
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.echo_delay_ms,
            Bytes::from(event_id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::ECHO_BROADCAST, data: Bytes::from(data) },
            },
        ));
    }

    /// Announce a large message by id so interested peers can pull it.
    fn notify(&mut self, node: &mut Packager, topic_id: [u8; 16], gm_id: [u8; 16], count: u8) {
        let gm = GossipMessage::new(op::NOTIFY, topic_id, Bytes::copy_from_slice(&gm_id));
        node.broadcast(self.meta.id, gm.serialize(), None);
        if count == 0 {
            return;
        }
        let mut event_id = vec![b'n'];
        event_id.extend_from_slice(&gm.id());
        let mut data = vec![count - 1];
        data.extend_from_slice(&topic_id);
        data.extend_from_slice(&gm_id);
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.echo_delay_ms,
            Bytes::from(event_id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::ECHO_NOTIFY, data: Bytes::from(data) },
            },
        ));
    }

    /// Pull a message by id from a specific peer.
    fn request_message(&mut self, node: &mut Packager, msg_id: [u8; 16], peer_id: NodeId, count: u8) {
        let gm = GossipMessage::new(op::REQUEST, msg_id, Bytes::copy_from_slice(&node.node_id));
        node.send(self.meta.id, gm.serialize(), Some(peer_id), None, Metric::Tree, 3);
        if count == 0 {
            return;
        }
        let mut event_id = vec![b'q'];
        event_id.extend_from_slice(&gm.id());
        let mut data = vec![count - 1];
        data.extend_from_slice(&msg_id);
        data.extend_from_slice(&peer_id);
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.echo_delay_ms,
            Bytes::from(event_id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::ECHO_REQUEST, data: Bytes::from(data) },
            },
        ));
    }

    /// Answer a pull from our cache. Large messages go out verbatim (they
    /// keep flooding); small ones are wrapped as RESPOND so receivers do
    /// not re-broadcast a point answer.
    fn respond_request(&mut self, node: &mut Packager, peer_id: NodeId, gm_id: [u8; 16], count: u8) {
        let now = node.now();
        let Some(gm) = self.cache.get(&gm_id, now).cloned() else {
            return;
        };
        let out = if gm.data.len() > SIMPLE_GOSSIP_MAX {
            gm.clone()
        } else {
            GossipMessage::new(op::RESPOND, gm.topic_id, gm.data.clone())
        };
        node.send(self.meta.id, out.serialize(), Some(peer_id), None, Metric::Tree, 3);
        if count == 0 {
            return;
        }
        let mut event_id = vec![b'r'];
        event_id.extend_from_slice(&gm.id());
        let mut data = vec![count - 1];
        data.extend_from_slice(&peer_id);
        data.extend_from_slice(&gm_id);
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.echo_delay_ms,
            Bytes::from(event_id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::ECHO_RESPOND, data: Bytes::from(data) },
            },
        ));
    }

    /// Ask a peer for every message id it holds on a topic.
    pub fn request_ids(&mut self, node: &mut Packager, topic_id: [u8; 16], peer_id: NodeId) {
        let gm =
            GossipMessage::new(op::REQUEST_IDS, topic_id, Bytes::copy_from_slice(&node.node_id));
        node.send(self.meta.id, gm.serialize(), Some(peer_id), None, Metric::Tree, 3);
    }

    /// Answer a REQUEST_IDS with the ids we hold for the topic.
    fn respond_ids(&mut self, node: &mut Packager, peer_id: NodeId, topic_id: [u8; 16]) {
        let mut ids = Vec::new();
        for (gm_id, gm) in self.cache.iter() {
            if gm.topic_id == topic_id {
                ids.extend_from_slice(gm_id);
            }
        }
        let gm = GossipMessage::new(op::RESPOND_IDS, topic_id, Bytes::from(ids));
        node.send(self.meta.id, gm.serialize(), Some(peer_id), None, Metric::Tree, 3);
    }

    /// Sweep every peer for every subscribed topic, then reschedule.
    fn sync_all_peers(&mut self, node: &mut Packager) {
        let topics: Vec<[u8; 16]> = self.subscriptions.keys().copied().collect();
        for peer_id in node.peer_ids() {
            for topic in &topics {
                self.request_ids(node, *topic, peer_id);
            }
        }
        let now = node.now();
        node.queue_event(Event::new(
            now + self.params.sync_interval_s * 1000,
            Bytes::copy_from_slice(&self.meta.id),
            EventKind::App {
                app_id: self.meta.id,
                event: AppEvent { tag: tag::SYNC_ALL, data: Bytes::new() },
            },
        ));
    }

    fn node_id_from(data: &Bytes) -> Option<NodeId> {
        data.as_ref().try_into().ok()
    }
}

impl Default for Gossip {
    fn default() -> Self {
        Gossip::new()
    }
}

impl Application for Gossip {
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
        let Some(gm) = GossipMessage::deserialize(&blob) else {
            return Ok(None); // malformed; drop
        };
        let peer_id = node.peer_for_mac(&mac, &intrfc_id);
        match gm.op {
            op::REQUEST => {
                // topic_id carries the requested message id, data the requester
                if let Some(requester) = peer_id.or_else(|| Self::node_id_from(&gm.data)) {
                    self.respond_request(node, requester, gm.topic_id, 1);
                }
            }
            op::REQUEST_IDS => {
                if let Some(requester) = peer_id.or_else(|| Self::node_id_from(&gm.data)) {
                    self.respond_ids(node, requester, gm.topic_id);
                }
            }
            op::NOTIFY => {
                let now = node.now();
                if let Ok(gm_id) = <[u8; 16]>::try_from(gm.data.as_ref()) {
                    if self.cache.get(&gm_id, now).is_none() {
                        if let Some(peer_id) = peer_id {
                            self.request_message(node, gm_id, peer_id, 1);
                        }
                    }
                }
            }
            op::PUBLISH | op::RESPOND => self.deliver(node, gm),
            op::RESPOND_IDS => {
                let Some(peer_id) = peer_id else {
                    return Ok(None);
                };
                if gm.data.len() % 16 != 0 {
                    return Ok(None);
                }
                let unseen: Vec<[u8; 16]> = gm
                    .data
                    .chunks(16)
                    .map(|c| <[u8; 16]>::try_from(c).unwrap())
                    .filter(|id| !self.seen.contains(id))
                    .collect();
                for id in unseen {
                    self.request_message(node, id, peer_id, 1);
                }
            }
            other => {
                tracing::trace!(op = other, "unknown gossip op");
            }
        }
        Ok(None)
    }

    fn on_event(&mut self, node: &mut Packager, event: AppEvent) -> Option<AppFuture> {
        let data = event.data;
        match event.tag {
            tag::SYNC_ALL => self.sync_all_peers(node),
            tag::REQUEST_IDS if data.len() == 48 => {
                let topic: [u8; 16] = data[..16].try_into().unwrap();
                let peer: NodeId = data[16..48].try_into().unwrap();
                self.request_ids(node, topic, peer);
            }
            tag::ECHO_BROADCAST if data.len() >= 18 => {
                let count = data[0];
                if let Some(gm) = GossipMessage::deserialize(&data[1..]) {
                    self.broadcast_message(node, &gm, count);
                }
            }
            tag::ECHO_NOTIFY if data.len() == 33 => {
                let count = data[0];
                let topic: [u8; 16] = data[1..17].try_into().unwrap();
                let gm_id: [u8; 16] = data[17..33].try_into().unwrap();
                self.notify(node, topic, gm_id, count);
            }
            tag::ECHO_REQUEST if data.len() == 49 => {
                let count = data[0];
                let msg_id: [u8; 16] = data[1..17].try_into().unwrap();
                let peer: NodeId = data[17..49].try_into().unwrap();
                self.request_message(node, msg_id, peer, count);
            }
            tag::ECHO_RESPOND if data.len() == 49 => {
                let count = data[0];
                let peer: NodeId = data[1..33].try_into().unwrap();
                let gm_id: [u8; 16] = data[33..49].try_into().unwrap();
                self.respond_request(node, peer, gm_id, count);
            }
            _ => {}
        }
        None
    }

    /// Sweep a newly discovered peer right away instead of waiting for the
    /// periodic cadence.
    fn on_peer_added(&mut self, node: &mut Packager, peer_id: &NodeId) {
        for topic in self.subscriptions.keys() {
            let mut event_id = Vec::with_capacity(16);
            let mut h = Sha256::new();
            h.update(self.meta.id);
            h.update(topic);
            h.update(peer_id);
            event_id.extend_from_slice(&h.finalize()[..16]);

            let mut data = Vec::with_capacity(48);
            data.extend_from_slice(topic);
            data.extend_from_slice(peer_id);
            let now = node.now();
            node.queue_event(Event::new(
                now,
                Bytes::from(event_id),
                EventKind::App {
                    app_id: self.meta.id,
                    event: AppEvent { tag: tag::REQUEST_IDS, data: Bytes::from(data) },
                },
            ));
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
