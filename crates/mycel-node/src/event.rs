//! Scheduler events.
//!
//! Events are uniquely keyed by id; queueing an event with an existing id
//! overwrites the scheduled one at the start of the next tick. Handlers
//! for the transport's own events are a closed enum — only applications
//! get late-bound dispatch (via `EventKind::App`).

use bytes::Bytes;

use mycel_core::address::{Address, Metric};
use mycel_core::ident::{AppId, InterfaceId, NodeId};

/// Payload handed to `Application::on_event`. The tag namespace belongs to
/// the application that scheduled the event.
#[derive(Debug, Clone)]
pub struct AppEvent {
    pub tag: u8,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Re-send a cached unacknowledged packet.
    RetrySend {
        packet_id: u8,
        retries: u8,
        node_id: Option<NodeId>,
        to_addr: Option<Address>,
        metric: Metric,
    },
    /// Request retransmission of missing fragments for an inbound sequence.
    SyncSequence { seq_id: u8 },
    /// Re-probe a sleeping peer.
    Rns {
        peer_id: NodeId,
        intrfc_id: InterfaceId,
        retries: u8,
    },
    /// Tick every peer's timeout counter; reschedules itself when
    /// `interval_ms` is non-zero.
    TimeoutPeers { interval_ms: u64 },
    /// Late-bound application event.
    App { app_id: AppId, event: AppEvent },
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Fire-at timestamp, milliseconds on the node clock.
    pub ts: u64,
    pub id: Bytes,
    pub kind: EventKind,
}

impl Event {
    pub fn new(ts: u64, id: Bytes, kind: EventKind) -> Self {
        Event { ts, id, kind }
    }
}

/// Retry event id for a cached single packet: `RP ‖ packet_id`.
pub fn retry_event_id(packet_id: u8) -> Bytes {
    let mut id = Vec::with_capacity(3);
    id.extend_from_slice(b"RP");
    id.push(packet_id);
    Bytes::from(id)
}

/// Sequence-sync event id: `SS ‖ seq_id_be16`.
pub fn seq_sync_event_id(seq_id: u8) -> Bytes {
    let mut id = Vec::with_capacity(4);
    id.extend_from_slice(b"SS");
    id.extend_from_slice(&(seq_id as u16).to_be_bytes());
    Bytes::from(id)
}

/// RNS probe event id: `rns ‖ peer_id ‖ intrfc_id`.
pub fn rns_event_id(peer_id: &NodeId, intrfc_id: &InterfaceId) -> Bytes {
    let mut id = Vec::with_capacity(3 + 32 + 4);
    id.extend_from_slice(b"rns");
    id.extend_from_slice(peer_id);
    id.extend_from_slice(intrfc_id);
    Bytes::from(id)
}
