//! Direct-neighbor state.

use std::collections::VecDeque;

use bytes::Bytes;

use mycel_core::address::Address;
use mycel_core::ident::{InterfaceId, NodeId};

use crate::interface::Datagram;

/// Beacon cycles a silent peer survives before eviction.
pub const PEER_TIMEOUT_TICKS: u8 = 4;

/// A peer is assumed transmittable-to for this long after we last heard
/// from it; beyond that it may be modem-sleeping and needs an RNS.
pub const PEER_TX_WINDOW_MS: u64 = 800;

/// Pending datagrams parked while a peer sleeps.
pub const PEER_QUEUE_CAP: usize = 10;

/// One address per tree state, for at most two states (the present one and
/// the previous one during a transition).
pub const ADDR_CAP: usize = 2;

/// A neighbor reachable on at least one interface.
#[derive(Debug)]
pub struct Peer {
    pub id: NodeId,
    /// (MAC, interface id) pairs this peer answers on.
    pub interfaces: Vec<(Bytes, InterfaceId)>,
    pub addrs: VecDeque<Address>,
    pub timeout: u8,
    pub throttle: u8,
    /// Timestamp of the last reception attributed to this peer.
    pub last_rx: u64,
    pub queue: VecDeque<Datagram>,
}

impl Peer {
    pub fn new(id: NodeId, interfaces: Vec<(Bytes, InterfaceId)>, now_ms: u64) -> Self {
        Peer {
            id,
            interfaces,
            addrs: VecDeque::with_capacity(ADDR_CAP),
            timeout: PEER_TIMEOUT_TICKS,
            throttle: 0,
            last_rx: now_ms,
            queue: VecDeque::with_capacity(PEER_QUEUE_CAP),
        }
    }

    /// Record an address, replacing any prior address with the same tree
    /// state and keeping at most `ADDR_CAP` entries.
    pub fn set_addr(&mut self, addr: Address) {
        self.addrs.retain(|a| a.tree_state != addr.tree_state);
        while self.addrs.len() >= ADDR_CAP {
            self.addrs.pop_front();
        }
        self.addrs.push_back(addr);
    }

    /// True while the peer is inside its transmit window.
    pub fn can_tx(&self, now_ms: u64) -> bool {
        self.last_rx + PEER_TX_WINDOW_MS > now_ms
    }

    /// Park a datagram for delivery once the peer wakes.
    pub fn enqueue(&mut self, datagram: Datagram) {
        if self.queue.len() >= PEER_QUEUE_CAP {
            self.queue.pop_front();
        }
        self.queue.push_back(datagram);
    }
}
