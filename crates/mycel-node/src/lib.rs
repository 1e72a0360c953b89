//! mycel-node — the mesh transport runtime.
//!
//! A `Packager` owns every piece of mutable state (interfaces, peers,
//! routes, caches, the event schedule) and is driven by a single
//! cooperative task; see `Packager::work`. Radios plug in as driver
//! callbacks on an `Interface`; applications plug in through the
//! `Application` trait. The Gossip and SpanningTree overlays ship as
//! built-in applications.

pub mod app;
pub mod config;
pub mod event;
pub mod gossip;
pub mod hooks;
pub mod interface;
pub mod packager;
pub mod peer;
pub mod tree;

pub use app::{AppError, AppFuture, AppMeta, Application};
pub use config::MycelConfig;
pub use event::{AppEvent, Event, EventKind};
pub use gossip::{Gossip, GossipMessage};
pub use hooks::{HookEvent, Observer};
pub use interface::{Datagram, Interface, InterfaceBuilder, InterfaceError};
pub use packager::Packager;
pub use peer::Peer;
pub use tree::SpanningTree;

/// Modem light-sleep window in milliseconds.
pub const MODEM_SLEEP_MS: u64 = 90;
/// Minimum awake window between modem sleeps, in milliseconds.
pub const MODEM_WAKE_MS: u64 = 40;
/// RNS retry cadence: 90% of the wake window, so repeated probes are
/// guaranteed to intersect a sleeping peer's wake phase.
pub const MODEM_INTERSECT_INTERVAL_MS: u64 = MODEM_WAKE_MS * 9 / 10;
/// RNS attempts needed to cover a full sleep+wake cycle.
pub const MODEM_INTERSECT_RTX_TIMES: u8 =
    ((MODEM_SLEEP_MS + MODEM_WAKE_MS) / MODEM_INTERSECT_INTERVAL_MS) as u8 + 1;

/// Delay before requesting retransmission of missing fragments.
pub const SEQ_SYNC_DELAY_MS: u64 = 10_000;
/// Delay before re-sending an unacknowledged single packet.
pub const SEND_RETRY_DELAY_MS: u64 = 2_000;
/// Default retry budget for unacknowledged single packets.
pub const SEND_RETRY_COUNT: u8 = 3;
