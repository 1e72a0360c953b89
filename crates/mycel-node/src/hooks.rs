//! Observability hooks.
//!
//! Observers watch Packager activity without affecting it; every payload is
//! owned data, so an observer can stash events freely. Used by tests, the
//! console, and LED/button glue on real devices.

use mycel_core::address::Address;
use mycel_core::ident::{AppId, NodeId};

#[derive(Debug, Clone)]
pub enum HookEvent {
    PeerAdded(NodeId),
    PeerRemoved(NodeId),
    AddrSet(Address),
    /// Package digest failed or no application claimed the app id.
    DeliverFailed(AppId),
    /// The application's receive callback returned an error.
    ReceiveFailed(AppId),
    ModemSleep,
    SleepSkip,
    RnsSent(NodeId),
}

pub type Observer = Box<dyn FnMut(&HookEvent) + Send>;
