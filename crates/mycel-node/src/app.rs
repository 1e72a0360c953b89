//! Application contract.
//!
//! An application registers under a 16-byte id derived deterministically
//! from (name, description, version), so every node computes the same id
//! without negotiation. The Packager removes an application from the
//! registry for the duration of a callback, which is what lets callbacks
//! take `&mut Packager` in a single-threaded runtime.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use mycel_core::address::Address;
use mycel_core::ident::{app_id, AppId, InterfaceId, NodeId};

use crate::event::AppEvent;
use crate::packager::Packager;

/// A suspending continuation returned by a callback; the scheduler awaits
/// the batch of these each tick.
pub type AppFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Identity and metadata for an application.
#[derive(Debug, Clone)]
pub struct AppMeta {
    pub name: String,
    pub description: String,
    pub version: u32,
    pub id: AppId,
}

impl AppMeta {
    pub fn new(name: impl Into<String>, description: impl Into<String>, version: u32) -> Self {
        let name = name.into();
        let description = description.into();
        let id = app_id(&name, &description, version);
        AppMeta { name, description, version, id }
    }
}

/// An application that accepts Package delivery.
pub trait Application: Send {
    fn meta(&self) -> &AppMeta;

    fn id(&self) -> AppId {
        self.meta().id
    }

    /// A Package addressed to this application arrived. The blob's digest
    /// has already been verified. Errors are reported through the
    /// `ReceiveFailed` hook and otherwise dropped.
    fn receive(
        &mut self,
        node: &mut Packager,
        blob: Bytes,
        intrfc_id: InterfaceId,
        mac: Bytes,
    ) -> Result<Option<AppFuture>, AppError>;

    /// A scheduled event owned by this application fired.
    fn on_event(&mut self, _node: &mut Packager, _event: AppEvent) -> Option<AppFuture> {
        None
    }

    /// A new peer appeared in the peer table.
    fn on_peer_added(&mut self, _node: &mut Packager, _peer_id: &NodeId) {}

    /// A peer was evicted or banned.
    fn on_peer_removed(&mut self, _node: &mut Packager, _peer_id: &NodeId) {}

    /// The local node's address changed.
    fn on_addr_set(&mut self, _node: &mut Packager, _addr: &Address) {}

    /// Typed access for owners that know the concrete application type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
