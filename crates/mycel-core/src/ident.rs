//! Protocol-level identity derivations.
//!
//! These are part of the wire contract: two nodes must derive identical ids
//! from identical inputs, so the exact byte layouts here must never change.

use sha2::{Digest, Sha256};

/// A node identity: double SHA-256 of the device's unique hardware id.
pub type NodeId = [u8; 32];

/// An application identity, deterministic across nodes.
pub type AppId = [u8; 16];

/// A stable 4-byte interface identity.
pub type InterfaceId = [u8; 4];

/// `sha256(sha256(unique_device_id))`.
pub fn node_id(unique_device_id: &[u8]) -> NodeId {
    let inner = Sha256::digest(unique_device_id);
    Sha256::digest(inner).into()
}

/// `sha256(name || description || version_be_u32)[0:16]`.
pub fn app_id(name: &str, description: &str, version: u32) -> AppId {
    let mut h = Sha256::new();
    h.update(name.as_bytes());
    h.update(description.as_bytes());
    h.update(version.to_be_bytes());
    let digest = h.finalize();
    digest[..16].try_into().unwrap()
}

/// `sha256(name || bitrate_be_u32 || schema_ids)[0:4]`.
pub fn interface_id(name: &str, bitrate: u32, supported_schemas: &[u8]) -> InterfaceId {
    let mut h = Sha256::new();
    h.update(name.as_bytes());
    h.update(bitrate.to_be_bytes());
    h.update(supported_schemas);
    let digest = h.finalize();
    digest[..4].try_into().unwrap()
}
