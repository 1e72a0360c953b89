//! Package framing — the app-addressed payload carried inside packets.
//!
//! Layout: `app_id:16 || half_sha256:16 || blob`, where half_sha256 is the
//! first half of SHA-256(blob). The digest is a delivery-time integrity
//! check; a mismatch drops the package silently.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::ident::AppId;
use crate::schema::WireError;

/// Fixed framing overhead preceding the blob.
pub const PACKAGE_HEADER_LEN: usize = 32;

/// First 16 bytes of SHA-256 over a blob.
pub fn half_sha256(blob: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(blob);
    digest[..16].try_into().unwrap()
}

/// An application-addressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub app_id: AppId,
    pub half_sha256: [u8; 16],
    pub blob: Bytes,
}

impl Package {
    /// Build a package for a blob, computing the integrity digest.
    pub fn from_blob(app_id: AppId, blob: Bytes) -> Self {
        let half_sha256 = half_sha256(&blob);
        Package { app_id, half_sha256, blob }
    }

    /// True when the carried digest matches the blob.
    pub fn verify(&self) -> bool {
        half_sha256(&self.blob) == self.half_sha256
    }

    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(PACKAGE_HEADER_LEN + self.blob.len());
        out.extend_from_slice(&self.app_id);
        out.extend_from_slice(&self.half_sha256);
        out.extend_from_slice(&self.blob);
        Bytes::from(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < PACKAGE_HEADER_LEN {
            return Err(WireError::Truncated { needed: PACKAGE_HEADER_LEN, got: data.len() });
        }
        Ok(Package {
            app_id: data[..16].try_into().unwrap(),
            half_sha256: data[16..32].try_into().unwrap(),
            blob: Bytes::copy_from_slice(&data[32..]),
        })
    }
}
