//! Content identifiers.
//!
//! A [`ContentId`] is an opaque byte string with a stable encoding. The gateway
//! never interprets it beyond three operations: ordering (CID ranges in offer
//! list requests), hashing (Merkle leaves) and placement on the node keyspace
//! (DHT discovery).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};
use crate::identity::NodeId;

/// Longest CID accepted from the wire.
pub const MAX_CID_LEN: usize = 128;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(Vec<u8>);

impl ContentId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(GatewayError::Malformed("empty content id".to_string()));
        }
        if bytes.len() > MAX_CID_LEN {
            return Err(GatewayError::Malformed(format!(
                "content id too long: {} bytes (max {})",
                bytes.len(),
                MAX_CID_LEN
            )));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(hex::decode(s.trim())?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Canonical hash used as the Merkle leaf for this CID.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.0).into()
    }

    /// Position of this CID on the node keyspace.
    pub fn to_node_id(&self) -> NodeId {
        NodeId::from_bytes(self.hash())
    }

    /// Smallest and largest representable CIDs, used to request every offer
    /// a provider holds.
    pub fn full_range() -> (Self, Self) {
        (Self(vec![0x00]), Self(vec![0xFF; MAX_CID_LEN]))
    }
}

impl std::fmt::Debug for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        if hex.len() > 16 {
            write!(f, "ContentId({}..)", &hex[..16])
        } else {
            write!(f, "ContentId({})", hex)
        }
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
