//! # Merkle Commitment Engine
//!
//! Binary SHA-256 Merkle tree over a list of content identifiers.
//!
//! - Leaf: `SHA256(cid bytes)` (see [`ContentId::hash`])
//! - Interior node: `SHA256(left || right)`
//! - A level with an odd number of nodes promotes its last node unchanged;
//!   proofs carry no step for that level, so every proof step has a real
//!   sibling and every direction bit matters
//!
//! A provider signs one group offer over the root; any holder of a single
//! CID's [`MerkleProof`] can convince a verifier that the CID belongs to the
//! signed group without sending the whole list.
//!
//! ## Fold Rule
//!
//! Verification walks the path from leaf to root. At step `i`:
//!
//! | `index[i]` | next hash |
//! |------------|-----------|
//! | 1 | `H(current || path[i])` (current is the left child) |
//! | 0 | `H(path[i] || current)` (current is the right child) |
//!
//! The final hash must equal the root byte-for-byte.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cid::ContentId;
use crate::error::{GatewayError, Result};

pub type Hash = [u8; 32];

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Sibling hashes from leaf level to root.
    pub path: Vec<Hash>,
    /// Direction bit per path element, 1 when the running hash is the left child.
    pub index: Vec<u8>,
}

impl MerkleProof {
    /// Check that `cid` folds up to `root` along this proof.
    pub fn verify(&self, cid: &ContentId, root: &Hash) -> bool {
        if self.path.len() != self.index.len() {
            return false;
        }
        let mut current = cid.hash();
        for (sibling, bit) in self.path.iter().zip(&self.index) {
            current = match bit {
                1 => hash_pair(&current, sibling),
                0 => hash_pair(sibling, &current),
                _ => return false,
            };
        }
        current == *root
    }
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// Nodes level by level, bottom-up. `layers[0]` holds the leaves.
    layers: Vec<Vec<Hash>>,
    cids: Vec<ContentId>,
}

impl MerkleTree {
    /// Build a tree over `cids` in the given order.
    pub fn build(cids: &[ContentId]) -> Result<Self> {
        if cids.is_empty() {
            return Err(GatewayError::Malformed(
                "cannot build a merkle tree over zero content ids".to_string(),
            ));
        }

        let leaves: Vec<Hash> = cids.iter().map(ContentId::hash).collect();
        let mut layers = vec![leaves];

        while let Some(prev) = layers.last()
            && prev.len() > 1
        {
            let next: Vec<Hash> = prev
                .chunks(2)
                .map(|pair| match pair.get(1) {
                    Some(right) => hash_pair(&pair[0], right),
                    None => pair[0],
                })
                .collect();
            layers.push(next);
        }

        Ok(Self {
            layers,
            cids: cids.to_vec(),
        })
    }

    pub fn root(&self) -> Hash {
        self.layers
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.cids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }

    /// Produce the inclusion proof for `cid`.
    pub fn prove(&self, cid: &ContentId) -> Result<MerkleProof> {
        let leaf_index = self
            .cids
            .iter()
            .position(|c| c == cid)
            .ok_or_else(|| GatewayError::NotFound(format!("cid {} not in merkle tree", cid)))?;

        let mut path = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut index = Vec::with_capacity(path.capacity());
        let mut idx = leaf_index;

        for layer in &self.layers[..self.layers.len() - 1] {
            if idx % 2 == 0 {
                // No right sibling: promoted as-is, no step at this level.
                if let Some(sibling) = layer.get(idx + 1) {
                    path.push(*sibling);
                    index.push(1);
                }
            } else {
                path.push(layer[idx - 1]);
                index.push(0);
            }
            idx /= 2;
        }

        Ok(MerkleProof { path, index })
    }
}
