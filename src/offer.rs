//! # Provider Offers
//!
//! A provider advertises the CIDs it serves as a [`CidGroupOffer`]: one signed
//! set of terms (price, expiry, QoS tier) committed to a Merkle root over the
//! CIDs. Clients never receive the whole group. They receive a [`SubCidOffer`]
//! projected to the CID they asked for, carrying its inclusion proof and the
//! group signature so it verifies on its own.
//!
//! ## Signed Fields
//!
//! The provider signs the canonical encoding of
//! `(provider_id, merkle_root, price_per_byte, expiry, qos)` under
//! [`OFFER_SIGNATURE_DOMAIN`]. The CID list is bound through the root.
//!
//! ## Acceptance
//!
//! A gateway accepts a group offer only when all of these hold:
//!
//! | Check | Failure |
//! |-------|---------|
//! | Merkle root rebuilt from `cids` equals `merkle_root` | `MerkleVerification` |
//! | Every CID's proof folds to `merkle_root` | `MerkleVerification` |
//! | Provider signature verifies against the registry key | `Authentication` |
//! | `expiry` is in the future | `Malformed` |

use serde::{Deserialize, Serialize};

use crate::cid::ContentId;
use crate::crypto::{
    OFFER_ACK_SIGNATURE_DOMAIN, OFFER_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain,
};
use crate::error::{GatewayError, Result};
use crate::identity::{KeyVersion, Keypair, NodeId, PublicKey, now_secs};
use crate::merkle::{Hash, MerkleProof, MerkleTree};
use crate::messages::encode_canonical;

/// Maximum number of CIDs a single group offer may cover.
pub const MAX_CIDS_PER_OFFER: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidGroupOffer {
    pub provider_id: NodeId,
    pub cids: Vec<ContentId>,
    pub price_per_byte: u64,
    /// Unix seconds.
    pub expiry: i64,
    pub qos: u64,
    pub merkle_root: Hash,
    pub signature: String,
}

impl CidGroupOffer {
    /// Build an unsigned offer, computing the Merkle root over `cids`.
    pub fn new(
        provider_id: NodeId,
        cids: Vec<ContentId>,
        price_per_byte: u64,
        expiry: i64,
        qos: u64,
    ) -> Result<Self> {
        if cids.len() > MAX_CIDS_PER_OFFER {
            return Err(GatewayError::Malformed(format!(
                "offer covers {} cids (max {})",
                cids.len(),
                MAX_CIDS_PER_OFFER
            )));
        }
        let merkle_root = MerkleTree::build(&cids)?.root();
        Ok(Self {
            provider_id,
            cids,
            price_per_byte,
            expiry,
            qos,
            merkle_root,
            signature: String::new(),
        })
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        offer_signing_bytes(
            &self.provider_id,
            &self.merkle_root,
            self.price_per_byte,
            self.expiry,
            self.qos,
        )
    }

    pub fn sign(&mut self, keypair: &Keypair, key_version: KeyVersion) -> Result<()> {
        let data = self.signing_bytes()?;
        self.signature = sign_with_domain(keypair, key_version, OFFER_SIGNATURE_DOMAIN, &data);
        Ok(())
    }

    pub fn verify(&self, public_key: &PublicKey) -> Result<()> {
        let data = self.signing_bytes()?;
        verify_with_domain(public_key, OFFER_SIGNATURE_DOMAIN, &data, &self.signature)?;
        Ok(())
    }

    /// Rebuild the tree from the CID list and check every inclusion proof
    /// against the stated root.
    pub fn verify_merkle(&self) -> Result<()> {
        let tree = MerkleTree::build(&self.cids)?;
        if tree.root() != self.merkle_root {
            return Err(GatewayError::MerkleVerification);
        }
        for cid in &self.cids {
            if !tree.prove(cid)?.verify(cid, &self.merkle_root) {
                return Err(GatewayError::MerkleVerification);
            }
        }
        Ok(())
    }

    pub fn has_expired(&self, now: i64) -> bool {
        now >= self.expiry
    }

    /// Run every acceptance check against the provider's registered key.
    pub fn validate(&self, provider_key: &PublicKey) -> Result<()> {
        if self.has_expired(now_secs()) {
            return Err(GatewayError::Malformed(format!(
                "offer from {} expired at {}",
                self.provider_id, self.expiry
            )));
        }
        self.verify_merkle()?;
        self.verify(provider_key)
    }

    pub fn contains(&self, cid: &ContentId) -> bool {
        self.cids.contains(cid)
    }

    /// Project the group offer down to `cid`, attaching its inclusion proof.
    pub fn generate_sub_offer(&self, cid: &ContentId) -> Result<SubCidOffer> {
        let tree = MerkleTree::build(&self.cids)?;
        let merkle_proof = tree.prove(cid)?;
        Ok(SubCidOffer {
            provider_id: self.provider_id,
            cid: cid.clone(),
            price_per_byte: self.price_per_byte,
            expiry: self.expiry,
            qos: self.qos,
            merkle_root: self.merkle_root,
            merkle_proof,
            signature: self.signature.clone(),
        })
    }

    /// Gateway-side acknowledgement that this exact offer was accepted.
    pub fn acknowledge(&self, keypair: &Keypair, key_version: KeyVersion) -> Result<OfferAck> {
        let data = self.signing_bytes()?;
        Ok(OfferAck {
            provider_id: self.provider_id,
            merkle_root: self.merkle_root,
            signature: sign_with_domain(keypair, key_version, OFFER_ACK_SIGNATURE_DOMAIN, &data),
        })
    }
}

/// A group offer projected to one CID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCidOffer {
    pub provider_id: NodeId,
    pub cid: ContentId,
    pub price_per_byte: u64,
    pub expiry: i64,
    pub qos: u64,
    pub merkle_root: Hash,
    pub merkle_proof: MerkleProof,
    /// Signature of the originating group offer.
    pub signature: String,
}

impl SubCidOffer {
    /// Check the inclusion proof and the provider's group signature.
    pub fn verify(&self, provider_key: &PublicKey) -> Result<()> {
        if !self.merkle_proof.verify(&self.cid, &self.merkle_root) {
            return Err(GatewayError::MerkleVerification);
        }
        let data = offer_signing_bytes(
            &self.provider_id,
            &self.merkle_root,
            self.price_per_byte,
            self.expiry,
            self.qos,
        )?;
        verify_with_domain(provider_key, OFFER_SIGNATURE_DOMAIN, &data, &self.signature)?;
        Ok(())
    }
}

/// Acknowledgement of one accepted group offer, signed by the gateway over
/// the same fields the provider signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferAck {
    pub provider_id: NodeId,
    pub merkle_root: Hash,
    pub signature: String,
}

impl OfferAck {
    /// Provider-side check that `gateway_key` accepted `offer`.
    pub fn verify(&self, offer: &CidGroupOffer, gateway_key: &PublicKey) -> Result<()> {
        if self.provider_id != offer.provider_id || self.merkle_root != offer.merkle_root {
            return Err(GatewayError::NotFound(
                "acknowledgement does not name this offer".to_string(),
            ));
        }
        let data = offer.signing_bytes()?;
        verify_with_domain(gateway_key, OFFER_ACK_SIGNATURE_DOMAIN, &data, &self.signature)?;
        Ok(())
    }
}

fn offer_signing_bytes(
    provider_id: &NodeId,
    merkle_root: &Hash,
    price_per_byte: u64,
    expiry: i64,
    qos: u64,
) -> Result<Vec<u8>> {
    encode_canonical(&(provider_id, merkle_root, price_per_byte, expiry, qos))
}
