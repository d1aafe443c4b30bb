//! # Node Identities and Key Material
//!
//! This module defines the identity types shared by every participant:
//!
//! - [`NodeId`]: 32-byte identifier locating a client, gateway or provider in
//!   the XOR keyspace
//! - [`Keypair`]: Ed25519 signing keypair installed by the gateway admin
//! - [`PublicKey`]: a peer's verifying key as published by the registrar
//! - [`KeyVersion`]: version tag carried inside every envelope signature
//! - [`KeyStore`]: the gateway's own key, installed at runtime
//!
//! ## Identity Model
//!
//! Unlike a self-certifying network, a node's id is NOT its public key. Ids are
//! assigned at registration and the registrar publishes the signing key that
//! belongs to each id. Authentication therefore always goes through the
//! registry: "who claims to be X" is checked against "the key X registered".
//!
//! ## Invariants
//!
//! - `NodeId::from_hex(id.to_hex()) == id` (round-trip preservation)
//! - Hex decoding is case-insensitive and left-pads short strings, so
//!   `"42"` and `"0042"` name the same node
//! - XOR distance is symmetric and zero only for identical ids

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};

/// Byte length of a [`NodeId`].
pub const NODE_ID_LEN: usize = 32;

/// Returns current time as seconds since Unix epoch.
/// TTLs and offer expiries on the wire are expressed in these units.
#[inline]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Canonical form: 64 lower-case hex characters.
    /// Registry maps are keyed by this string.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex id, accepting mixed case, an optional `0x` prefix and
    /// strings shorter than 64 characters (interpreted as a big-endian number).
    pub fn from_hex(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(GatewayError::Malformed("empty node id".to_string()));
        }
        if trimmed.len() > NODE_ID_LEN * 2 {
            return Err(GatewayError::Malformed(format!(
                "node id too long: {} hex chars (max {})",
                trimmed.len(),
                NODE_ID_LEN * 2
            )));
        }
        let padded = format!("{:0>width$}", trimmed, width = NODE_ID_LEN * 2);
        let bytes = hex::decode(padded)?;
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Derive an id from arbitrary bytes by hashing them onto the keyspace.
    pub fn derive(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two ids is closer to a target in the XOR
/// metric space.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    for i in 0..NODE_ID_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for NodeId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Version of the key that produced a signature.
/// Carried as the first 8 hex characters of every signature string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyVersion(pub u32);

impl KeyVersion {
    pub fn initial() -> Self {
        Self(1)
    }
}

impl std::fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Decode a private key from its 64-character hex form, as delivered by
    /// the admin key-installation message.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            GatewayError::Malformed(format!("private key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// A peer's Ed25519 verifying key.
///
/// Registry records store keys as hex strings; they are parsed into this type
/// every time they are used, so a record with a malformed key can never
/// authenticate anything.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let key = VerifyingKey::try_from(bytes.as_slice()).map_err(|_| {
            GatewayError::Authentication("public key is not a valid ed25519 point".to_string())
        })?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// The gateway's own signing key, absent until an administrator installs one.
///
/// Later installs overwrite earlier ones. Readers clone the key out so no
/// lock is held across I/O.
#[derive(Default)]
pub struct KeyStore {
    inner: RwLock<Option<(Keypair, KeyVersion)>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, keypair: Keypair, version: KeyVersion) {
        *self.inner.write().await = Some((keypair, version));
    }

    pub async fn is_installed(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Current key and version, or `NotInitialised`.
    pub async fn current(&self) -> Result<(Keypair, KeyVersion)> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NotInitialised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hex_is_left_padded() {
        let short = NodeId::from_hex("42").unwrap();
        let long = NodeId::from_hex(&format!("{:0>64}", "42")).unwrap();
        assert_eq!(short, long);
        assert_eq!(short.as_bytes()[31], 0x42);
        assert!(short.as_bytes()[..31].iter().all(|&b| b == 0));
    }

    #[test]
    fn hex_decoding_is_case_insensitive() {
        let upper = NodeId::from_hex("ABCDEF").unwrap();
        let lower = NodeId::from_hex("abcdef").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.to_hex(), lower.to_hex());
        assert_eq!(upper.to_hex(), upper.to_hex().to_lowercase());
    }

    #[test]
    fn hex_roundtrip_preserves_bytes() {
        let id = NodeId::derive(b"gateway-7");
        assert_eq!(NodeId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn hex_rejects_invalid_input() {
        assert!(NodeId::from_hex("").is_err());
        assert!(NodeId::from_hex("zz").is_err());
        assert!(NodeId::from_hex(&"f".repeat(65)).is_err());
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = NodeId::from_bytes([0xFF; 32]);
        let b = NodeId::from_bytes([0x0F; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xF0; 32]);
    }

    #[test]
    fn distance_cmp_orders_lexicographically() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[31] = 0xFF;
        high[0] = 0x01;
        assert_eq!(distance_cmp(&low, &high), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&high, &low), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&low, &low), std::cmp::Ordering::Equal);
    }

    #[test]
    fn keypair_hex_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("not-hex").is_err());
    }

    #[tokio::test]
    async fn key_store_starts_empty_and_overwrites() {
        let store = KeyStore::new();
        assert!(matches!(store.current().await, Err(GatewayError::NotInitialised)));

        let first = Keypair::generate();
        store.install(first, KeyVersion(1)).await;
        let second = Keypair::generate();
        store.install(second.clone(), KeyVersion(2)).await;

        let (current, version) = store.current().await.unwrap();
        assert_eq!(current.public_key(), second.public_key());
        assert_eq!(version, KeyVersion(2));
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let signature = kp.sign(b"hello world");
        assert!(kp.verify(b"hello world", &signature));
        assert!(!kp.verify(b"wrong message", &signature));
    }
}
