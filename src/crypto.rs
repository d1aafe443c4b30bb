//! # Signature Primitives
//!
//! Domain-separated Ed25519 signing used by envelopes, offers and
//! acknowledgements.
//!
//! ## Signature String Format
//!
//! Signatures travel as strings so they can sit inside JSON envelopes:
//!
//! ```text
//! <key version: 8 hex chars><ed25519 signature: 128 hex chars>
//! ```
//!
//! The key version lets a verifier tell which of a peer's keys produced the
//! signature; the registry currently publishes only one signing key per node,
//! so the version is carried but not used to select a key.
//!
//! ## Domain Separation
//!
//! Each signed data type uses its own prefix so a signature over an offer can
//! never be replayed as a signature over an envelope.

use ed25519_dalek::Signature;

use crate::identity::{KeyVersion, Keypair, PublicKey};

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature string has the wrong length or is not hex.
    InvalidEncoding,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidEncoding => write!(f, "signature has invalid encoding"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Domain separation prefix for envelope signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"retrieval-envelope-v1:";

/// Domain separation prefix for provider offer signatures.
pub const OFFER_SIGNATURE_DOMAIN: &[u8] = b"retrieval-offer-v1:";

/// Domain separation prefix for gateway acknowledgements of accepted offers.
pub const OFFER_ACK_SIGNATURE_DOMAIN: &[u8] = b"retrieval-offer-ack-v1:";

const KEY_VERSION_HEX_LEN: usize = 8;
const SIGNATURE_HEX_LEN: usize = 128;

/// Sign data with domain separation and encode the result as a signature string.
///
/// The signed message is `domain || blake3(data)`; hashing first keeps the
/// Ed25519 input small for large offer lists.
pub fn sign_with_domain(
    keypair: &Keypair,
    key_version: KeyVersion,
    domain: &[u8],
    data: &[u8],
) -> String {
    let prefixed = prefixed_digest(domain, data);
    let signature = keypair.sign(&prefixed);
    format!(
        "{:08x}{}",
        key_version.0,
        hex::encode(signature.to_bytes())
    )
}

/// Verify a signature string produced by [`sign_with_domain`].
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &str,
) -> Result<(), SignatureError> {
    let (_, signature) = decode_signature(signature)?;
    let prefixed = prefixed_digest(domain, data);
    public_key
        .verifying_key()
        .verify_strict(&prefixed, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Split a signature string into its key version and Ed25519 signature.
pub fn decode_signature(signature: &str) -> Result<(KeyVersion, Signature), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != KEY_VERSION_HEX_LEN + SIGNATURE_HEX_LEN || !signature.is_ascii() {
        return Err(SignatureError::InvalidEncoding);
    }
    let (version_hex, sig_hex) = signature.split_at(KEY_VERSION_HEX_LEN);
    let version = u32::from_str_radix(version_hex, 16)
        .map_err(|_| SignatureError::InvalidEncoding)?;
    let bytes = hex::decode(sig_hex).map_err(|_| SignatureError::InvalidEncoding)?;
    let sig_bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidEncoding)?;
    Ok((KeyVersion(version), Signature::from_bytes(&sig_bytes)))
}

fn prefixed_digest(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let digest = blake3::hash(data);
    let mut prefixed = Vec::with_capacity(domain.len() + 32);
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(digest.as_bytes());
    prefixed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, KeyVersion(3), ENVELOPE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(sig.len(), 136);
        assert!(sig.starts_with("00000003"));
        assert!(verify_with_domain(&kp.public_key(), ENVELOPE_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
    }

    #[test]
    fn wrong_domain_fails() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, KeyVersion(1), OFFER_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&kp.public_key(), ENVELOPE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_signer_fails() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&signer, KeyVersion(1), ENVELOPE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&other.public_key(), ENVELOPE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signature_strings_rejected() {
        let kp = Keypair::generate();
        let pk = kp.public_key();
        assert_eq!(
            verify_with_domain(&pk, ENVELOPE_SIGNATURE_DOMAIN, b"x", ""),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, ENVELOPE_SIGNATURE_DOMAIN, b"x", "0001abcd"),
            Err(SignatureError::InvalidEncoding)
        );
        let bogus = "g".repeat(136);
        assert_eq!(
            verify_with_domain(&pk, ENVELOPE_SIGNATURE_DOMAIN, b"x", &bogus),
            Err(SignatureError::InvalidEncoding)
        );
    }

    #[test]
    fn decode_signature_extracts_key_version() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, KeyVersion(0xabcdef), ENVELOPE_SIGNATURE_DOMAIN, b"x");
        let (version, _) = decode_signature(&sig).unwrap();
        assert_eq!(version, KeyVersion(0xabcdef));
    }
}
