//! # Gateway Error Taxonomy
//!
//! Every fallible operation in the protocol core returns [`GatewayError`].
//! The variants map one-to-one onto the way a failure is handled:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | `Malformed` | Reply with an invalid-message envelope |
//! | `UnknownMessageType` | Reply with an invalid-message envelope |
//! | `ProtocolMismatch` | Reply with a protocol-mismatch envelope, body untouched |
//! | `NotInitialised` | Client-visible error, no partial processing |
//! | `Authentication` | Discard the exchange, no cache mutation |
//! | `NotFound` | Unknown peer or offer |
//! | `Transport` | Deregister the pooled connection |
//! | `MerkleVerification` | Discard the offer, no acknowledgement |
//! | `Unsupported` | Deliberately unimplemented branch, reported not panicked |

use thiserror::Error;

use crate::crypto::SignatureError;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    #[error("no common protocol version (peer declared {peer_version}, peer supports {peer_supported:?})")]
    ProtocolMismatch {
        peer_version: i32,
        peer_supported: Vec<i32>,
    },

    #[error("gateway has not been initialised with key material")]
    NotInitialised,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("merkle proof does not fold to the stated root")]
    MerkleVerification,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl GatewayError {
    /// True when the failure happened on the socket rather than in the payload.
    /// Only these failures deregister a pooled connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

impl From<SignatureError> for GatewayError {
    fn from(err: SignatureError) -> Self {
        GatewayError::Authentication(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Transport("timed out".to_string())
    }
}

impl From<bincode::Error> for GatewayError {
    fn from(err: bincode::Error) -> Self {
        GatewayError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Malformed(err.to_string())
    }
}

impl From<hex::FromHexError> for GatewayError {
    fn from(err: hex::FromHexError) -> Self {
        GatewayError::Malformed(format!("invalid hex: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_transport() {
        assert!(GatewayError::Transport("reset".into()).is_transport());
        assert!(!GatewayError::Authentication("bad sig".into()).is_transport());
        assert!(!GatewayError::MerkleVerification.is_transport());
    }

    #[test]
    fn io_and_timeout_map_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(GatewayError::from(io).is_transport());
    }

    #[test]
    fn signature_errors_map_to_authentication() {
        let err: GatewayError = SignatureError::VerificationFailed.into();
        assert!(matches!(err, GatewayError::Authentication(_)));
    }
}
