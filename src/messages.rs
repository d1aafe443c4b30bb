//! # Wire Protocol Messages
//!
//! Every exchange between clients, gateways, providers and administrators is
//! an [`Envelope`]: a typed, versioned, signed wrapper around a
//! type-specific body.
//!
//! ## Envelope Encoding
//!
//! Envelopes travel as JSON objects:
//!
//! | Field | JSON key | Content |
//! |-------|----------|---------|
//! | `message_type` | `message_type` | [`MessageType`] code |
//! | `protocol_version` | `protocol_version` | sender's current version |
//! | `protocol_supported` | `protocol_supported` | every version the sender speaks |
//! | `body` | `message_body` | bounded bincode of the body, hex encoded |
//! | `signature` | `message_signature` | see [`crate::crypto`] |
//!
//! The signature covers the bincode (fixed-int) encoding of
//! `(message_type, protocol_version, protocol_supported, body)`.
//!
//! ## Message Set
//!
//! [`Message`] is a closed sum type. Decoding an envelope first maps its code
//! to a [`MessageType`] (unknown codes are rejected there), then decodes the
//! body into the matching variant, so routers match exhaustively.
//!
//! | Range | Family |
//! |-------|--------|
//! | 100-199 | Client discovery |
//! | 200-299 | Gateway to gateway and gateway to provider |
//! | 300-399 | Administration |
//! | 900-999 | Protocol control |
//!
//! ## Security Limits
//!
//! All body deserialization goes through [`deserialize_bounded`].

use bincode::Options;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};

use crate::cid::ContentId;
use crate::crypto::{ENVELOPE_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::{GatewayError, Result};
use crate::identity::{KeyVersion, Keypair, NodeId, PublicKey};
use crate::offer::{CidGroupOffer, OfferAck, SubCidOffer};
use crate::registry::{EnrollOutcome, RegisteredNode};

/// Maximum encoded size of a message body (4 MiB).
pub const MAX_BODY_SIZE: u64 = 4 * 1024 * 1024;

/// Protocol version this build speaks by default.
pub const PROTOCOL_VERSION: i32 = 1;

/// Versions this build can speak by default, in preference order.
pub const PROTOCOL_SUPPORTED: &[i32] = &[PROTOCOL_VERSION];

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_BODY_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options().deserialize(bytes)?)
}

/// Canonical byte encoding used for bodies and for every signed payload.
pub fn encode_canonical<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

mod hex_bytes {
    use super::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: i32,
    pub protocol_version: i32,
    pub protocol_supported: Vec<i32>,
    #[serde(rename = "message_body", with = "hex_bytes")]
    pub body: Vec<u8>,
    #[serde(rename = "message_signature", default)]
    pub signature: String,
}

impl Envelope {
    pub fn new(
        message_type: i32,
        protocol_version: i32,
        protocol_supported: Vec<i32>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            protocol_version,
            protocol_supported,
            body,
            signature: String::new(),
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        encode_canonical(&(
            self.message_type,
            self.protocol_version,
            &self.protocol_supported,
            &self.body,
        ))
    }

    pub fn sign(&mut self, keypair: &Keypair, key_version: KeyVersion) -> Result<()> {
        let data = self.signing_bytes()?;
        self.signature = sign_with_domain(keypair, key_version, ENVELOPE_SIGNATURE_DOMAIN, &data);
        Ok(())
    }

    pub fn verify(&self, public_key: &PublicKey) -> Result<()> {
        let data = self.signing_bytes()?;
        verify_with_domain(public_key, ENVELOPE_SIGNATURE_DOMAIN, &data, &self.signature)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GatewayError::Malformed("empty envelope".to_string()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decode the body into its typed [`Message`].
    pub fn decode(&self) -> Result<Message> {
        Message::from_envelope(self)
    }
}

// ============================================================================
// Protocol Negotiation
// ============================================================================

/// Outcome of comparing a received envelope's versions with our own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// Same version, process the body.
    Accept,
    /// The sender also speaks our current version and should resend with it.
    SwitchTo(i32),
    /// A version both sides speak exists but is not our current one.
    /// Multi-version reconciliation is not implemented.
    Unreconciled(i32),
    /// No version in common.
    Mismatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolVersions {
    pub current: i32,
    pub supported: Vec<i32>,
}

impl Default for ProtocolVersions {
    fn default() -> Self {
        Self {
            current: PROTOCOL_VERSION,
            supported: PROTOCOL_SUPPORTED.to_vec(),
        }
    }
}

impl ProtocolVersions {
    pub fn new(current: i32, supported: Vec<i32>) -> Self {
        Self { current, supported }
    }

    pub fn speaks(&self, version: i32) -> bool {
        self.current == version || self.supported.contains(&version)
    }

    /// Responder-side negotiation against a received envelope.
    pub fn negotiate(&self, envelope: &Envelope) -> Negotiation {
        if envelope.protocol_version == self.current {
            return Negotiation::Accept;
        }
        if envelope.protocol_supported.contains(&self.current) {
            return Negotiation::SwitchTo(self.current);
        }
        match self
            .supported
            .iter()
            .find(|v| envelope.protocol_supported.contains(v))
        {
            Some(&common) => Negotiation::Unreconciled(common),
            None => Negotiation::Mismatch,
        }
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

/// Client request for offers on one CID from this gateway's cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardDiscoverRequest {
    pub cid: ContentId,
    pub nonce: i64,
    /// Unix seconds after which the request must be dropped unanswered.
    pub ttl: i64,
    pub client_id: Option<NodeId>,
}

/// Answer to a standard or gateway DHT discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub cid: ContentId,
    pub nonce: i64,
    pub found: bool,
    pub offers: Vec<SubCidOffer>,
}

/// Client request to fan a lookup out to the gateways nearest the CID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtDiscoverRequest {
    pub cid: ContentId,
    pub nonce: i64,
    pub ttl: i64,
    pub num_dht: u32,
    pub client_id: Option<NodeId>,
}

/// One peer gateway's signed answer, forwarded untouched so the client can
/// check it against the peer's own key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactedGateway {
    pub gateway_id: NodeId,
    pub response: Envelope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtDiscoverResponse {
    pub cid: ContentId,
    pub nonce: i64,
    pub contacted: Vec<ContactedGateway>,
    pub unreachable: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub gateway_id: NodeId,
    pub nonce: i64,
    pub ttl: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub nonce: i64,
    pub is_alive: bool,
}

/// Gateway request for every group offer a provider holds in `[cid_min, cid_max]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffersRequest {
    pub gateway_id: NodeId,
    pub cid_min: ContentId,
    pub cid_max: ContentId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffersResponse {
    pub offers: Vec<CidGroupOffer>,
}

/// One signed [`Message::ProviderOfferAck`] envelope per accepted offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOffersAck {
    pub gateway_id: NodeId,
    pub acks: Vec<Envelope>,
}

/// Peer gateway lookup on one CID, answered from the peer's local cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDhtDiscoverRequest {
    pub gateway_id: NodeId,
    pub cid: ContentId,
    pub nonce: i64,
    pub ttl: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialiseKeyRequest {
    pub private_key: String,
    pub key_version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialiseKeyResponse {
    pub success: bool,
}

/// Echo of an enrolled record, signed by the gateway as proof of acceptance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollAck {
    pub node: RegisteredNode,
    pub outcome: EnrollOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReputationRequest {
    pub client_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReputationRequest {
    pub client_id: NodeId,
    pub reputation: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationResponse {
    pub client_id: NodeId,
    pub reputation: i64,
    pub exists: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolChange {
    pub desired_version: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMismatch {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidMessage {
    pub reason: String,
}

// ============================================================================
// Message Set
// ============================================================================

macro_rules! message_set {
    ($( $(#[$doc:meta])* $variant:ident($body:ty) = $code:literal, )*) => {
        /// Wire code of every message the gateway understands.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum MessageType {
            $( $variant = $code, )*
        }

        impl TryFrom<i32> for MessageType {
            type Error = GatewayError;

            fn try_from(code: i32) -> Result<Self> {
                match code {
                    $( $code => Ok(MessageType::$variant), )*
                    other => Err(GatewayError::UnknownMessageType(other)),
                }
            }
        }

        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Message {
            $( $(#[$doc])* $variant($body), )*
        }

        impl Message {
            pub fn message_type(&self) -> MessageType {
                match self {
                    $( Message::$variant(_) => MessageType::$variant, )*
                }
            }

            fn encode_body(&self) -> Result<Vec<u8>> {
                match self {
                    $( Message::$variant(body) => encode_canonical(body), )*
                }
            }

            fn decode_body(message_type: MessageType, body: &[u8]) -> Result<Self> {
                match message_type {
                    $( MessageType::$variant => Ok(Message::$variant(deserialize_bounded(body)?)), )*
                }
            }
        }
    };
}

message_set! {
    ClientStandardDiscoverRequest(StandardDiscoverRequest) = 100,
    ClientStandardDiscoverResponse(DiscoverResponse) = 101,
    ClientDhtDiscoverRequest(DhtDiscoverRequest) = 102,
    ClientDhtDiscoverResponse(DhtDiscoverResponse) = 103,

    GatewayPingRequest(PingRequest) = 200,
    GatewayPingResponse(PingResponse) = 201,
    GatewayListOffersRequest(ListOffersRequest) = 202,
    GatewayListOffersResponse(ListOffersResponse) = 203,
    GatewayListOffersAck(ListOffersAck) = 204,
    GatewayDhtDiscoverRequest(GatewayDhtDiscoverRequest) = 205,
    GatewayDhtDiscoverResponse(DiscoverResponse) = 206,
    /// Carried inside [`ListOffersAck`], one per accepted offer.
    ProviderOfferAck(OfferAck) = 207,

    AdminInitialiseKeyRequest(InitialiseKeyRequest) = 300,
    AdminInitialiseKeyResponse(InitialiseKeyResponse) = 301,
    AdminEnrollGatewayRequest(RegisteredNode) = 302,
    AdminEnrollGatewayResponse(EnrollAck) = 303,
    AdminEnrollProviderRequest(RegisteredNode) = 304,
    AdminEnrollProviderResponse(EnrollAck) = 305,
    AdminGetReputationRequest(GetReputationRequest) = 306,
    AdminGetReputationResponse(ReputationResponse) = 307,
    AdminSetReputationRequest(SetReputationRequest) = 308,
    AdminSetReputationResponse(ReputationResponse) = 309,

    /// Tells the sender to resend using `desired_version`.
    ProtocolChange(ProtocolChange) = 900,
    ProtocolMismatch(ProtocolMismatch) = 901,
    InvalidMessage(InvalidMessage) = 902,
}

impl Message {
    /// Wrap into an unsigned envelope stamped with `versions`.
    pub fn to_envelope(&self, versions: &ProtocolVersions) -> Result<Envelope> {
        Ok(Envelope::new(
            self.message_type() as i32,
            versions.current,
            versions.supported.clone(),
            self.encode_body()?,
        ))
    }

    pub fn to_signed_envelope(
        &self,
        versions: &ProtocolVersions,
        keypair: &Keypair,
        key_version: KeyVersion,
    ) -> Result<Envelope> {
        let mut envelope = self.to_envelope(versions)?;
        envelope.sign(keypair, key_version)?;
        Ok(envelope)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let message_type = MessageType::try_from(envelope.message_type)?;
        Self::decode_body(message_type, &envelope.body)
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Message::InvalidMessage(InvalidMessage {
            reason: reason.into(),
        })
    }
}
