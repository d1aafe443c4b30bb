//! Protocol trait definitions for the gateway's outbound networking.
//!
//! Offer discovery and the proximity engine depend only on these traits, not
//! on the TCP client in [`crate::rpc`], so their state machines can be driven
//! by in-memory fakes in tests.
//!
//! ## Protocol Traits
//!
//! | Peer | Trait | Purpose |
//! |------|-------|---------|
//! | Gateway | [`GatewayRpc`] | Liveness pings and DHT-routed lookups |
//! | Provider | [`ProviderRpc`] | Offer list retrieval and acknowledgement |
//! | Registrar | [`Registrar`] | Bootstrap lists of registered nodes |
//!
//! Every implementation must sign outbound requests and verify inbound
//! responses against the registry key of the peer it addressed before
//! returning anything.

use async_trait::async_trait;

use crate::cid::ContentId;
use crate::error::Result;
use crate::identity::NodeId;
use crate::messages::{Envelope, PingResponse};
use crate::offer::CidGroupOffer;
use crate::registry::RegisteredNode;

/// Operations against peer gateways.
#[async_trait]
pub trait GatewayRpc: Send + Sync + 'static {
    /// Signed liveness ping. `ttl` is the unix-second deadline for the peer.
    async fn ping(&self, gateway: &NodeId, ttl: i64) -> Result<PingResponse>;

    /// Ask a peer gateway for the offers it caches on `cid`.
    /// Returns the peer's verified response envelope, untouched, so it can be
    /// forwarded to a client that checks the signature itself.
    async fn dht_discover(
        &self,
        gateway: &NodeId,
        cid: &ContentId,
        nonce: i64,
        ttl: i64,
    ) -> Result<Envelope>;
}

/// Operations against content providers.
#[async_trait]
pub trait ProviderRpc: Send + Sync + 'static {
    /// Request every group offer the provider holds in `[cid_min, cid_max]`.
    /// The response envelope is verified; the offers inside are not.
    async fn list_offers(
        &self,
        provider: &NodeId,
        cid_min: &ContentId,
        cid_max: &ContentId,
    ) -> Result<Vec<CidGroupOffer>>;

    /// Deliver a signed list acknowledgement. No reply is expected.
    async fn acknowledge_offers(&self, provider: &NodeId, ack: Envelope) -> Result<()>;
}

/// Source of registered gateways and providers.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn fetch_registered_gateways(&self) -> anyhow::Result<Vec<RegisteredNode>>;

    async fn fetch_registered_providers(&self) -> anyhow::Result<Vec<RegisteredNode>>;
}
