//! # Offer Discovery
//!
//! Fetching, verifying, caching and serving provider offers.
//!
//! ## Offer Cache
//!
//! CID → every verified group offer that covers it. A group offer is stored
//! once as an `Arc` and indexed under each of its CIDs. Expired offers are
//! skipped when serving and removed by [`OfferCache::prune_expired`].
//!
//! ## Offer Refresh Exchange
//!
//! ```text
//! Idle -> Requested -> AwaitingResponse -+-> Verified -> Cached -> Acknowledged
//!                                        +-> Rejected
//!                                        +-> Discarded
//! ```
//!
//! Verification is per offer: one bad offer in a list is rejected alone. An
//! exchange ends in `Rejected` when the response signature fails or every
//! offer in it fails verification; nothing is cached or acknowledged. An
//! empty list, an unknown provider or a transport failure ends in
//! `Discarded`. After a transport failure the RPC layer has already
//! deregistered the connection.
//!
//! ## Lookups
//!
//! | Lookup | Source | Past TTL |
//! |--------|--------|----------|
//! | Standard | local cache | dropped, no reply |
//! | Gateway DHT | local cache, requester verified | dropped, no reply |
//! | Client DHT | `num_dht` gateways nearest the CID | dropped, no reply |

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cid::ContentId;
use crate::dht::sort_closest;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayContext;
use crate::identity::{NodeId, now_secs};
use crate::merkle::Hash;
use crate::messages::{
    ContactedGateway, DhtDiscoverRequest, DhtDiscoverResponse, DiscoverResponse, Envelope,
    ListOffersAck, Message,
};
use crate::offer::{CidGroupOffer, SubCidOffer};
use crate::protocols::{GatewayRpc, ProviderRpc};
use crate::registry::NodeKind;

// ============================================================================
// Offer Cache
// ============================================================================

#[derive(Default)]
pub struct OfferCache {
    by_cid: RwLock<HashMap<ContentId, Vec<Arc<CidGroupOffer>>>>,
}

impl OfferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a verified offer under each of its CIDs. Re-inserting the same
    /// offer (same provider and root) replaces it.
    pub async fn insert(&self, offer: CidGroupOffer) {
        let offer = Arc::new(offer);
        let mut by_cid = self.by_cid.write().await;
        for cid in &offer.cids {
            let entry = by_cid.entry(cid.clone()).or_default();
            entry.retain(|o| !same_offer(o, &offer));
            entry.push(offer.clone());
        }
    }

    /// Unexpired offers covering `cid`.
    pub async fn get(&self, cid: &ContentId, now: i64) -> Vec<Arc<CidGroupOffer>> {
        self.by_cid
            .read()
            .await
            .get(cid)
            .map(|offers| {
                offers
                    .iter()
                    .filter(|o| !o.has_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every offer that has expired at `now`. Returns how many index
    /// entries were removed.
    pub async fn prune_expired(&self, now: i64) -> usize {
        let mut by_cid = self.by_cid.write().await;
        let mut removed = 0;
        by_cid.retain(|_, offers| {
            let before = offers.len();
            offers.retain(|o| !o.has_expired(now));
            removed += before - offers.len();
            !offers.is_empty()
        });
        removed
    }

    pub async fn cid_count(&self) -> usize {
        self.by_cid.read().await.len()
    }

    /// Project every unexpired offer on `cid` to a [`SubCidOffer`].
    pub async fn sub_offers(&self, cid: &ContentId, now: i64) -> Result<Vec<SubCidOffer>> {
        self.get(cid, now)
            .await
            .iter()
            .map(|offer| offer.generate_sub_offer(cid))
            .collect()
    }
}

fn same_offer(a: &CidGroupOffer, b: &CidGroupOffer) -> bool {
    a.provider_id == b.provider_id && a.merkle_root == b.merkle_root
}

// ============================================================================
// Standard / Gateway DHT Discovery (served from cache)
// ============================================================================

/// Answer a lookup from the local cache. `None` means the deadline has
/// passed and the request must be dropped without a reply.
pub async fn discover_local(
    ctx: &GatewayContext,
    cid: &ContentId,
    nonce: i64,
    ttl: i64,
) -> Result<Option<DiscoverResponse>> {
    let now = now_secs();
    if now > ttl {
        debug!(cid = %cid, ttl, now, "discovery past ttl, dropping");
        return Ok(None);
    }
    let offers = ctx.offers.sub_offers(cid, now).await?;
    Ok(Some(DiscoverResponse {
        cid: cid.clone(),
        nonce,
        found: !offers.is_empty(),
        offers,
    }))
}

// ============================================================================
// Offer Refresh
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Requested,
    AwaitingResponse,
    Verified,
    Rejected,
    Cached,
    Discarded,
    Acknowledged,
}

/// Result of one offer refresh against one provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub provider: NodeId,
    pub state: ExchangeState,
    pub accepted: Vec<Hash>,
    pub rejected: usize,
}

impl RefreshOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == ExchangeState::Acknowledged
    }
}

/// Fetch a provider's offers in `[cid_min, cid_max]`, cache the ones that
/// verify, and acknowledge them.
pub async fn refresh_provider_offers<P: ProviderRpc>(
    ctx: &GatewayContext,
    rpc: &P,
    provider: &NodeId,
    cid_min: &ContentId,
    cid_max: &ContentId,
) -> RefreshOutcome {
    let mut outcome = RefreshOutcome {
        provider: *provider,
        state: ExchangeState::Idle,
        accepted: Vec::new(),
        rejected: 0,
    };

    let provider_key = match ctx.registry.signing_key(NodeKind::Provider, provider).await {
        Ok(key) => key,
        Err(e) => {
            warn!(provider = %provider, error = %e, "cannot refresh offers from provider");
            outcome.state = ExchangeState::Discarded;
            return outcome;
        }
    };

    outcome.state = ExchangeState::Requested;
    let request = rpc.list_offers(provider, cid_min, cid_max);
    outcome.state = ExchangeState::AwaitingResponse;
    let offers = match request.await {
        Ok(offers) => offers,
        Err(e) => {
            debug!(provider = %provider, error = %e, "offer list request failed");
            outcome.state = match e {
                GatewayError::Authentication(_) => ExchangeState::Rejected,
                _ => ExchangeState::Discarded,
            };
            return outcome;
        }
    };

    let mut verified = Vec::new();
    for offer in offers {
        let check = if offer.provider_id != *provider {
            Err(GatewayError::Authentication(format!(
                "offer names provider {}",
                offer.provider_id
            )))
        } else {
            offer.validate(&provider_key)
        };
        match check {
            Ok(()) => verified.push(offer),
            Err(e) => {
                warn!(provider = %provider, error = %e, "rejecting offer");
                outcome.rejected += 1;
            }
        }
    }

    if verified.is_empty() {
        debug!(provider = %provider, rejected = outcome.rejected, "no offers to cache");
        outcome.state = if outcome.rejected > 0 {
            ExchangeState::Rejected
        } else {
            ExchangeState::Discarded
        };
        return outcome;
    }
    outcome.state = ExchangeState::Verified;

    let ack = match build_list_ack(ctx, &verified).await {
        Ok(ack) => ack,
        Err(e) => {
            warn!(provider = %provider, error = %e, "cannot sign acknowledgement");
            outcome.state = ExchangeState::Discarded;
            return outcome;
        }
    };

    for offer in verified {
        outcome.accepted.push(offer.merkle_root);
        ctx.offers.insert(offer).await;
    }
    outcome.state = ExchangeState::Cached;

    match rpc.acknowledge_offers(provider, ack).await {
        Ok(()) => {
            outcome.state = ExchangeState::Acknowledged;
            info!(
                provider = %provider,
                accepted = outcome.accepted.len(),
                rejected = outcome.rejected,
                "provider offers cached"
            );
        }
        Err(e) => debug!(provider = %provider, error = %e, "acknowledgement not delivered"),
    }
    outcome
}

async fn build_list_ack(ctx: &GatewayContext, offers: &[CidGroupOffer]) -> Result<Envelope> {
    let (keypair, key_version) = ctx.keys.current().await?;
    let versions = &ctx.config.protocol;
    let acks = offers
        .iter()
        .map(|offer| {
            let ack = offer.acknowledge(&keypair, key_version)?;
            Message::ProviderOfferAck(ack).to_signed_envelope(versions, &keypair, key_version)
        })
        .collect::<Result<Vec<_>>>()?;
    Message::GatewayListOffersAck(ListOffersAck {
        gateway_id: ctx.gateway_id(),
        acks,
    })
    .to_signed_envelope(versions, &keypair, key_version)
}

/// Refresh every registered provider over the full CID range.
pub async fn refresh_all_providers<P: ProviderRpc>(ctx: &GatewayContext, rpc: &P) -> Vec<RefreshOutcome> {
    let (cid_min, cid_max) = ContentId::full_range();
    let mut outcomes = Vec::new();
    for record in ctx.registry.all_providers().await {
        let Ok(provider) = record.id() else {
            continue;
        };
        outcomes.push(refresh_provider_offers(ctx, rpc, &provider, &cid_min, &cid_max).await);
    }
    outcomes
}

// ============================================================================
// Client DHT Discovery (fan-out)
// ============================================================================

/// Query the gateways nearest the CID concurrently. `None` means the
/// deadline had passed on arrival.
pub async fn dht_discover<G: GatewayRpc>(
    ctx: &GatewayContext,
    gateways: &Arc<G>,
    request: &DhtDiscoverRequest,
) -> Option<DhtDiscoverResponse> {
    if now_secs() > request.ttl {
        debug!(cid = %request.cid, "dht discovery past ttl, dropping");
        return None;
    }

    let target = request.cid.to_node_id();
    let fanout = (request.num_dht as usize).min(ctx.config.max_dht_fanout);
    let targets = ctx.closest.nearest_to(&target, fanout).await;
    let query_timeout = ctx.config.dial_timeout + ctx.config.tcp_inactivity_timeout;

    let mut join_set = JoinSet::new();
    for (idx, gateway) in targets.iter().copied().enumerate() {
        let rpc = gateways.clone();
        let cid = request.cid.clone();
        let (nonce, ttl) = (request.nonce, request.ttl);
        join_set.spawn(async move {
            let result = tokio::time::timeout(query_timeout, rpc.dht_discover(&gateway, &cid, nonce, ttl))
                .await
                .unwrap_or_else(|_| Err(GatewayError::Transport("query timed out".into())));
            (idx, gateway, result)
        });
    }

    let mut answered: Vec<Option<ContactedGateway>> = vec![None; targets.len()];
    let mut unreachable = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok((idx, gateway, result)) = joined else {
            continue;
        };
        match result {
            Ok(response) => {
                answered[idx] = Some(ContactedGateway {
                    gateway_id: gateway,
                    response,
                })
            }
            Err(e) => {
                debug!(gateway = %gateway, error = %e, "gateway unreachable for dht discovery");
                unreachable.push(gateway);
            }
        }
    }
    let unreachable = sort_closest(&target, unreachable);

    Some(DhtDiscoverResponse {
        cid: request.cid.clone(),
        nonce: request.nonce,
        contacted: answered.into_iter().flatten().collect(),
        unreachable,
    })
}
