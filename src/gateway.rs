//! # Gateway Node
//!
//! [`GatewayContext`] is the state every handler and background task shares:
//! configuration, key material, the node registry, the closest-gateway list,
//! the offer cache, client reputations and the outbound connection pool. It
//! is passed explicitly as an `Arc`; there is no global instance.
//!
//! [`Gateway`] binds the peer and admin TCP listeners and drives the context:
//!
//! ```ignore
//! let gateway = Gateway::bind(GatewayConfig::default()).await?;
//! gateway.install_key(keypair, KeyVersion::initial()).await;
//! gateway.bootstrap(&StaticRegistrar::new("registrar.json")).await?;
//! gateway.refresh_offers().await;
//! gateway.start_background_tasks(Some(Arc::new(registrar))).await;
//! ```
//!
//! ## Background Tasks
//!
//! | Task | Period | Work |
//! |------|--------|------|
//! | Proximity refresh | `refresh_interval` | ping every gateway, publish the sorted live list |
//! | Offer housekeeping | `refresh_interval` | prune expired offers from the cache |
//! | Registrar sync | `registrar_sync_interval` | re-seed both registry maps |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dht::{ClosestGateways, refresh_closest_gateways, spawn_refresh_task};
use crate::discovery::{OfferCache, RefreshOutcome, refresh_all_providers};
use crate::handlers::{Router, Surface};
use crate::identity::{KeyStore, KeyVersion, Keypair, NodeId, now_secs};
use crate::protocols::Registrar;
use crate::registry::{NodeKind, NodeRegistry};
use crate::reputation::ReputationStore;
use crate::rpc::{self, PeerClient};
use crate::transport::ConnectionPool;

pub struct GatewayContext {
    pub config: GatewayConfig,
    pub keys: Arc<KeyStore>,
    pub registry: Arc<NodeRegistry>,
    pub closest: ClosestGateways,
    pub offers: OfferCache,
    pub reputation: ReputationStore,
    pub pool: ConnectionPool,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Self {
        let keys = Arc::new(KeyStore::new());
        let registry = Arc::new(NodeRegistry::new(keys.clone()));
        let pool = ConnectionPool::new(
            registry.clone(),
            config.pool_capacity,
            config.dial_timeout,
            config.max_frame_size,
        );
        Self {
            config,
            keys,
            registry,
            closest: ClosestGateways::new(),
            offers: OfferCache::new(),
            reputation: ReputationStore::new(),
            pool,
        }
    }

    pub fn gateway_id(&self) -> NodeId {
        self.config.gateway_id
    }

    /// Install (or replace) the key this gateway signs with.
    pub async fn install_key(&self, keypair: Keypair, key_version: KeyVersion) {
        info!(
            gateway = %self.gateway_id(),
            public_key = %keypair.public_key().to_hex(),
            key_version = %key_version,
            "signing key installed"
        );
        self.keys.install(keypair, key_version).await;
    }
}

/// Pull both node lists from `registrar` into the registry.
/// Returns how many gateway and provider records changed.
pub async fn sync_registry<R: Registrar + ?Sized>(
    registry: &NodeRegistry,
    registrar: &R,
) -> Result<(usize, usize)> {
    let gateways = registrar
        .fetch_registered_gateways()
        .await
        .context("failed to fetch registered gateways")?;
    let providers = registrar
        .fetch_registered_providers()
        .await
        .context("failed to fetch registered providers")?;
    let changed_gateways = registry.seed(NodeKind::Gateway, gateways).await;
    let changed_providers = registry.seed(NodeKind::Provider, providers).await;
    Ok((changed_gateways, changed_providers))
}

fn spawn_listener(listener: TcpListener, router: Arc<Router<PeerClient>>) -> JoinHandle<()> {
    let surface = router.surface();
    tokio::spawn(async move {
        if let Err(e) = rpc::serve(listener, router).await {
            warn!(surface = ?surface, error = %e, "listener stopped");
        }
    })
}

pub struct Gateway {
    ctx: Arc<GatewayContext>,
    client: Arc<PeerClient>,
    router: Arc<Router<PeerClient>>,
    admin_router: Arc<Router<PeerClient>>,
    local_addr: SocketAddr,
    admin_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Bind the peer listener on `config.bind_addr` and the admin listener
    /// on `config.admin_bind_addr`, then start serving both.
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        let local_addr = listener.local_addr()?;
        let admin_listener = TcpListener::bind(config.admin_bind_addr)
            .await
            .with_context(|| format!("failed to bind admin {}", config.admin_bind_addr))?;
        let admin_addr = admin_listener.local_addr()?;

        let ctx = Arc::new(GatewayContext::new(config));
        let client = Arc::new(PeerClient::new(ctx.clone()));
        let router = Arc::new(Router::new(ctx.clone(), client.clone(), Surface::Peer));
        let admin_router = Arc::new(Router::new(ctx.clone(), client.clone(), Surface::Admin));

        let server = spawn_listener(listener, router.clone());
        let admin_server = spawn_listener(admin_listener, admin_router.clone());

        info!(
            gateway = %ctx.gateway_id(),
            addr = %local_addr,
            admin_addr = %admin_addr,
            "gateway started"
        );
        Ok(Self {
            ctx,
            client,
            router,
            admin_router,
            local_addr,
            admin_addr,
            tasks: Mutex::new(vec![server, admin_server]),
        })
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    pub fn gateway_id(&self) -> NodeId {
        self.ctx.gateway_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub async fn install_key(&self, keypair: Keypair, key_version: KeyVersion) {
        self.ctx.install_key(keypair, key_version).await;
    }

    /// Entry point for envelopes arriving over another transport (HTTP).
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        self.router.handle_bytes(bytes).await
    }

    /// Admin counterpart of [`Gateway::handle_bytes`].
    pub async fn handle_admin_bytes(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        self.admin_router.handle_bytes(bytes).await
    }

    /// Seed the registry from `registrar`.
    pub async fn bootstrap<R: Registrar + ?Sized>(&self, registrar: &R) -> Result<()> {
        let (gateways, providers) = sync_registry(&self.ctx.registry, registrar).await?;
        info!(gateways, providers, "registry bootstrapped");
        Ok(())
    }

    /// Fetch, verify and cache offers from every known provider.
    pub async fn refresh_offers(&self) -> Vec<RefreshOutcome> {
        let outcomes = refresh_all_providers(&self.ctx, self.client.as_ref()).await;
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        info!(
            providers = outcomes.len(),
            succeeded,
            cached_cids = self.ctx.offers.cid_count().await,
            "offer refresh finished"
        );
        outcomes
    }

    /// One proximity refresh, outside the periodic task.
    pub async fn refresh_closest(&self) -> usize {
        refresh_closest_gateways(&self.ctx, &self.client).await
    }

    /// Start proximity refresh and offer housekeeping, plus registrar sync
    /// when a registrar is given and the config enables it.
    pub async fn start_background_tasks(&self, registrar: Option<Arc<dyn Registrar>>) {
        let mut tasks = self.tasks.lock().await;
        let interval = self.ctx.config.refresh_interval;

        tasks.push(spawn_refresh_task(
            self.ctx.clone(),
            self.client.clone(),
            interval,
        ));

        let ctx = self.ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned = ctx.offers.prune_expired(now_secs()).await;
                if pruned > 0 {
                    debug!(pruned, "expired offers pruned");
                }
            }
        }));

        if let (Some(registrar), Some(period)) = (registrar, self.ctx.config.registrar_sync_interval) {
            let ctx = self.ctx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match sync_registry(&ctx.registry, registrar.as_ref()).await {
                        Ok((0, 0)) => {}
                        Ok((gateways, providers)) => {
                            debug!(gateways, providers, "registrar sync updated registry")
                        }
                        Err(e) => warn!(error = %e, "registrar sync failed"),
                    }
                }
            }));
        }
    }

    /// Stop the listener and every background task.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(gateway = %self.gateway_id(), "gateway stopped");
    }
}
