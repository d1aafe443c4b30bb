//! # Proximity Engine
//!
//! XOR-metric placement of gateways and CIDs on one 256-bit keyspace, and
//! the background task that keeps this gateway's list of live peers sorted by
//! closeness.
//!
//! ## Ordering
//!
//! `distance(a, b) = a XOR b`, compared as a big-endian 256-bit integer.
//! [`sort_closest`] orders ascending by distance from an origin and breaks
//! ties by raw id bytes, so the output is deterministic and a permutation of
//! the input.
//!
//! ## Refresh Cycle
//!
//! | Step | Behavior |
//! |------|----------|
//! | Enumerate | every registered gateway except ourselves |
//! | Ping | signed ping to all of them concurrently, each under a timeout |
//! | Filter | unreachable, slow or not-alive peers are excluded, never fatal |
//! | Sort | survivors by distance from our own id |
//! | Publish | one write swaps the shared `Arc<Vec<NodeId>>` |
//!
//! Readers take a snapshot `Arc` and never observe a half-built list.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::gateway::GatewayContext;
use crate::identity::{NODE_ID_LEN, NodeId, distance_cmp, now_secs};
use crate::protocols::GatewayRpc;

pub type Distance = [u8; NODE_ID_LEN];

#[inline]
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    a.xor_distance(b)
}

fn closer(origin: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&distance(origin, a), &distance(origin, b)).then_with(|| a.cmp(b))
}

/// Sort `candidates` ascending by XOR distance from `origin`.
pub fn sort_closest(origin: &NodeId, mut candidates: Vec<NodeId>) -> Vec<NodeId> {
    candidates.sort_by(|a, b| closer(origin, a, b));
    candidates
}

/// The `n` candidates nearest to `target`.
pub fn nearest(target: &NodeId, candidates: &[NodeId], n: usize) -> Vec<NodeId> {
    let mut sorted = sort_closest(target, candidates.to_vec());
    sorted.truncate(n);
    sorted
}

/// Live peer gateways ordered by distance from this gateway.
#[derive(Default)]
pub struct ClosestGateways {
    inner: RwLock<Arc<Vec<NodeId>>>,
}

impl ClosestGateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<Vec<NodeId>> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, sorted: Vec<NodeId>) {
        *self.inner.write().await = Arc::new(sorted);
    }

    /// The `n` listed gateways nearest to `target` (typically a CID's
    /// keyspace position).
    pub async fn nearest_to(&self, target: &NodeId, n: usize) -> Vec<NodeId> {
        nearest(target, &self.snapshot().await, n)
    }
}

/// Ping every registered gateway and publish the live ones, sorted.
/// Returns how many gateways made the list.
pub async fn refresh_closest_gateways<G: GatewayRpc>(ctx: &GatewayContext, pinger: &Arc<G>) -> usize {
    let self_id = ctx.gateway_id();
    let ping_timeout = ctx.config.dial_timeout + ctx.config.tcp_inactivity_timeout;
    let ttl = now_secs() + ctx.config.ping_ttl_secs;

    let mut join_set = JoinSet::new();
    for record in ctx.registry.all_gateways().await {
        let Ok(id) = record.id() else {
            debug!(node = %record.node_id, "skipping gateway with malformed id");
            continue;
        };
        if id == self_id {
            continue;
        }
        let pinger = pinger.clone();
        join_set.spawn(async move {
            let result = tokio::time::timeout(ping_timeout, pinger.ping(&id, ttl)).await;
            let alive = match result {
                Ok(Ok(pong)) => pong.is_alive,
                Ok(Err(e)) => {
                    trace!(gateway = %id, error = %e, "ping failed");
                    false
                }
                Err(_) => {
                    trace!(gateway = %id, "ping timed out");
                    false
                }
            };
            (id, alive)
        });
    }

    let mut alive = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok((id, true)) = joined {
            alive.push(id);
        }
    }

    let sorted = sort_closest(&self_id, alive);
    let count = sorted.len();
    ctx.closest.replace(sorted).await;
    debug!(live = count, "closest gateways refreshed");
    count
}

/// Run [`refresh_closest_gateways`] every `interval`, starting immediately.
pub fn spawn_refresh_task<G: GatewayRpc>(
    ctx: Arc<GatewayContext>,
    pinger: Arc<G>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "closest-gateway refresh started");
        loop {
            ticker.tick().await;
            refresh_closest_gateways(&ctx, &pinger).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::cid::ContentId;
    use crate::config::GatewayConfig;
    use crate::error::{GatewayError, Result};
    use crate::messages::{Envelope, PingResponse};
    use crate::registry::{NodeKind, RegisteredNode};

    fn id(last: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[31] = last;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::derive(b"a");
        let b = NodeId::derive(b"b");
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn sort_closest_orders_by_xor() {
        let origin = id(0b0000_0100);
        let sorted = sort_closest(&origin, vec![id(0b0000_0000), id(0b0000_0101), id(0b1000_0000), id(0b0000_0110)]);
        // distances: 4, 1, 132, 2
        assert_eq!(sorted, vec![id(0b0000_0101), id(0b0000_0110), id(0b0000_0000), id(0b1000_0000)]);
    }

    #[test]
    fn sort_closest_is_a_deterministic_permutation() {
        let origin = NodeId::derive(b"origin");
        let input: Vec<NodeId> = (0..50u32).map(|i| NodeId::derive(&i.to_be_bytes())).collect();
        let mut reversed = input.clone();
        reversed.reverse();

        let a = sort_closest(&origin, input.clone());
        let b = sort_closest(&origin, reversed);
        assert_eq!(a, b);

        let mut sorted_input = input;
        sorted_input.sort();
        let mut sorted_output = a.clone();
        sorted_output.sort();
        assert_eq!(sorted_input, sorted_output);

        for pair in a.windows(2) {
            assert_ne!(
                distance_cmp(&distance(&origin, &pair[0]), &distance(&origin, &pair[1])),
                Ordering::Greater
            );
        }
    }

    #[test]
    fn duplicates_stay_adjacent() {
        let origin = id(1);
        let sorted = sort_closest(&origin, vec![id(9), id(3), id(9), id(3)]);
        assert_eq!(sorted, vec![id(3), id(3), id(9), id(9)]);
    }

    #[test]
    fn nearest_truncates() {
        let all: Vec<NodeId> = (1..=10).map(id).collect();
        assert_eq!(nearest(&id(1), &all, 3), vec![id(1), id(3), id(2)]);
        assert_eq!(nearest(&id(1), &all, 100).len(), 10);
    }

    // ------------------------------------------------------------------------
    // Refresh against an in-memory network
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct TestNetwork {
        failures: Mutex<HashSet<NodeId>>,
        latencies: Mutex<HashMap<NodeId, Duration>>,
        pings: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl GatewayRpc for TestNetwork {
        async fn ping(&self, gateway: &NodeId, _ttl: i64) -> Result<PingResponse> {
            self.pings.lock().await.push(*gateway);
            if let Some(delay) = self.latencies.lock().await.get(gateway).copied() {
                tokio::time::sleep(delay).await;
            }
            if self.failures.lock().await.contains(gateway) {
                return Err(GatewayError::Transport("injected network failure".into()));
            }
            Ok(PingResponse {
                nonce: 0,
                is_alive: true,
            })
        }

        async fn dht_discover(
            &self,
            _gateway: &NodeId,
            _cid: &ContentId,
            _nonce: i64,
            _ttl: i64,
        ) -> Result<Envelope> {
            Err(GatewayError::Unsupported("not used by refresh".into()))
        }
    }

    async fn context_with_gateways(self_id: NodeId, peers: &[NodeId]) -> Arc<GatewayContext> {
        let mut config = GatewayConfig::default().with_gateway_id(self_id);
        config.dial_timeout = Duration::from_millis(50);
        config.tcp_inactivity_timeout = Duration::from_millis(50);
        let ctx = Arc::new(GatewayContext::new(config));
        let mut records: Vec<RegisteredNode> = peers
            .iter()
            .map(|p| RegisteredNode {
                node_id: p.to_hex(),
                ..Default::default()
            })
            .collect();
        records.push(RegisteredNode {
            node_id: self_id.to_hex(),
            ..Default::default()
        });
        ctx.registry.seed(NodeKind::Gateway, records).await;
        ctx
    }

    #[tokio::test]
    async fn refresh_excludes_failed_and_slow_peers() {
        let me = id(0);
        let peers: Vec<NodeId> = (1..=6).map(id).collect();
        let ctx = context_with_gateways(me, &peers).await;

        let network = Arc::new(TestNetwork::default());
        network.failures.lock().await.insert(id(2));
        network
            .latencies
            .lock()
            .await
            .insert(id(5), Duration::from_secs(5));

        let live = refresh_closest_gateways(&ctx, &network).await;
        assert_eq!(live, 4);
        assert_eq!(
            *ctx.closest.snapshot().await,
            vec![id(1), id(3), id(4), id(6)]
        );

        let pinged = network.pings.lock().await.clone();
        assert_eq!(pinged.len(), 6);
        assert!(!pinged.contains(&me));
    }

    #[tokio::test]
    async fn snapshot_taken_before_refresh_is_unchanged() {
        let me = id(0);
        let ctx = context_with_gateways(me, &[id(1), id(2)]).await;
        let network = Arc::new(TestNetwork::default());

        refresh_closest_gateways(&ctx, &network).await;
        let before = ctx.closest.snapshot().await;

        network.failures.lock().await.insert(id(1));
        refresh_closest_gateways(&ctx, &network).await;

        assert_eq!(*before, vec![id(1), id(2)]);
        assert_eq!(*ctx.closest.snapshot().await, vec![id(2)]);
    }

    #[tokio::test]
    async fn nearest_to_uses_target_not_self() {
        let closest = ClosestGateways::new();
        closest.replace(vec![id(1), id(2), id(8)]).await;
        assert_eq!(closest.nearest_to(&id(9), 1).await, vec![id(8)]);
    }
}
