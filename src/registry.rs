//! # Node Registry
//!
//! Concurrent store of the gateways and providers this node knows about,
//! populated from the registrar at start-up and by admin enrollment.
//!
//! ## Layout
//!
//! Two independent maps, one per [`NodeKind`], each behind its own
//! `tokio::sync::RwLock` and keyed by the canonical lower-case hex NodeId.
//! Records are stored as `Arc<RegisteredNode>` so readers can hold one past
//! the lock without copying it.
//!
//! ## Enrollment
//!
//! | Stored record | Incoming record | Outcome | Write lock taken |
//! |---------------|-----------------|---------|------------------|
//! | none | any | `Inserted` | yes |
//! | equal | equal | `Unchanged` | no, stored `Arc` untouched |
//! | differs | any | `Updated` | yes |
//!
//! The comparison runs under the read lock; the write lock is acquired
//! afresh and the comparison repeated before replacing.
//!
//! ## Key Material
//!
//! Records keep keys as the hex strings the registrar publishes. They are
//! parsed every time they are used, so a record with a malformed key can never
//! authenticate anything.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::identity::{KeyStore, NodeId, PublicKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Gateway,
    Provider,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Gateway => write!(f, "gateway"),
            NodeKind::Provider => write!(f, "provider"),
        }
    }
}

/// Which of a node's published endpoints to dial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkRole {
    Gateway,
    Provider,
    Client,
    Admin,
}

/// Per-role `host:port` endpoints a node publishes. Empty when not served.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub admin: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredNode {
    pub node_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub root_signing_key: String,
    pub signing_key: String,
    #[serde(default)]
    pub region_code: String,
    #[serde(default)]
    pub network_info: NetworkInfo,
}

impl RegisteredNode {
    pub fn id(&self) -> Result<NodeId> {
        NodeId::from_hex(&self.node_id)
    }

    pub fn signing_key(&self) -> Result<PublicKey> {
        PublicKey::from_hex(&self.signing_key)
    }

    pub fn root_signing_key(&self) -> Result<PublicKey> {
        PublicKey::from_hex(&self.root_signing_key)
    }

    /// Endpoint for `role`, or `NotFound` when the node does not serve it.
    pub fn endpoint(&self, role: NetworkRole) -> Result<&str> {
        let addr = match role {
            NetworkRole::Gateway => &self.network_info.gateway,
            NetworkRole::Provider => &self.network_info.provider,
            NetworkRole::Client => &self.network_info.client,
            NetworkRole::Admin => &self.network_info.admin,
        };
        if addr.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "node {} publishes no {:?} endpoint",
                self.node_id, role
            )));
        }
        Ok(addr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollOutcome {
    Inserted,
    Updated,
    Unchanged,
}

type NodeMap = RwLock<HashMap<String, Arc<RegisteredNode>>>;

pub struct NodeRegistry {
    gateways: NodeMap,
    providers: NodeMap,
    keys: Arc<KeyStore>,
}

impl NodeRegistry {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self {
            gateways: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            keys,
        }
    }

    fn map(&self, kind: NodeKind) -> &NodeMap {
        match kind {
            NodeKind::Gateway => &self.gateways,
            NodeKind::Provider => &self.providers,
        }
    }

    /// Admin enrollment. Requires this gateway to hold installed key material.
    pub async fn enroll(&self, kind: NodeKind, record: RegisteredNode) -> Result<EnrollOutcome> {
        if !self.keys.is_installed().await {
            return Err(GatewayError::NotInitialised);
        }
        self.upsert(kind, record).await
    }

    /// Load records from the registrar. Malformed records are skipped.
    /// Returns how many records were inserted or updated.
    pub async fn seed(&self, kind: NodeKind, records: Vec<RegisteredNode>) -> usize {
        let mut changed = 0;
        for record in records {
            let node_id = record.node_id.clone();
            match self.upsert(kind, record).await {
                Ok(EnrollOutcome::Unchanged) => {}
                Ok(_) => changed += 1,
                Err(e) => warn!(kind = %kind, node = %node_id, error = %e, "skipping registrar record"),
            }
        }
        changed
    }

    async fn upsert(&self, kind: NodeKind, mut record: RegisteredNode) -> Result<EnrollOutcome> {
        let key = record.id()?.to_hex();
        record.node_id = key.clone();
        let map = self.map(kind);

        {
            let guard = map.read().await;
            if let Some(existing) = guard.get(&key)
                && **existing == record
            {
                return Ok(EnrollOutcome::Unchanged);
            }
        }

        let mut guard = map.write().await;
        let outcome = match guard.get(&key) {
            Some(existing) if **existing == record => return Ok(EnrollOutcome::Unchanged),
            Some(_) => EnrollOutcome::Updated,
            None => EnrollOutcome::Inserted,
        };
        guard.insert(key.clone(), Arc::new(record));
        debug!(kind = %kind, node = %key, outcome = ?outcome, "registry record stored");
        Ok(outcome)
    }

    pub async fn lookup(&self, kind: NodeKind, id: &NodeId) -> Result<Arc<RegisteredNode>> {
        self.map(kind)
            .read()
            .await
            .get(&id.to_hex())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("{} {} not registered", kind, id)))
    }

    /// Registered signing key of `id`, validated on every call.
    pub async fn signing_key(&self, kind: NodeKind, id: &NodeId) -> Result<PublicKey> {
        self.lookup(kind, id).await?.signing_key()
    }

    pub async fn all_gateways(&self) -> Vec<Arc<RegisteredNode>> {
        self.gateways.read().await.values().cloned().collect()
    }

    pub async fn all_providers(&self) -> Vec<Arc<RegisteredNode>> {
        self.providers.read().await.values().cloned().collect()
    }

    pub async fn len(&self, kind: NodeKind) -> usize {
        self.map(kind).read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{KeyVersion, Keypair};

    fn record(seed: &[u8], key: &Keypair) -> RegisteredNode {
        RegisteredNode {
            node_id: NodeId::derive(seed).to_hex(),
            address: "10.0.0.1".to_string(),
            root_signing_key: key.public_key().to_hex(),
            signing_key: key.public_key().to_hex(),
            region_code: "AU".to_string(),
            network_info: NetworkInfo {
                gateway: "10.0.0.1:9012".to_string(),
                ..Default::default()
            },
        }
    }

    async fn initialised_registry() -> NodeRegistry {
        let keys = Arc::new(KeyStore::new());
        keys.install(Keypair::generate(), KeyVersion::initial()).await;
        NodeRegistry::new(keys)
    }

    #[tokio::test]
    async fn enroll_requires_installed_key() {
        let registry = NodeRegistry::new(Arc::new(KeyStore::new()));
        let kp = Keypair::generate();
        let result = registry.enroll(NodeKind::Gateway, record(b"g1", &kp)).await;
        assert!(matches!(result, Err(GatewayError::NotInitialised)));
        assert_eq!(registry.len(NodeKind::Gateway).await, 0);
    }

    #[tokio::test]
    async fn identical_enrollment_keeps_stored_arc() {
        let registry = initialised_registry().await;
        let kp = Keypair::generate();
        let rec = record(b"g1", &kp);
        let id = rec.id().unwrap();

        assert_eq!(
            registry.enroll(NodeKind::Gateway, rec.clone()).await.unwrap(),
            EnrollOutcome::Inserted
        );
        let before = registry.lookup(NodeKind::Gateway, &id).await.unwrap();

        assert_eq!(
            registry.enroll(NodeKind::Gateway, rec.clone()).await.unwrap(),
            EnrollOutcome::Unchanged
        );
        let after = registry.lookup(NodeKind::Gateway, &id).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        let mut changed = rec;
        changed.region_code = "NZ".to_string();
        assert_eq!(
            registry.enroll(NodeKind::Gateway, changed).await.unwrap(),
            EnrollOutcome::Updated
        );
        let replaced = registry.lookup(NodeKind::Gateway, &id).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &replaced));
        assert_eq!(replaced.region_code, "NZ");
    }

    #[tokio::test]
    async fn ids_are_canonicalised() {
        let registry = initialised_registry().await;
        let kp = Keypair::generate();
        let mut rec = record(b"g1", &kp);
        let id = rec.id().unwrap();
        rec.node_id = format!("0x{}", rec.node_id.to_uppercase());

        registry.enroll(NodeKind::Provider, rec).await.unwrap();
        let stored = registry.lookup(NodeKind::Provider, &id).await.unwrap();
        assert_eq!(stored.node_id, id.to_hex());
    }

    #[tokio::test]
    async fn gateway_and_provider_maps_are_separate() {
        let registry = initialised_registry().await;
        let kp = Keypair::generate();
        let rec = record(b"n1", &kp);
        let id = rec.id().unwrap();

        registry.enroll(NodeKind::Gateway, rec).await.unwrap();
        assert!(registry.lookup(NodeKind::Gateway, &id).await.is_ok());
        assert!(matches!(
            registry.lookup(NodeKind::Provider, &id).await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(registry.all_gateways().await.len(), 1);
        assert!(registry.all_providers().await.is_empty());
    }

    #[tokio::test]
    async fn seed_skips_malformed_records_without_key() {
        let registry = NodeRegistry::new(Arc::new(KeyStore::new()));
        let kp = Keypair::generate();
        let mut bad = record(b"bad", &kp);
        bad.node_id = "not hex".to_string();

        let changed = registry
            .seed(NodeKind::Gateway, vec![record(b"a", &kp), bad, record(b"b", &kp)])
            .await;
        assert_eq!(changed, 2);
        assert_eq!(registry.seed(NodeKind::Gateway, vec![record(b"a", &kp)]).await, 0);
    }

    #[tokio::test]
    async fn malformed_stored_key_cannot_authenticate() {
        let registry = initialised_registry().await;
        let kp = Keypair::generate();
        let mut rec = record(b"g1", &kp);
        rec.signing_key = "00".repeat(31);
        let id = rec.id().unwrap();
        registry.enroll(NodeKind::Gateway, rec).await.unwrap();

        assert!(registry.signing_key(NodeKind::Gateway, &id).await.is_err());
    }

    #[test]
    fn endpoint_reports_missing_roles() {
        let kp = Keypair::generate();
        let rec = record(b"g1", &kp);
        assert_eq!(rec.endpoint(NetworkRole::Gateway).unwrap(), "10.0.0.1:9012");
        assert!(rec.endpoint(NetworkRole::Provider).is_err());
    }
}
