//! File-backed [`Registrar`].
//!
//! The registrar file is JSON:
//!
//! ```json
//! {
//!   "gateways":  [ { "node_id": "..", "signing_key": "..", "network_info": { "gateway": "10.0.0.1:9012" } } ],
//!   "providers": [ { "node_id": "..", "signing_key": "..", "network_info": { "provider": "10.0.0.2:9030" } } ]
//! }
//! ```
//!
//! The file is re-read on every fetch, so edits are picked up by the next
//! registrar sync.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocols::Registrar;
use crate::registry::RegisteredNode;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegistrarSnapshot {
    #[serde(default)]
    pub gateways: Vec<RegisteredNode>,
    #[serde(default)]
    pub providers: Vec<RegisteredNode>,
}

#[derive(Clone, Debug)]
pub struct StaticRegistrar {
    path: PathBuf,
}

impl StaticRegistrar {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<RegistrarSnapshot> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read registrar file {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("invalid registrar file {}", self.path.display()))
    }
}

#[async_trait]
impl Registrar for StaticRegistrar {
    async fn fetch_registered_gateways(&self) -> anyhow::Result<Vec<RegisteredNode>> {
        Ok(self.load().await?.gateways)
    }

    async fn fetch_registered_providers(&self) -> anyhow::Result<Vec<RegisteredNode>> {
        Ok(self.load().await?.providers)
    }
}
