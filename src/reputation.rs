//! Client reputation scores.
//!
//! A plain integer per client, created at zero the first time the client is
//! seen making a discovery request. Administrators can read it and overwrite
//! it. There is no decay, no bounds and no history.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::identity::NodeId;

#[derive(Default)]
pub struct ReputationStore {
    scores: RwLock<HashMap<NodeId, i64>>,
}

impl ReputationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `client` made a request, creating its entry if needed.
    pub async fn observe(&self, client: &NodeId) {
        if self.scores.read().await.contains_key(client) {
            return;
        }
        let mut scores = self.scores.write().await;
        if !scores.contains_key(client) {
            scores.insert(*client, 0);
            debug!(client = %client, "new client reputation record");
        }
    }

    /// Current score and whether the client is known. Unknown clients read as 0.
    pub async fn get(&self, client: &NodeId) -> (i64, bool) {
        match self.scores.read().await.get(client) {
            Some(score) => (*score, true),
            None => (0, false),
        }
    }

    /// Overwrite an existing client's score. Unknown clients are left
    /// untouched and `false` is returned.
    pub async fn set(&self, client: &NodeId, score: i64) -> bool {
        match self.scores.write().await.get_mut(client) {
            Some(existing) => {
                *existing = score;
                true
            }
            None => false,
        }
    }
}
