//! Path registry for dynamic interception endpoints
//!
//! Each RemoteSyncer is served at its own path. The syncer reconciler
//! registers and removes pipelines here while the HTTP fallback handler looks
//! them up, so the map sits behind a `tokio::sync::RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::pipeline::DecisionPipeline;
use crate::API_GROUP;

/// Path the apiserver calls for a syncer's intercepted requests
pub fn webhook_path(namespace: &str, name: &str) -> String {
    format!("/{API_GROUP}/validate/{namespace}/{name}")
}

/// Map of webhook path to the pipeline serving it
#[derive(Default)]
pub struct PathRegistry {
    handlers: RwLock<HashMap<String, Arc<DecisionPipeline>>>,
}

impl PathRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the pipeline for `path`. Returns true when the path is new.
    pub async fn register(&self, path: impl Into<String>, pipeline: Arc<DecisionPipeline>) -> bool {
        self.handlers
            .write()
            .await
            .insert(path.into(), pipeline)
            .is_none()
    }

    /// Remove the pipeline for `path`. Returns true when something was removed.
    pub async fn unregister(&self, path: &str) -> bool {
        self.handlers.write().await.remove(path).is_some()
    }

    /// Pipeline serving `path`
    pub async fn get(&self, path: &str) -> Option<Arc<DecisionPipeline>> {
        self.handlers.read().await.get(path).cloned()
    }

    /// Number of registered paths
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// True when nothing is registered
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Registered paths, sorted
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}
