use crate::registry::ExecutableHandle;
use crate::shared::ids::hex_encode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type CachedOutput = Arc<dyn Any + Send + Sync>;

/// Process-lifetime memo of node outputs keyed by node identity and arguments.
#[derive(Default)]
pub struct NodeCache {
    entries: Mutex<HashMap<String, CachedOutput>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of a node within one compiled workflow revision.
    pub fn node_identity(handle: &ExecutableHandle, node_id: &str) -> String {
        format!("{}:{}", handle.source_digest, node_id)
    }

    /// `serde_json` maps are ordered, so equal arguments render identically.
    pub fn key(node_identity: &str, arguments: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(node_identity.as_bytes());
        hasher.update([0u8]);
        hasher.update(arguments.to_string().as_bytes());
        hex_encode(&hasher.finalize())
    }

    pub fn get_or_compute<T, E, F>(
        &self,
        node_identity: &str,
        arguments: &Value,
        compute: F,
    ) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        let key = Self::key(node_identity, arguments);
        let existing = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(value) = existing.and_then(|entry| entry.downcast::<T>().ok()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = Arc::new(compute()?);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.clone());
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
