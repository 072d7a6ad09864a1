//! TTL cache of node metadata
//!
//! Every FUSE `getattr`, `read` and `write` needs the node's state to know
//! whether the path is a stub. This cache keeps those lookups off SQLite.
//! Entries are only written while the path's I/O lock is held, which is
//! also where every metadata commit happens, so a cached entry is never
//! older than the store.

use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use crate::database::models::{Node, NodeKey};

/// Configuration for the node cache
#[derive(Debug, Clone)]
pub struct NodeCacheConfig {
    /// Maximum number of cached nodes
    pub max_entries: u64,
    /// Time-to-live of an entry in seconds
    pub ttl_secs: u64,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 60,
        }
    }
}

#[derive(Clone)]
pub struct NodeCache {
    nodes: Cache<NodeKey, Node>,
    config: NodeCacheConfig,
}

impl NodeCache {
    pub fn new(config: NodeCacheConfig) -> Self {
        Self {
            nodes: Cache::builder()
                .time_to_live(Duration::from_secs(config.ttl_secs))
                .max_capacity(config.max_entries)
                .build(),
            config,
        }
    }

    pub fn get(&self, key: &NodeKey) -> Option<Node> {
        self.nodes.get(&Self::normalize_key(key))
    }

    pub fn put(&self, node: &Node) {
        self.nodes
            .insert(Self::normalize_key(&node.key()), node.clone());
    }

    pub fn invalidate(&self, key: &NodeKey) {
        self.nodes.invalidate(&Self::normalize_key(key));
    }

    pub fn stats(&self) -> CacheStats {
        self.nodes.run_pending_tasks();
        CacheStats {
            entries: self.nodes.entry_count(),
            max_entries: self.config.max_entries,
            ttl_secs: self.config.ttl_secs,
        }
    }

    /// Strip leading and trailing separators so `a/b`, `/a/b` and `a/b/` share an entry.
    fn normalize_key(key: &NodeKey) -> NodeKey {
        let trimmed = key.path.trim_matches('/');
        if trimmed.len() == key.path.len() {
            return key.clone();
        }
        NodeKey::new(key.rule_id, trimmed)
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("config", &self.config)
            .field("entries", &self.nodes.entry_count())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub max_entries: u64,
    pub ttl_secs: u64,
}
