//! Connection pool for reusing TCP connections to follower nodes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;

/// A pool of TCP connections keyed by `host:port`.
pub struct SockfdCache {
    pool: Arc<DashMap<String, Vec<TcpStream>>>,
    max_per_node: usize,
}

impl SockfdCache {
    pub fn new(max_per_node: usize) -> Self {
        Self {
            pool: Arc::new(DashMap::new()),
            max_per_node,
        }
    }

    /// Get a cached connection to the given node, or None.
    pub fn get(&self, addr: &str) -> Option<TcpStream> {
        let mut entry = self.pool.get_mut(addr)?;
        entry.pop()
    }

    /// Return a connection to the pool for reuse.
    pub fn put(&self, addr: &str, stream: TcpStream) {
        let mut entry = self.pool.entry(addr.to_string()).or_default();
        if entry.len() < self.max_per_node {
            entry.push(stream);
        }
        // Drop the stream if pool is full
    }

    /// Number of idle connections cached for a node.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.pool.get(addr).map(|e| e.len()).unwrap_or(0)
    }

    /// Clear all cached connections for a node.
    pub fn clear_node(&self, addr: &str) {
        self.pool.remove(addr);
    }

    /// Clear all cached connections.
    pub fn clear_all(&self) {
        self.pool.clear();
    }
}
