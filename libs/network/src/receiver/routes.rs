//! Node routes
//!
//! A node may hold several authenticated links at once, spread over
//! different receive servers. Each (node, server) pair carries a link count
//! and the node stays routable while any server still holds a link for it.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Authenticated node id → links held per server index
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<u32, HashMap<usize, usize>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more authenticated link for `node` on `server`
    pub fn link(&self, node: u32, server: usize) {
        let mut routes = self.routes.write();
        *routes.entry(node).or_default().entry(server).or_insert(0) += 1;
    }

    /// Forget one link for `node` on `server`
    ///
    /// The node is dropped once no server holds a link for it.
    pub fn unlink(&self, node: u32, server: usize) {
        let mut routes = self.routes.write();
        let Some(servers) = routes.get_mut(&node) else {
            return;
        };
        if let Some(count) = servers.get_mut(&server) {
            *count -= 1;
            if *count == 0 {
                servers.remove(&server);
            }
        }
        if servers.is_empty() {
            routes.remove(&node);
        }
    }

    /// A server holding a link for `node`, lowest index first
    pub fn server_for(&self, node: u32) -> Option<usize> {
        self.routes
            .read()
            .get(&node)
            .and_then(|servers| servers.keys().min().copied())
    }

    pub fn contains(&self, node: u32) -> bool {
        self.routes.read().contains_key(&node)
    }

    /// Authenticated links currently held for `node`
    pub fn link_count(&self, node: u32) -> usize {
        self.routes
            .read()
            .get(&node)
            .map(|servers| servers.values().sum())
            .unwrap_or(0)
    }
}
