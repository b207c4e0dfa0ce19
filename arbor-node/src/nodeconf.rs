//! The static node table and the space → responsible-nodes mapping.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// One node in the configured cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub peer_id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Derives which nodes are responsible for a space by rendezvous hashing
/// over the configured node table: every node scores `fnv64(peer_id, space)`
/// and the top `replication` scores win. Deterministic across the cluster
/// for any table order.
#[derive(Debug)]
pub struct NodeConf {
    nodes: Vec<NodeInfo>,
    replication: usize,
}

impl NodeConf {
    pub fn new(nodes: Vec<NodeInfo>, replication: usize) -> Self {
        NodeConf {
            nodes,
            replication: replication.max(1),
        }
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// The responsible node ids for `space_id`, highest score first.
    pub fn node_ids(&self, space_id: &str) -> Vec<String> {
        let mut scored: Vec<(u64, &str)> = self
            .nodes
            .iter()
            .map(|node| (score(&node.peer_id, space_id), node.peer_id.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(self.replication)
            .map(|(_, id)| id.to_string())
            .collect()
    }

    /// Whether `peer_id` is responsible for `space_id`.
    pub fn is_responsible(&self, peer_id: &str, space_id: &str) -> bool {
        self.node_ids(space_id).iter().any(|id| id == peer_id)
    }
}

fn score(peer_id: &str, space_id: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(peer_id.as_bytes());
    hasher.write(&[0]);
    hasher.write(space_id.as_bytes());
    hasher.finish()
}
