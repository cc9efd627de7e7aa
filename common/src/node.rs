use serde::{Deserialize, Serialize};

pub type NodeId = String;

/// Nodo del grid tal como lo ve el master (un worker registrado).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
        }
    }
}

/// Vista de la topología viva del cluster.
///
/// `Ok(None)` significa que el nodo ya no está en el grid (murió o salió).
pub trait TopologyView {
    fn node(&self, id: &NodeId) -> anyhow::Result<Option<Node>>;
}

/// Elige un nodo entre un conjunto de candidatos.
pub trait LoadBalancer: Send + Sync {
    fn balanced_node(&self, candidates: &[Node]) -> anyhow::Result<Option<Node>>;
}

impl TopologyView for Vec<Node> {
    fn node(&self, id: &NodeId) -> anyhow::Result<Option<Node>> {
        Ok(self.iter().find(|n| &n.id == id).cloned())
    }
}
