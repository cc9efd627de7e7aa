use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::node::NodeId;

/// Resultado de un job tal como lo reporta el worker que lo ejecutó.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub node_id: NodeId,
    /// Índice del job dentro de la tarea, para reducir en orden.
    pub index: u32,
    pub data: Value,
}
