use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobId};
use crate::node::NodeId;
use crate::task::TaskId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
    /// Atributos del nodo que tienen que coincidir en todo el cluster,
    /// ej: "failover:max_attempts".
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: NodeId,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Tareas ya terminadas (o canceladas) con jobs corriendo en este worker.
    #[serde(default)]
    pub cancelled_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignmentRequest {
    pub worker_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignmentResponse {
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteRequest {
    pub worker_id: NodeId,
    pub job_id: JobId,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompleteResponse {
    pub ok: bool,
}

/// Un worker ocioso pide robar jobs encolados en otros nodos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StealRequest {
    pub worker_id: NodeId,
    pub max_jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StealResponse {
    pub stolen: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: NodeId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub queued_jobs: u32,
    pub active_jobs: u32,
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_stolen: u64,
    pub avg_job_ms: Option<f64>,
    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

/* --------- Sesión de tarea --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSetRequest {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWaitRequest {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttribute {
    pub key: String,
    pub value: Option<Value>,
}
