// master/src/state.rs

use common::{
    FailoverCoordinator, Job, JobId, JobResult, Node, NodeId, SessionRegistry, TaskId, TaskInfo,
    TopologyView,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use crate::config::MasterConfig;
use crate::failover::RoundRobinBalancer;

#[derive(Clone)]
pub struct AppState {
    pub grid: Arc<Mutex<GridState>>,
    // mirror autoritativo de las sesiones de todas las tareas
    pub sessions: SessionRegistry,
    pub failover: Arc<FailoverCoordinator>,
    pub balancer: Arc<RoundRobinBalancer>,
    pub config: Arc<MasterConfig>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        let balancer = Arc::new(RoundRobinBalancer::default());
        let failover = Arc::new(FailoverCoordinator::new(config.failover, balancer.clone()));

        Self {
            grid: Arc::new(Mutex::new(GridState::default())),
            sessions: SessionRegistry::new(),
            failover,
            balancer,
            config: Arc::new(config),
        }
    }

    pub fn grid(&self) -> MutexGuard<'_, GridState> {
        self.grid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Todo el estado del coordinador de ejecución. Vive detrás de un único
/// mutex, así las decisiones de failover de un mismo job nunca corren en
/// paralelo.
#[derive(Default)]
pub struct GridState {
    pub tasks: HashMap<TaskId, TaskEntry>,
    pub jobs: HashMap<JobId, JobEntry>,
    pub workers: HashMap<NodeId, WorkerMeta>,
    // jobs encolados por worker, en orden de llegada
    pub queues: HashMap<NodeId, VecDeque<JobId>>,
}

impl GridState {
    /// Workers vivos, ordenados por id.
    pub fn live_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .workers
            .values()
            .filter(|w| !w.dead)
            .map(|w| w.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn is_live(&self, worker_id: &str) -> bool {
        self.workers.get(worker_id).is_some_and(|w| !w.dead)
    }

    pub fn enqueue(&mut self, job_id: &str, worker_id: &str) {
        self.queues
            .entry(worker_id.to_string())
            .or_default()
            .push_back(job_id.to_string());
    }

    pub fn dequeue(&mut self, job_id: &str, worker_id: &str) {
        if let Some(queue) = self.queues.get_mut(worker_id) {
            queue.retain(|id| id != job_id);
        }
    }

    pub fn running_on(&self, worker_id: &str) -> usize {
        self.jobs
            .values()
            .filter(|j| j.node_id == worker_id && matches!(j.state, JobState::Running { .. }))
            .count()
    }

    pub fn queued_on(&self, worker_id: &str) -> usize {
        self.queues.get(worker_id).map_or(0, VecDeque::len)
    }
}

impl TopologyView for GridState {
    fn node(&self, id: &NodeId) -> anyhow::Result<Option<Node>> {
        Ok(self
            .workers
            .get(id)
            .filter(|w| !w.dead)
            .map(|w| w.node.clone()))
    }
}

pub struct TaskEntry {
    pub info: TaskInfo,
    // jobs que todavía no terminaron ni se abandonaron
    pub open_jobs: HashSet<JobId>,
    pub results: Vec<JobResult>,
}

#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job: Job,
    /// Posición del job dentro de la tarea.
    pub index: u32,
    /// Worker que tiene el job ahora (en cola o ejecutándolo).
    pub node_id: NodeId,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Queued,
    Running { started_at: SystemTime },
    Finished,
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub node: Node,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_stolen: u64,
    pub total_job_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(node: Node, max_concurrency: u32) -> Self {
        Self {
            node,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency: max_concurrency.max(1),
            jobs_started: 0,
            jobs_succeeded: 0,
            jobs_failed: 0,
            jobs_stolen: 0,
            total_job_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use common::FailoverConfig;

    pub fn test_state(max_failover_attempts: i64) -> AppState {
        AppState::new(MasterConfig {
            failover: FailoverConfig::new(max_failover_attempts).unwrap(),
            ..Default::default()
        })
    }

    pub fn add_worker(state: &AppState, id: &str, max_concurrency: u32) {
        state.grid().workers.insert(
            id.to_string(),
            WorkerMeta::new(Node::new(id, format!("host-{id}")), max_concurrency),
        );
    }
}
