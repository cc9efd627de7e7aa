use std::time::SystemTime;

use common::{
    GridError, JobId, Node, NodeId, TaskId, WorkerHeartbeatRequest, WorkerMetrics,
    WorkerRegisterRequest,
};
use tracing::{info, warn};

use crate::scheduler::cancelled_tasks_on;
use crate::state::{AppState, GridState, JobState, WorkerMeta};

/// Registra un worker nuevo. Rechaza nodos cuya configuración de failover
/// no coincide con la del master.
pub fn register(state: &AppState, req: WorkerRegisterRequest) -> Result<NodeId, GridError> {
    if let Err(e) = state.failover.check_consistency(&req.attributes) {
        warn!("registro rechazado para {}: {}", req.hostname, e);
        return Err(e.into());
    }

    let worker_id = uuid::Uuid::new_v4().to_string();
    let node = Node::new(worker_id.clone(), req.hostname);

    state
        .grid()
        .workers
        .insert(worker_id.clone(), WorkerMeta::new(node, req.max_concurrency));

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Ok(worker_id)
}

/// Actualiza el heartbeat y devuelve las tareas terminadas que el worker
/// todavía ejecuta, para que las cancele.
pub fn heartbeat(state: &AppState, req: WorkerHeartbeatRequest) -> Result<Vec<TaskId>, GridError> {
    let mut grid = state.grid();
    match grid.workers.get_mut(&req.worker_id) {
        Some(meta) if !meta.dead => {
            meta.last_heartbeat = SystemTime::now();
            meta.last_cpu_percent = Some(req.cpu_percent);
            meta.last_mem_bytes = Some(req.mem_bytes);
        }
        // un worker dado por muerto tiene que volver a registrarse
        _ => return Err(GridError::WorkerNotFound(req.worker_id)),
    }
    Ok(cancelled_tasks_on(&grid, &req.worker_id))
}

pub fn list_workers(state: &AppState) -> Vec<WorkerMetrics> {
    let now = SystemTime::now();
    let grid = state.grid();

    let mut out: Vec<WorkerMetrics> = grid
        .workers
        .iter()
        .map(|(wid, meta)| {
            let age_secs = now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs();

            let avg_ms = if meta.jobs_succeeded > 0 {
                Some(meta.total_job_time_ms as f64 / meta.jobs_succeeded as f64)
            } else {
                None
            };

            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.node.hostname.clone(),
                dead: meta.dead,
                max_concurrency: meta.max_concurrency,
                last_heartbeat_secs_ago: age_secs,
                queued_jobs: grid.queued_on(wid) as u32,
                active_jobs: grid.running_on(wid) as u32,
                jobs_started: meta.jobs_started,
                jobs_succeeded: meta.jobs_succeeded,
                jobs_failed: meta.jobs_failed,
                jobs_stolen: meta.jobs_stolen,
                avg_job_ms: avg_ms,
                last_cpu_percent: meta.last_cpu_percent,
                last_mem_bytes: meta.last_mem_bytes,
            }
        })
        .collect();

    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    out
}

impl GridState {
    /// Marca el worker como muerto y pasa por failover todos sus jobs, en
    /// cola o en ejecución. Devuelve cuántos jobs se movieron.
    pub fn worker_lost(
        &mut self,
        worker_id: &str,
        coordinator: &common::FailoverCoordinator,
        sessions: &common::SessionRegistry,
    ) -> usize {
        match self.workers.get_mut(worker_id) {
            Some(meta) if !meta.dead => meta.dead = true,
            _ => return 0,
        }

        let mut orphans: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, j)| {
                j.node_id == worker_id
                    && matches!(j.state, JobState::Queued | JobState::Running { .. })
            })
            .map(|(id, _)| id.clone())
            .collect();
        orphans.sort();

        info!(
            "worker {} perdido, {} jobs pasan por failover",
            worker_id,
            orphans.len()
        );

        let mut moved = 0;
        for job_id in &orphans {
            if self.fail_over_job(job_id, coordinator, sessions).is_ok() {
                moved += 1;
            }
        }
        self.queues.remove(worker_id);
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{next_job, submit_task, task_info};
    use crate::state::testing::{add_worker, test_state};
    use common::{JobSpec, Reducer, ResultPolicy, TaskRequest, TaskStatus};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn register_req(max: Value) -> WorkerRegisterRequest {
        WorkerRegisterRequest {
            hostname: "nodo".to_string(),
            max_concurrency: 2,
            attributes: BTreeMap::from([("failover:max_attempts".to_string(), max)]),
        }
    }

    #[test]
    fn registro_con_max_attempts_distinto_es_rechazado() {
        let state = test_state(5);

        assert!(register(&state, register_req(json!(5))).is_ok());
        let err = register(&state, register_req(json!(3))).unwrap_err();
        assert!(matches!(err, GridError::Config(_)));
        assert_eq!(state.grid().workers.len(), 1);
    }

    #[test]
    fn heartbeat_de_worker_muerto_pide_re_registro() {
        let state = test_state(5);
        add_worker(&state, "w1", 1);
        state.grid().workers.get_mut("w1").unwrap().dead = true;

        let err = heartbeat(
            &state,
            WorkerHeartbeatRequest {
                worker_id: "w1".to_string(),
                cpu_percent: 1.0,
                mem_bytes: 10,
            },
        )
        .unwrap_err();
        assert!(matches!(err, GridError::WorkerNotFound(_)));
    }

    #[test]
    fn worker_perdido_mueve_sus_jobs() {
        let state = test_state(5);
        add_worker(&state, "w1", 1);
        add_worker(&state, "w2", 1);

        let info = submit_task(
            &state,
            TaskRequest {
                name: "t".to_string(),
                jobs: (0..2)
                    .map(|i| JobSpec {
                        handler: "echo".to_string(),
                        arg: json!(i),
                    })
                    .collect(),
                reducer: Reducer::Sum,
                result_policy: ResultPolicy::FailFast,
            },
        )
        .unwrap();
        let running = next_job(&state, "w1").unwrap().unwrap();

        let moved = {
            let mut grid = state.grid();
            grid.worker_lost("w1", &state.failover, &state.sessions)
        };
        assert_eq!(moved, 1);

        let grid = state.grid();
        assert_eq!(grid.queued_on("w2"), 2);
        assert_eq!(grid.jobs[&running.id].node_id, "w2");
        assert!(grid.jobs[&running.id].job.context.has_failed_on("w1"));
        drop(grid);

        assert_eq!(task_info(&state, &info.id).unwrap().status, TaskStatus::Running);
        assert_eq!(list_workers(&state).iter().filter(|w| w.dead).count(), 1);
    }
}
