//! Coordinador de ejecución: reparte las tareas en jobs, los asigna a
//! workers, recoge resultados y hace el reduce.

use std::collections::HashSet;
use std::time::SystemTime;

use chrono::Utc;
use common::{
    timeout_millis, GridError, Job, JobCompleteRequest, JobResult, LoadBalancer, NodeId, ResultPolicy,
    SessionRegistry, TaskId, TaskInfo, TaskRequest, TaskStatus,
};
use tracing::{info, warn};

use crate::state::{AppState, GridState, JobEntry, JobState, TaskEntry};

/// Crea la tarea, abre su sesión y asigna cada job a un worker vivo.
pub fn submit_task(state: &AppState, req: TaskRequest) -> Result<TaskInfo, GridError> {
    if req.jobs.is_empty() {
        return Err(GridError::EmptyTask);
    }

    let mut grid = state.grid();
    let live = grid.live_nodes();
    if live.is_empty() {
        return Err(GridError::NoWorkersAvailable);
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    state.sessions.open(&task_id);

    let mut open_jobs = HashSet::new();
    for (index, spec) in req.jobs.into_iter().enumerate() {
        let node = state
            .balancer
            .balanced_node(&live)
            .ok()
            .flatten()
            .ok_or(GridError::NoWorkersAvailable)?;

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.clone(),
            handler: spec.handler,
            arg: spec.arg,
            context: Default::default(),
        };
        let job_id = job.id.clone();

        info!(
            "job {} (handler={}) de la tarea {} asignado al worker {}",
            job_id, job.handler, task_id, node.id
        );

        grid.jobs.insert(
            job_id.clone(),
            JobEntry {
                job,
                index: index as u32,
                node_id: node.id.clone(),
                state: JobState::Queued,
            },
        );
        grid.enqueue(&job_id, &node.id);
        open_jobs.insert(job_id);
    }

    let info = TaskInfo {
        id: task_id.clone(),
        name: req.name,
        status: TaskStatus::Running,
        reducer: req.reducer,
        result_policy: req.result_policy,
        submitted_at: Utc::now(),
        finished_at: None,
        total_jobs: open_jobs.len() as u32,
        completed_jobs: 0,
        failed_jobs: 0,
        failovers: 0,
        steals: 0,
        result: None,
        error: None,
    };

    grid.tasks.insert(
        task_id,
        TaskEntry {
            info: info.clone(),
            open_jobs,
            results: Vec::new(),
        },
    );

    Ok(info)
}

pub fn task_info(state: &AppState, task_id: &str) -> Result<TaskInfo, GridError> {
    state
        .grid()
        .tasks
        .get(task_id)
        .map(|t| t.info.clone())
        .ok_or_else(|| GridError::TaskNotFound(task_id.to_string()))
}

/// Entrega al worker el siguiente job de su cola, si tiene capacidad.
pub fn next_job(state: &AppState, worker_id: &str) -> Result<Option<Job>, GridError> {
    let mut grid = state.grid();

    let max_for_worker = match grid.workers.get(worker_id) {
        Some(meta) if !meta.dead => meta.max_concurrency,
        _ => return Err(GridError::WorkerNotFound(worker_id.to_string())),
    };

    let active = grid.running_on(worker_id);
    if active as u32 >= max_for_worker {
        info!(
            "worker {} pidió job pero ya tiene {}/{} en vuelo",
            worker_id, active, max_for_worker
        );
        return Ok(None);
    }

    loop {
        let Some(job_id) = grid.queues.get_mut(worker_id).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        let Some(entry) = grid.jobs.get_mut(&job_id) else {
            continue;
        };
        // entradas viejas de jobs que ya se movieron
        if entry.state != JobState::Queued || entry.node_id != worker_id {
            continue;
        }

        entry.state = JobState::Running {
            started_at: SystemTime::now(),
        };
        let job = entry.job.clone();

        if let Some(meta) = grid.workers.get_mut(worker_id) {
            meta.jobs_started += 1;
        }

        info!(
            "asignando job {} (tarea={}, handler={}) al worker {} ({}/{} en vuelo -> +1)",
            job.id, job.task_id, job.handler, worker_id, active, max_for_worker
        );
        return Ok(Some(job));
    }
}

/// El worker reporta que terminó (o falló) un job.
pub fn complete_job(state: &AppState, req: JobCompleteRequest) -> Result<(), GridError> {
    let mut grid = state.grid();

    let (task_id, index, started_at) = {
        let entry = grid
            .jobs
            .get(&req.job_id)
            .ok_or_else(|| GridError::JobNotFound(req.job_id.clone()))?;

        let started_at = match entry.state {
            JobState::Running { started_at } if entry.node_id == req.worker_id => started_at,
            _ => {
                info!(
                    "ignorando reporte del job {} desde {}: el job ya no corre ahí",
                    req.job_id, req.worker_id
                );
                return Ok(());
            }
        };
        (entry.job.task_id.clone(), entry.index, started_at)
    };

    let duration_ms = started_at
        .elapsed()
        .map(timeout_millis)
        .unwrap_or(0);

    if let Some(meta) = grid.workers.get_mut(&req.worker_id) {
        meta.total_job_time_ms += duration_ms;
        if req.success {
            meta.jobs_succeeded += 1;
        } else {
            meta.jobs_failed += 1;
        }
    }

    let task_running = grid
        .tasks
        .get(&task_id)
        .is_some_and(|t| !t.info.status.is_terminal());

    if !task_running {
        // resultado tardío de una tarea ya cerrada
        if let Some(entry) = grid.jobs.get_mut(&req.job_id) {
            entry.state = JobState::Finished;
        }
        return Ok(());
    }

    if !req.success {
        warn!(
            "job {} falló en el worker {}: {}",
            req.job_id,
            req.worker_id,
            req.error.as_deref().unwrap_or("sin detalle")
        );
        let _ = grid.fail_over_job(&req.job_id, &state.failover, &state.sessions);
        return Ok(());
    }

    if let Some(entry) = grid.jobs.get_mut(&req.job_id) {
        entry.state = JobState::Finished;
    }
    if let Some(task) = grid.tasks.get_mut(&task_id) {
        task.info.completed_jobs += 1;
        task.open_jobs.remove(&req.job_id);
        task.results.push(JobResult {
            job_id: req.job_id.clone(),
            node_id: req.worker_id.clone(),
            index,
            data: req.result,
        });
    }
    grid.maybe_reduce(&task_id, &state.sessions);

    Ok(())
}

/// Cancela la tarea: queda FAILED, se descartan sus jobs en cola y se cierra
/// la sesión (los que esperan salen con `Cancelled`).
pub fn cancel_task(state: &AppState, task_id: &str) -> Result<TaskInfo, GridError> {
    let mut grid = state.grid();
    let status = grid
        .tasks
        .get(task_id)
        .map(|t| t.info.status)
        .ok_or_else(|| GridError::TaskNotFound(task_id.to_string()))?;

    if status.is_terminal() {
        return Err(GridError::TaskFinished(task_id.to_string()));
    }

    grid.fail_task(task_id, "tarea cancelada", &state.sessions);
    Ok(grid.tasks[task_id].info.clone())
}

/// Tareas ya terminadas que todavía tienen jobs corriendo en `worker_id`.
pub fn cancelled_tasks_on(grid: &GridState, worker_id: &NodeId) -> Vec<TaskId> {
    let mut out: Vec<TaskId> = grid
        .jobs
        .values()
        .filter(|j| j.node_id == *worker_id && matches!(j.state, JobState::Running { .. }))
        .filter(|j| {
            grid.tasks
                .get(&j.job.task_id)
                .map_or(true, |t| t.info.status.is_terminal())
        })
        .map(|j| j.job.task_id.clone())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl GridState {
    /// Si no quedan jobs abiertos, reduce y cierra la tarea.
    pub fn maybe_reduce(&mut self, task_id: &str, sessions: &SessionRegistry) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.info.status.is_terminal() || !task.open_jobs.is_empty() {
            return;
        }

        task.results.sort_by_key(|r| r.index);
        let data: Vec<_> = task.results.iter().map(|r| r.data.clone()).collect();
        let result = task.info.reducer.reduce(&data);

        info!(
            "tarea {} reducida ({} resultados): {}",
            task_id,
            data.len(),
            result
        );

        task.info.status = TaskStatus::Reduced;
        task.info.result = Some(result);
        task.info.finished_at = Some(Utc::now());
        sessions.close(task_id);
    }

    /// Marca la tarea como FAILED y descarta sus jobs en cola.
    pub fn fail_task(&mut self, task_id: &str, reason: &str, sessions: &SessionRegistry) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.info.status.is_terminal() {
            return;
        }

        warn!("tarea {} FAILED: {}", task_id, reason);
        task.info.status = TaskStatus::Failed;
        task.info.error = Some(reason.to_string());
        task.info.finished_at = Some(Utc::now());
        task.results.clear();
        let open: Vec<_> = task.open_jobs.drain().collect();

        for job_id in open {
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if entry.state == JobState::Queued {
                entry.state = JobState::Abandoned;
                let node_id = entry.node_id.clone();
                self.dequeue(&job_id, &node_id);
            }
        }

        sessions.close(task_id);
    }

    /// El coordinador de failover abandonó el job: se aplica la política de
    /// resultados de la tarea.
    pub fn job_abandoned(
        &mut self,
        task_id: &str,
        job_id: &str,
        reason: &str,
        sessions: &SessionRegistry,
    ) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        task.info.failed_jobs += 1;
        let policy = task.info.result_policy;

        match policy {
            ResultPolicy::FailFast => {
                let reason = format!("job {job_id} falló definitivamente: {reason}");
                self.fail_task(task_id, &reason, sessions);
            }
            ResultPolicy::TolerateFailures => {
                task.open_jobs.remove(job_id);
                self.maybe_reduce(task_id, sessions);
            }
        }
    }
}
