//! Job stealing: un worker ocioso se lleva jobs encolados de los workers
//! más cargados. El movimiento pasa por el coordinador de failover con el
//! ladrón marcado en el contexto del job, así no consume intentos.

use common::{FailoverKind, GridError, NodeId};
use tracing::{debug, info};

use crate::state::{AppState, GridState, JobState};

/// Intenta robar hasta `max_jobs` jobs para `thief_id`. Devuelve cuántos
/// jobs quedaron encolados en el ladrón.
pub fn steal_jobs(state: &AppState, thief_id: &str, max_jobs: u32) -> Result<u32, GridError> {
    let mut grid = state.grid();

    if !grid.is_live(thief_id) {
        return Err(GridError::WorkerNotFound(thief_id.to_string()));
    }

    let wanted = grid.free_slots(thief_id).min(max_jobs as usize);
    if wanted == 0 {
        return Ok(0);
    }

    let mut stolen = 0u32;
    for _ in 0..wanted {
        let Some(victim) = grid.most_loaded_victim(thief_id) else {
            break;
        };
        let Some(job_id) = grid.stealable_job(&victim, state.failover.max_failover_attempts())
        else {
            break;
        };
        if let Some(entry) = grid.jobs.get_mut(&job_id) {
            entry.job.context.mark_thief(thief_id);
        }

        debug!("worker {} intenta robar el job {} de {}", thief_id, job_id, victim);
        match grid.fail_over_job(&job_id, &state.failover, &state.sessions) {
            Ok(d) if d.kind == FailoverKind::Stolen => stolen += 1,
            Ok(d) => debug!(
                "el job {} no fue al ladrón, se balanceó a {} ({:?})",
                job_id, d.node.id, d.kind
            ),
            // el job ya no puede moverse; no seguir insistiendo
            Err(_) => break,
        }
    }

    if stolen > 0 {
        info!("worker {} robó {} jobs", thief_id, stolen);
    }
    Ok(stolen)
}

impl GridState {
    /// Lugares libres de un worker contando lo que tiene en cola.
    pub fn free_slots(&self, worker_id: &str) -> usize {
        let Some(meta) = self.workers.get(worker_id) else {
            return 0;
        };
        let busy = self.running_on(worker_id) + self.queued_on(worker_id);
        (meta.max_concurrency as usize).saturating_sub(busy)
    }

    /// Jobs en cola que el worker no puede arrancar todavía.
    pub fn backlog(&self, worker_id: &str) -> usize {
        let Some(meta) = self.workers.get(worker_id) else {
            return 0;
        };
        let idle = (meta.max_concurrency as usize).saturating_sub(self.running_on(worker_id));
        self.queued_on(worker_id).saturating_sub(idle)
    }

    /// El job más nuevo de la cola que todavía puede moverse. El primero de
    /// la cola es el próximo en ejecutarse, así que se roba desde el final.
    fn stealable_job(&self, victim: &str, max_attempts: u32) -> Option<String> {
        self.queues.get(victim)?.iter().rev().find_map(|id| {
            let entry = self.jobs.get(id)?;
            (entry.state == JobState::Queued && entry.job.context.failover_attempts < max_attempts)
                .then(|| id.clone())
        })
    }

    fn most_loaded_victim(&self, thief_id: &str) -> Option<NodeId> {
        self.live_nodes()
            .into_iter()
            .filter(|n| n.id != thief_id)
            .map(|n| (self.backlog(&n.id), n.id))
            .filter(|(backlog, _)| *backlog > 0)
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
            .map(|(_, id)| id)
    }
}
