use std::sync::atomic::{AtomicUsize, Ordering};

use common::{
    FailoverContext, FailoverCoordinator, FailoverDecision, FailoverError, FailoverKind,
    LoadBalancer, Node, SessionRegistry,
};
use tracing::{info, warn};

use crate::state::{GridState, JobState};

/// Balanceador round robin sobre los candidatos que le pasan.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn balanced_node(&self, candidates: &[Node]) -> anyhow::Result<Option<Node>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(Some(candidates[i].clone()))
    }
}

impl GridState {
    /// Pasa un job fallido (o rechazado para stealing) por el coordinador de
    /// failover y lo mueve al nodo elegido. Si el coordinador lo abandona se
    /// aplica la política de resultados de la tarea.
    ///
    /// Hay que llamarla con el lock del grid tomado.
    pub fn fail_over_job(
        &mut self,
        job_id: &str,
        coordinator: &FailoverCoordinator,
        sessions: &SessionRegistry,
    ) -> Result<FailoverDecision, FailoverError> {
        let Some(mut entry) = self.jobs.remove(job_id) else {
            return Err(FailoverError::NoViableNode {
                reason: format!("job {job_id} desconocido"),
            });
        };

        let origin_id = entry.node_id.clone();
        if entry.state == JobState::Queued {
            self.dequeue(job_id, &origin_id);
        }

        let task_id = entry.job.task_id.clone();
        let task_running = self
            .tasks
            .get(&task_id)
            .is_some_and(|t| !t.info.status.is_terminal());
        if !task_running {
            info!(
                "job {} de la tarea {} ya terminada, no se hace failover",
                job_id, task_id
            );
            entry.state = JobState::Abandoned;
            self.jobs.insert(job_id.to_string(), entry);
            return Err(FailoverError::NoViableNode {
                reason: format!("la tarea {task_id} ya terminó"),
            });
        }

        let origin = self
            .workers
            .get(&origin_id)
            .map(|w| w.node.clone())
            .unwrap_or_else(|| Node::new(origin_id.clone(), "desconocido"));
        let top = self.live_nodes();

        let decision = coordinator.decide(
            FailoverContext {
                task_id: &task_id,
                job_id,
                origin: &origin,
                job_context: &mut entry.job.context,
                topology: &*self,
            },
            &top,
        );

        match &decision {
            Ok(d) => {
                entry.node_id = d.node.id.clone();
                entry.state = JobState::Queued;
                self.jobs.insert(job_id.to_string(), entry);
                self.enqueue(job_id, &d.node.id);

                if let Some(task) = self.tasks.get_mut(&task_id) {
                    match d.kind {
                        FailoverKind::Stolen => task.info.steals += 1,
                        FailoverKind::FailedOver | FailoverKind::Rerouted => {
                            task.info.failovers += 1
                        }
                    }
                }
                if d.kind == FailoverKind::Stolen {
                    if let Some(thief) = self.workers.get_mut(&d.node.id) {
                        thief.jobs_stolen += 1;
                    }
                }
            }
            Err(e) => {
                warn!("job {} de la tarea {} abandonado: {}", job_id, task_id, e);
                entry.state = JobState::Abandoned;
                self.jobs.insert(job_id.to_string(), entry);
                self.job_abandoned(&task_id, job_id, &e.to_string(), sessions);
            }
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_reparte_en_orden() {
        let rr = RoundRobinBalancer::default();
        let nodes = vec![Node::new("a", "ha"), Node::new("b", "hb")];

        let picks: Vec<String> = (0..4)
            .map(|_| rr.balanced_node(&nodes).unwrap().unwrap().id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_sin_candidatos_devuelve_none() {
        let rr = RoundRobinBalancer::default();
        assert!(rr.balanced_node(&[]).unwrap().is_none());
    }
}
