use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::AppState;

/// Revisa los heartbeats cada `monitor_interval` y pasa por failover los
/// jobs de los workers que se dan por muertos.
pub async fn monitor_workers(state: AppState, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(state.config.monitor_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                info!("monitor de workers detenido");
                return;
            }
        }
        sweep(&state, SystemTime::now());
    }
}

/// Una pasada del monitor. Devuelve los workers marcados como muertos.
pub fn sweep(state: &AppState, now: SystemTime) -> Vec<String> {
    let timeout = state.config.worker_dead_timeout;
    let mut grid = state.grid();

    let mut dead: Vec<String> = grid
        .workers
        .iter()
        .filter(|(_, meta)| !meta.dead)
        .filter(|(_, meta)| {
            now.duration_since(meta.last_heartbeat)
                .is_ok_and(|elapsed| elapsed > timeout)
        })
        .map(|(id, _)| id.clone())
        .collect();
    dead.sort();

    for worker_id in &dead {
        warn!("marcando worker {} como muerto", worker_id);
        grid.worker_lost(worker_id, &state.failover, &state.sessions);
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::{add_worker, test_state};
    use std::time::Duration;

    #[test]
    fn sweep_marca_solo_los_workers_sin_heartbeat() {
        let state = test_state(5);
        add_worker(&state, "viejo", 1);
        add_worker(&state, "nuevo", 1);

        let now = SystemTime::now();
        state.grid().workers.get_mut("viejo").unwrap().last_heartbeat =
            now - state.config.worker_dead_timeout - Duration::from_secs(1);

        assert_eq!(sweep(&state, now), vec!["viejo".to_string()]);
        assert!(state.grid().workers["viejo"].dead);
        assert!(!state.grid().workers["nuevo"].dead);

        // ya muerto, no se vuelve a procesar
        assert!(sweep(&state, now).is_empty());
    }
}
