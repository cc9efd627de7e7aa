use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use common::{Job, JobCompleteRequest, NodeId, SessionRegistry, TaskId, WorkerHeartbeatRequest};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::handlers::{JobHandlerRegistry, JobInput};
use crate::master_client::MasterClient;
use crate::session::{JobSession, SessionMirror};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tareas con jobs ejecutándose en este worker. Cada tarea tiene un token
/// (hijo del token de apagado) que cancela todos sus jobs y un mirror local
/// de su sesión que vive mientras quede algún job de la tarea.
#[derive(Clone)]
pub struct LocalTasks {
    sessions: SessionRegistry,
    running: Arc<Mutex<HashMap<TaskId, RunningTask>>>,
    shutdown: CancellationToken,
}

struct RunningTask {
    cancel: CancellationToken,
    jobs: usize,
}

impl LocalTasks {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, RunningTask>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Anota un job que empieza. Devuelve su token de cancelación y la
    /// sesión local de la tarea.
    pub fn job_started(&self, task_id: &str) -> (CancellationToken, Arc<common::TaskSession>) {
        let mut running = self.running();
        let entry = running
            .entry(task_id.to_string())
            .or_insert_with(|| RunningTask {
                cancel: self.shutdown.child_token(),
                jobs: 0,
            });
        entry.jobs += 1;
        (entry.cancel.child_token(), self.sessions.open(task_id))
    }

    /// Anota un job que terminó. Con el último job de la tarea se descarta
    /// el mirror local de su sesión.
    pub fn job_finished(&self, task_id: &str) {
        let mut running = self.running();
        let last = match running.get_mut(task_id) {
            Some(entry) => {
                entry.jobs = entry.jobs.saturating_sub(1);
                entry.jobs == 0
            }
            None => false,
        };
        if last {
            running.remove(task_id);
            self.sessions.close(task_id);
        }
    }

    /// La tarea terminó en el master: se cancelan sus jobs y se cierra la
    /// sesión local (los que esperan salen con `Cancelled`).
    pub fn cancel_task(&self, task_id: &str) {
        if let Some(entry) = self.running().get(task_id) {
            info!("cancelando jobs locales de la tarea {}", task_id);
            entry.cancel.cancel();
        }
        self.sessions.close(task_id);
    }

    pub fn cancel_all(&self) {
        let ids: Vec<TaskId> = self.running().keys().cloned().collect();
        for task_id in ids {
            self.cancel_task(&task_id);
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.running().values().map(|t| t.jobs).sum()
    }
}

pub struct Worker {
    config: WorkerConfig,
    master: MasterClient,
    registry: Arc<JobHandlerRegistry>,
    tasks: LocalTasks,
    worker_id: Arc<Mutex<NodeId>>,
    hostname: String,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: WorkerConfig, shutdown: CancellationToken) -> Self {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let registry = JobHandlerRegistry::with_builtins();
        info!("handlers disponibles: {:?}", registry.names());

        Self {
            master: MasterClient::new(config.master_base_url.clone()),
            registry: Arc::new(registry),
            tasks: LocalTasks::new(shutdown.clone()),
            worker_id: Arc::new(Mutex::new(NodeId::new())),
            hostname,
            shutdown,
            config,
        }
    }

    fn worker_id(&self) -> NodeId {
        self.worker_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Se registra en el master, reintentando mientras el master no responda.
    /// Un rechazo por configuración inconsistente corta el arranque.
    async fn register(&self) -> Result<()> {
        let attributes = self.config.failover.node_attributes();

        loop {
            match self
                .master
                .register(
                    self.hostname.clone(),
                    self.config.max_concurrency,
                    attributes.clone(),
                )
                .await
            {
                Ok(worker_id) => {
                    info!(
                        "worker {} registrado con concurrency={} contra {}",
                        worker_id, self.config.max_concurrency, self.config.master_base_url
                    );
                    *self.worker_id.lock().unwrap_or_else(PoisonError::into_inner) = worker_id;
                    return Ok(());
                }
                Err(e) if e.is::<reqwest::Error>() => {
                    warn!("master no disponible ({}), reintento en {:?}", e, RETRY_INTERVAL);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = sleep(RETRY_INTERVAL) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Loop principal del worker.
    /// - Se registra en el master.
    /// - Hace heartbeats periódicos.
    /// - Pide jobs mientras tenga "slots" libres; si no hay, intenta robar.
    /// - Ejecuta cada job en paralelo (hasta WORKER_CONCURRENCY).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.register().await?;

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());

        let concurrency = self.config.max_concurrency as usize;
        let sem = Arc::new(Semaphore::new(concurrency));

        while !self.shutdown.is_cancelled() {
            // --------- Control de concurrencia local ---------
            let permit = tokio::select! {
                p = sem.clone().acquire_owned() => p?,
                _ = self.shutdown.cancelled() => break,
            };

            let worker_id = self.worker_id();
            let job = match self.master.next_job(&worker_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!("error pidiendo job al master: {}", e);
                    drop(permit);
                    self.idle(RETRY_INTERVAL).await;
                    continue;
                }
            };

            match job {
                Some(job) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.run_job(&worker_id, job).await;
                        // liberar el "slot" al terminar
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    let free = sem.available_permits() as u32;
                    if self.config.stealing && free > 0 {
                        match self.master.steal(&worker_id, free).await {
                            Ok(n) if n > 0 => {
                                info!("worker {} robó {} jobs", worker_id, n);
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("error pidiendo jobs para robar: {}", e),
                        }
                    }
                    self.idle(POLL_INTERVAL).await;
                }
            }
        }

        info!("apagando worker: esperando jobs en vuelo");
        self.tasks.cancel_all();
        if tokio::time::timeout(DRAIN_TIMEOUT, sem.acquire_many(concurrency as u32))
            .await
            .is_err()
        {
            warn!("quedaron {} jobs sin terminar", self.tasks.active_jobs());
        }
        self.tasks.sessions.close_all();
        heartbeat.abort();
        Ok(())
    }

    async fn idle(&self, period: Duration) {
        tokio::select! {
            _ = sleep(period) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn run_job(&self, worker_id: &str, job: Job) {
        let task_id = job.task_id.clone();
        let job_id = job.id.clone();
        info!(
            "tengo job {} de la tarea {} (handler={}, intentos de failover={})",
            job_id, task_id, job.handler, job.context.failover_attempts
        );

        let (cancel, local) = self.tasks.job_started(&task_id);
        let mirror: Arc<dyn SessionMirror> = Arc::new(self.master.clone());
        let input = JobInput {
            job,
            session: JobSession::new(local, Some(mirror), cancel.clone()),
            cancel,
        };

        let outcome = self.registry.execute(input).await;
        self.tasks.job_finished(&task_id);

        let report = match outcome {
            Ok(result) => {
                info!("terminé job {} correctamente", job_id);
                JobCompleteRequest {
                    worker_id: worker_id.to_string(),
                    job_id,
                    success: true,
                    result,
                    error: None,
                }
            }
            Err(e) => {
                warn!("error ejecutando job {}: {:#}", job_id, e);
                JobCompleteRequest {
                    worker_id: worker_id.to_string(),
                    job_id,
                    success: false,
                    result: serde_json::Value::Null,
                    error: Some(format!("{e:#}")),
                }
            }
        };

        if let Err(e) = self.master.complete(&report).await {
            warn!("no se pudo reportar el job {}: {}", report.job_id, e);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        // System para leer CPU y memoria
        let mut sys = System::new_all();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.cancelled() => return,
            }

            sys.refresh_cpu();
            sys.refresh_memory();
            let req = WorkerHeartbeatRequest {
                worker_id: self.worker_id(),
                cpu_percent: sys.global_cpu_info().cpu_usage(),
                // used_memory devuelve bytes en sysinfo 0.29
                mem_bytes: sys.used_memory(),
            };

            match self.master.heartbeat(&req).await {
                Ok(Some(resp)) => {
                    for task_id in resp.cancelled_tasks {
                        self.tasks.cancel_task(&task_id);
                    }
                }
                Ok(None) => {
                    // el master nos dio por muertos y ya movió nuestros jobs
                    warn!("el master no reconoce al worker {}, re-registrando", req.worker_id);
                    self.tasks.cancel_all();
                    if let Err(e) = self.register().await {
                        warn!("no se pudo re-registrar: {:#}", e);
                        self.shutdown.cancel();
                        return;
                    }
                }
                Err(e) => warn!("heartbeat falló: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn la_sesion_local_vive_mientras_haya_jobs_de_la_tarea() {
        let tasks = LocalTasks::new(CancellationToken::new());

        let (_, a) = tasks.job_started("t1");
        let (_, b) = tasks.job_started("t1");
        assert!(Arc::ptr_eq(&a, &b));
        a.set("k", json!(1)).unwrap();

        tasks.job_finished("t1");
        assert!(!a.is_closed());
        assert_eq!(tasks.active_jobs(), 1);

        tasks.job_finished("t1");
        assert!(a.is_closed());
        assert_eq!(tasks.active_jobs(), 0);
        assert!(tasks.sessions.get("t1").is_none());
    }

    #[tokio::test]
    async fn cancelar_la_tarea_corta_sus_jobs_y_no_los_de_otras() {
        let shutdown = CancellationToken::new();
        let tasks = LocalTasks::new(shutdown.clone());

        let (cancel_t1, session_t1) = tasks.job_started("t1");
        let (cancel_t2, _) = tasks.job_started("t2");

        tasks.cancel_task("t1");
        assert!(cancel_t1.is_cancelled());
        assert!(session_t1.is_closed());
        assert!(!cancel_t2.is_cancelled());

        shutdown.cancel();
        assert!(cancel_t2.is_cancelled());
    }
}
