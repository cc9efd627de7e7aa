//! Sesión de tarea vista desde un job.
//!
//! Cada worker guarda un mirror local de la sesión de las tareas que está
//! ejecutando. Las escrituras van primero al master (mirror autoritativo) y
//! después al mirror local; las esperas compiten entre el mirror local y un
//! long-poll al master, así un valor publicado por un job de este mismo
//! nodo despierta a sus vecinos sin ida y vuelta por la red.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::{timeout_millis, SessionError, TaskSession};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::master_client::MasterClient;

pub type MirrorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Mirror remoto de las sesiones (el master).
pub trait SessionMirror: Send + Sync {
    fn set<'a>(&'a self, task_id: &'a str, key: &'a str, value: Value) -> MirrorFuture<'a, ()>;

    fn get<'a>(&'a self, task_id: &'a str, key: &'a str) -> MirrorFuture<'a, Option<Value>>;

    /// Un solo long-poll. `Ok(None)` si el poll venció antes que `timeout`.
    fn wait<'a>(
        &'a self,
        task_id: &'a str,
        key: &'a str,
        timeout: Duration,
    ) -> MirrorFuture<'a, Option<Value>>;
}

impl SessionMirror for MasterClient {
    fn set<'a>(&'a self, task_id: &'a str, key: &'a str, value: Value) -> MirrorFuture<'a, ()> {
        Box::pin(self.session_set(task_id, key, value))
    }

    fn get<'a>(&'a self, task_id: &'a str, key: &'a str) -> MirrorFuture<'a, Option<Value>> {
        Box::pin(self.session_get(task_id, key))
    }

    fn wait<'a>(
        &'a self,
        task_id: &'a str,
        key: &'a str,
        timeout: Duration,
    ) -> MirrorFuture<'a, Option<Value>> {
        Box::pin(self.session_wait(task_id, key, timeout))
    }
}

#[derive(Clone)]
pub struct JobSession {
    local: Arc<TaskSession>,
    remote: Option<Arc<dyn SessionMirror>>,
    cancel: CancellationToken,
}

impl JobSession {
    pub fn new(
        local: Arc<TaskSession>,
        remote: Option<Arc<dyn SessionMirror>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            remote,
            cancel,
        }
    }

    /// Sesión sólo local, sin master detrás.
    pub fn local_only(local: Arc<TaskSession>, cancel: CancellationToken) -> Self {
        Self::new(local, None, cancel)
    }

    pub fn task_id(&self) -> &str {
        self.local.task_id()
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), SessionError> {
        if let Some(remote) = &self.remote {
            remote.set(self.task_id(), key, value.clone()).await?;
        }
        self.local.set(key, value)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, SessionError> {
        if let Some(value) = self.local.get(key) {
            return Ok(Some(value));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        let value = remote.get(self.task_id(), key).await?;
        if let Some(v) = &value {
            self.cache(key, v.clone());
        }
        Ok(value)
    }

    /// Bloquea hasta que `key` tenga valor, venza `timeout`, se cierre la
    /// sesión o se cancele el job.
    pub async fn wait_for(&self, key: &str, timeout: Duration) -> Result<Value, SessionError> {
        let local = self.local.wait_for_cancellable(key, timeout, &self.cancel);
        let Some(remote) = &self.remote else {
            return local.await;
        };
        if let Some(value) = self.local.get(key) {
            return Ok(value);
        }

        let remote_wait = self.wait_remote(remote.as_ref(), key, timeout);
        tokio::pin!(local, remote_wait);

        tokio::select! {
            res = &mut local => res,
            res = &mut remote_wait => match res {
                Ok(value) => {
                    self.cache(key, value.clone());
                    Ok(value)
                }
                Err(SessionError::Unavailable(reason)) => {
                    warn!(
                        task_id = self.task_id(),
                        key,
                        "mirror del master no disponible, espero sólo en local: {reason}"
                    );
                    local.await
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Encadena long-polls al master hasta que llegue el valor o venza el
    /// plazo del job.
    async fn wait_remote(
        &self,
        remote: &dyn SessionMirror,
        key: &str,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut remaining = timeout;

        loop {
            match remote.wait(self.task_id(), key, remaining).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(SessionError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }

            if let Some(deadline) = deadline {
                remaining = deadline.saturating_duration_since(Instant::now());
            }
            if remaining.is_zero() {
                break;
            }
            debug!(
                task_id = self.task_id(),
                key,
                "poll del master vencido, quedan {:?}",
                remaining
            );
        }

        Err(SessionError::Timeout {
            key: key.to_string(),
            timeout_ms: timeout_millis(timeout),
        })
    }

    fn cache(&self, key: &str, value: Value) {
        if let Err(e) = self.local.set(key, value) {
            debug!(task_id = self.task_id(), key, "no se cacheó el atributo: {e}");
        }
    }
}
