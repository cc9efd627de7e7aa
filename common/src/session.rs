//! Sesión distribuida de una tarea.
//!
//! Cada nodo guarda un mirror de los atributos de la sesión. Los jobs de una
//! misma tarea pueden escribir atributos, leerlos y esperar a que aparezcan.
//! Un atributo escrito no se retracta nunca. Al cerrar la sesión (la tarea
//! terminó o el nodo se apaga) todos los que esperan salen con `Cancelled`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;
use crate::task::TaskId;

/// Tope del plazo de una espera; `Duration::MAX` desbordaría el `Instant`.
const MAX_DEADLINE: Duration = Duration::from_secs(30 * 365 * 86_400);

/// Milisegundos de una espera, saturando en `u64::MAX`.
pub fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct SessionState {
    attributes: HashMap<String, Value>,
    waiters: HashMap<String, KeyWaiters>,
}

/// Esperas bloqueadas en una misma clave.
struct KeyWaiters {
    notify: Arc<Notify>,
    count: usize,
}

enum Lookup<'a> {
    Ready(Value),
    Waiting(WaiterGuard<'a>),
}

/// Registro de una espera; al soltarse descuenta el waiter de su clave.
struct WaiterGuard<'a> {
    session: &'a TaskSession,
    key: &'a str,
    notify: Arc<Notify>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.session.state();
        let remove = match state.waiters.get_mut(self.key) {
            Some(w) if Arc::ptr_eq(&w.notify, &self.notify) => {
                w.count -= 1;
                w.count == 0
            }
            _ => false,
        };
        if remove {
            state.waiters.remove(self.key);
        }
    }
}

/// Mirror local de la sesión de una tarea.
pub struct TaskSession {
    task_id: TaskId,
    state: Mutex<SessionState>,
    closed: CancellationToken,
}

impl TaskSession {
    pub fn new(task_id: impl Into<TaskId>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            state: Mutex::new(SessionState::default()),
            closed: CancellationToken::new(),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserta o sobrescribe un atributo y despierta a todos los que lo esperan.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), SessionError> {
        let key = key.into();
        if self.is_closed() {
            return Err(SessionError::Cancelled { key });
        }

        let notify = {
            let mut state = self.state();
            state.attributes.insert(key.clone(), value);
            state.waiters.get(&key).map(|w| Arc::clone(&w.notify))
        };

        debug!(task_id = %self.task_id, key = %key, "atributo de sesión actualizado");

        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(())
    }

    /// Lectura local, no bloquea.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().attributes.get(key).cloned()
    }

    pub fn attributes(&self) -> HashMap<String, Value> {
        self.state().attributes.clone()
    }

    /// Número de esperas bloqueadas en `key` ahora mismo.
    pub fn waiters(&self, key: &str) -> usize {
        self.state().waiters.get(key).map_or(0, |w| w.count)
    }

    /// Espera a que `key` tenga valor. Si ya lo tiene vuelve enseguida.
    pub async fn wait_for(&self, key: &str, timeout: Duration) -> Result<Value, SessionError> {
        self.wait_for_cancellable(key, timeout, &CancellationToken::new())
            .await
    }

    /// Como [`wait_for`](Self::wait_for), pero además se corta cuando se
    /// cancela `cancel` (el job o el nodo que espera).
    pub async fn wait_for_cancellable(
        &self,
        key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, SessionError> {
        let deadline = Instant::now() + timeout.min(MAX_DEADLINE);

        let guard = match self.register_waiter(key)? {
            Lookup::Ready(value) => return Ok(value),
            Lookup::Waiting(guard) => guard,
        };

        loop {
            let notified = guard.notify.notified();
            tokio::pin!(notified);
            // registrado antes de volver a mirar el valor: no se pierde ningún set
            notified.as_mut().enable();

            if let Some(value) = self.get(key) {
                return Ok(value);
            }
            if self.is_closed() || cancel.is_cancelled() {
                return Err(SessionError::Cancelled {
                    key: key.to_string(),
                });
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SessionError::Timeout {
                        key: key.to_string(),
                        timeout_ms: timeout_millis(timeout),
                    });
                }
                _ = self.closed.cancelled() => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    fn register_waiter<'a>(&'a self, key: &'a str) -> Result<Lookup<'a>, SessionError> {
        let mut state = self.state();
        if let Some(value) = state.attributes.get(key) {
            return Ok(Lookup::Ready(value.clone()));
        }
        if self.is_closed() {
            return Err(SessionError::Cancelled {
                key: key.to_string(),
            });
        }

        let waiters = state
            .waiters
            .entry(key.to_string())
            .or_insert_with(|| KeyWaiters {
                notify: Arc::new(Notify::new()),
                count: 0,
            });
        waiters.count += 1;

        Ok(Lookup::Waiting(WaiterGuard {
            session: self,
            key,
            notify: Arc::clone(&waiters.notify),
        }))
    }

    /// Cierra la sesión: libera a todos los que esperan con `Cancelled`.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(task_id = %self.task_id, "cerrando sesión");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Sesiones abiertas en un nodo, por id de tarea.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<TaskId, Arc<TaskSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<TaskSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Devuelve la sesión de la tarea, creándola si no existe.
    pub fn open(&self, task_id: &str) -> Arc<TaskSession> {
        Arc::clone(
            self.sessions()
                .entry(task_id.to_string())
                .or_insert_with(|| TaskSession::new(task_id)),
        )
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskSession>> {
        self.sessions().get(task_id).cloned()
    }

    pub fn require(&self, task_id: &str) -> Result<Arc<TaskSession>, SessionError> {
        self.get(task_id)
            .ok_or_else(|| SessionError::UnknownSession(task_id.to_string()))
    }

    /// Quita y cierra la sesión. Devuelve `false` si no existía.
    pub fn close(&self, task_id: &str) -> bool {
        let removed = self.sessions().remove(task_id);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Cierra todas las sesiones (apagado del nodo).
    pub fn close_all(&self) {
        let drained: Vec<_> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
