use thiserror::Error;

use crate::job::JobId;
use crate::node::NodeId;
use crate::task::TaskId;

/// Motivo por el que un job queda abandonado tras un fallo.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailoverError {
    #[error("se agotaron los intentos de failover ({attempts}/{max})")]
    ExhaustedRetries { attempts: u32, max: u32 },

    #[error("no hay nodo viable para el failover: {reason}")]
    NoViableNode { reason: String },
}

impl FailoverError {
    pub(crate) fn no_viable(reason: impl Into<String>) -> Self {
        Self::NoViableNode {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("timeout esperando el atributo '{key}' ({timeout_ms} ms)")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("espera del atributo '{key}' cancelada")]
    Cancelled { key: String },

    #[error("sesión de la tarea {0} no encontrada")]
    UnknownSession(TaskId),

    #[error("mirror de sesión no disponible: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("maximum_failover_attempts debe ser >= 0 (recibido {0})")]
    NegativeMaxFailoverAttempts(i64),

    #[error("valor inválido para {name}: {value}")]
    Invalid { name: String, value: String },

    #[error("atributo {name} inconsistente: local={local}, remoto={remote}")]
    Inconsistent {
        name: String,
        local: String,
        remote: String,
    },
}

/// Errores del coordinador de ejecución (master).
#[derive(Error, Debug)]
pub enum GridError {
    #[error("tarea no encontrada: {0}")]
    TaskNotFound(TaskId),

    #[error("job no encontrado: {0}")]
    JobNotFound(JobId),

    #[error("worker no encontrado: {0}")]
    WorkerNotFound(NodeId),

    #[error("no hay workers disponibles")]
    NoWorkersAvailable,

    #[error("la tarea {0} ya terminó")]
    TaskFinished(TaskId),

    #[error("tarea sin jobs")]
    EmptyTask,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
