//! Registro de handlers de jobs.
//!
//! Mapea el nombre de handler que viene en cada `Job` a una función async.
//! Los jobs reciben su sesión de tarea y un token que se cancela cuando la
//! tarea se cancela o el worker se apaga.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use common::{Job, SessionError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::JobSession;

/// Lo que recibe un handler al ejecutar un job.
pub struct JobInput {
    pub job: Job,
    pub session: JobSession,
    pub cancel: CancellationToken,
}

pub type JobHandlerFn =
    Arc<dyn Fn(JobInput) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, JobHandlerFn>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con los handlers que trae el worker.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", echo);
        registry.register("sleep", sleep);
        registry.register("session_set", session_set);
        registry.register("session_get", session_get);
        registry.register("session_wait", session_wait);
        registry.register("fail", fail);
        registry
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(JobInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler_fn: JobHandlerFn = Arc::new(move |input: JobInput| {
            Box::pin(handler(input)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });
        self.handlers.insert(name.to_string(), handler_fn);
        debug!("handler registrado: {}", name);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, input: JobInput) -> Result<Value> {
        let Some(handler) = self.handlers.get(&input.job.handler).cloned() else {
            bail!("handler desconocido: {}", input.job.handler);
        };
        handler(input).await
    }
}

/* ---------------- handlers incluidos ---------------- */

async fn echo(input: JobInput) -> Result<Value> {
    Ok(input.job.arg)
}

#[derive(Deserialize)]
struct SleepArg {
    ms: u64,
    #[serde(default)]
    result: Value,
}

/// Duerme `ms` milisegundos (o lo que diga el arg si es un número).
async fn sleep(input: JobInput) -> Result<Value> {
    let arg = match input.job.arg {
        Value::Number(n) => SleepArg {
            ms: n.as_u64().unwrap_or(0),
            result: Value::Null,
        },
        other => serde_json::from_value(other)?,
    };

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(arg.ms)) => Ok(arg.result),
        _ = input.cancel.cancelled() => Err(anyhow!("job {} cancelado", input.job.id)),
    }
}

#[derive(Deserialize)]
struct SessionSetArg {
    key: String,
    value: Value,
}

/// Publica un atributo en la sesión de la tarea. Devuelve 0.
async fn session_set(input: JobInput) -> Result<Value> {
    let arg: SessionSetArg = serde_json::from_value(input.job.arg)?;
    input.session.set(&arg.key, arg.value).await?;
    info!(
        task_id = input.session.task_id(),
        key = %arg.key,
        "atributo publicado en la sesión"
    );
    Ok(json!(0))
}

#[derive(Deserialize)]
struct SessionGetArg {
    key: String,
}

/// Lee un atributo sin esperar; `null` si todavía no tiene valor.
async fn session_get(input: JobInput) -> Result<Value> {
    let arg: SessionGetArg = serde_json::from_value(input.job.arg)?;
    Ok(input.session.get(&arg.key).await?.unwrap_or(Value::Null))
}

#[derive(Deserialize)]
struct SessionWaitArg {
    key: String,
    expected: Value,
    timeout_ms: u64,
}

/// Espera un atributo y devuelve 1 si llegó con el valor esperado, 0 si no.
/// Un timeout cuenta como 0; la cancelación hace fallar el job.
async fn session_wait(input: JobInput) -> Result<Value> {
    let arg: SessionWaitArg = serde_json::from_value(input.job.arg)?;
    let timeout = Duration::from_millis(arg.timeout_ms);

    match input.session.wait_for(&arg.key, timeout).await {
        Ok(value) => Ok(json!(u8::from(value == arg.expected))),
        Err(SessionError::Timeout { .. }) => Ok(json!(0)),
        Err(e) => Err(e.into()),
    }
}

/// Falla siempre. Sirve para ejercitar el failover.
async fn fail(input: JobInput) -> Result<Value> {
    let reason = input
        .job
        .arg
        .as_str()
        .unwrap_or("fallo provocado")
        .to_string();
    bail!(reason)
}
