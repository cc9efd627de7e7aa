use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;
use crate::task::TaskId;

pub type JobId = String;

/* --------- Claves del contexto en el formato de cable --------- */

/// Nodos donde el job falló de verdad (nunca los nodos a los que se lo robaron).
pub const FAILED_NODES_ATTR: &str = "failover:failed_nodes";
/// Número de failovers reales que lleva el job.
pub const FAILOVER_ATTEMPTS_ATTR: &str = "failover:attempt_count";
/// Techo de intentos con el que se decidió el último failover.
pub const MAX_FAILOVER_ATTEMPTS_ATTR: &str = "failover:max_attempts";
/// Nodo que pidió robar el job; lo escribe la política de stealing.
pub const THIEF_NODE_ATTR: &str = "stealing:thief_node";

/// Contexto de un job. Viaja con el job cuando cambia de nodo, por eso es
/// donde vive el estado del failover.
///
/// En el cable se serializa como un mapa de atributos con claves string;
/// dentro del proceso siempre se usa tipado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    into = "BTreeMap<String, Value>",
    try_from = "BTreeMap<String, Value>"
)]
pub struct JobContext {
    pub failed_nodes: BTreeSet<NodeId>,
    pub failover_attempts: u32,
    pub max_failover_attempts: Option<u32>,
    pub thief: Option<NodeId>,
    /// Atributos libres del propio job.
    pub attributes: BTreeMap<String, Value>,
}

impl JobContext {
    /// Lee y limpia el nodo ladrón.
    pub fn take_thief(&mut self) -> Option<NodeId> {
        self.thief.take()
    }

    /// Lo llama la política de stealing antes de rechazar el job.
    pub fn mark_thief(&mut self, thief: impl Into<NodeId>) {
        self.thief = Some(thief.into());
    }

    pub fn has_failed_on(&self, node: &str) -> bool {
        self.failed_nodes.contains(node)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("atributo '{key}' inválido en el contexto del job: {reason}")]
pub struct ContextAttributeError {
    pub key: String,
    pub reason: String,
}

impl From<JobContext> for BTreeMap<String, Value> {
    fn from(ctx: JobContext) -> Self {
        let mut attrs = ctx.attributes;
        if !ctx.failed_nodes.is_empty() {
            attrs.insert(
                FAILED_NODES_ATTR.to_string(),
                Value::from(ctx.failed_nodes.into_iter().collect::<Vec<_>>()),
            );
        }
        if ctx.failover_attempts > 0 {
            attrs.insert(
                FAILOVER_ATTEMPTS_ATTR.to_string(),
                Value::from(ctx.failover_attempts),
            );
        }
        if let Some(max) = ctx.max_failover_attempts {
            attrs.insert(MAX_FAILOVER_ATTEMPTS_ATTR.to_string(), Value::from(max));
        }
        if let Some(thief) = ctx.thief {
            attrs.insert(THIEF_NODE_ATTR.to_string(), Value::from(thief));
        }
        attrs
    }
}

impl TryFrom<BTreeMap<String, Value>> for JobContext {
    type Error = ContextAttributeError;

    fn try_from(mut attrs: BTreeMap<String, Value>) -> Result<Self, Self::Error> {
        let failed_nodes = match attrs.remove(FAILED_NODES_ATTR) {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(v) => serde_json::from_value(v).map_err(|e| ContextAttributeError {
                key: FAILED_NODES_ATTR.to_string(),
                reason: e.to_string(),
            })?,
        };

        let failover_attempts = match attrs.remove(FAILOVER_ATTEMPTS_ATTR) {
            None | Some(Value::Null) => 0,
            Some(v) => as_u32(FAILOVER_ATTEMPTS_ATTR, &v)?,
        };

        let max_failover_attempts = match attrs.remove(MAX_FAILOVER_ATTEMPTS_ATTR) {
            None | Some(Value::Null) => None,
            Some(v) => Some(as_u32(MAX_FAILOVER_ATTEMPTS_ATTR, &v)?),
        };

        let thief = match attrs.remove(THIEF_NODE_ATTR) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(ContextAttributeError {
                    key: THIEF_NODE_ATTR.to_string(),
                    reason: format!("se esperaba un id de nodo, llegó {other}"),
                })
            }
        };

        Ok(Self {
            failed_nodes,
            failover_attempts,
            max_failover_attempts,
            thief,
            attributes: attrs,
        })
    }
}

fn as_u32(key: &str, v: &Value) -> Result<u32, ContextAttributeError> {
    v.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ContextAttributeError {
            key: key.to_string(),
            reason: format!("se esperaba un entero no negativo, llegó {v}"),
        })
}

/// Un job concreto de una tarea. La identidad se mantiene entre failovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_id: TaskId,
    /// Nombre del handler que lo ejecuta en el worker, ej: "session_wait".
    pub handler: String,
    #[serde(default)]
    pub arg: Value,
    #[serde(default)]
    pub context: JobContext,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contexto_vacio_se_serializa_como_mapa_vacio() {
        let v = serde_json::to_value(JobContext::default()).unwrap();
        assert_eq!(v, json!({}));
    }

    #[test]
    fn contexto_usa_claves_string_en_el_cable() {
        let mut ctx = JobContext::default();
        ctx.failed_nodes.insert("n1".to_string());
        ctx.failover_attempts = 2;
        ctx.max_failover_attempts = Some(5);
        ctx.mark_thief("n3");
        ctx.attributes.insert("user".to_string(), json!("x"));

        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            v,
            json!({
                "failover:failed_nodes": ["n1"],
                "failover:attempt_count": 2,
                "failover:max_attempts": 5,
                "stealing:thief_node": "n3",
                "user": "x",
            })
        );

        let back: JobContext = serde_json::from_value(v).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn thief_nulo_equivale_a_ausente() {
        let ctx: JobContext =
            serde_json::from_value(json!({ "stealing:thief_node": null })).unwrap();
        assert!(ctx.thief.is_none());
    }

    #[test]
    fn contador_negativo_es_rechazado() {
        let res: Result<JobContext, _> =
            serde_json::from_value(json!({ "failover:attempt_count": -1 }));
        assert!(res.is_err());
    }

    #[test]
    fn take_thief_limpia_el_atributo() {
        let mut ctx = JobContext::default();
        ctx.mark_thief("ladron");
        assert_eq!(ctx.take_thief().as_deref(), Some("ladron"));
        assert!(ctx.thief.is_none());
    }

    #[test]
    fn job_sin_contexto_en_el_json_usa_default() {
        let job: Job = serde_json::from_value(json!({
            "id": "j1",
            "task_id": "t1",
            "handler": "echo",
        }))
        .unwrap();
        assert_eq!(job.context, JobContext::default());
        assert_eq!(job.arg, Value::Null);
    }
}
