use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TaskId = String;

/// Definición de un job dentro de una tarea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Handler registrado en los workers, ej: "session_set", "sleep".
    pub handler: String,
    #[serde(default)]
    pub arg: Value,
}

/// Cómo se combinan los resultados de los jobs en el reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Suma los resultados enteros; lo que no sea número cuenta como 0.
    #[default]
    Sum,
    /// Devuelve la lista de resultados en el orden de los jobs.
    Collect,
}

impl Reducer {
    pub fn reduce(&self, results: &[Value]) -> Value {
        match self {
            Reducer::Sum => {
                let total: i64 = results.iter().filter_map(Value::as_i64).sum();
                Value::from(total)
            }
            Reducer::Collect => Value::Array(results.to_vec()),
        }
    }
}

/// Qué hacer cuando un job queda fallido de forma permanente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultPolicy {
    /// La tarea entera falla y se descartan los resultados parciales.
    #[default]
    FailFast,
    /// Se descarta el job y se reduce con lo que haya.
    TolerateFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub reducer: Reducer,
    #[serde(default)]
    pub result_policy: ResultPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Reduced,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub reducer: Reducer,
    pub result_policy: ResultPolicy,

    /// -------- Métricas de la tarea --------
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub failovers: u32,
    pub steals: u32,

    /// Resultado del reduce (sólo en REDUCED).
    pub result: Option<Value>,
    /// Motivo del fallo (sólo en FAILED).
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reducer_sum_ignora_valores_no_numericos() {
        let res = Reducer::Sum.reduce(&[json!(1), json!(0), json!("x"), json!(1), Value::Null]);
        assert_eq!(res, json!(2));
    }

    #[test]
    fn reducer_collect_mantiene_el_orden() {
        let res = Reducer::Collect.reduce(&[json!("a"), json!(2)]);
        assert_eq!(res, json!(["a", 2]));
    }

    #[test]
    fn task_request_usa_defaults() {
        let req: TaskRequest = serde_json::from_value(json!({
            "name": "demo",
            "jobs": [{ "handler": "echo", "arg": 3 }],
        }))
        .unwrap();
        assert_eq!(req.reducer, Reducer::Sum);
        assert_eq!(req.result_policy, ResultPolicy::FailFast);
        assert_eq!(req.jobs[0].arg, json!(3));
    }

    #[test]
    fn status_se_serializa_en_mayusculas() {
        assert_eq!(serde_json::to_value(TaskStatus::Reduced).unwrap(), json!("REDUCED"));
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
