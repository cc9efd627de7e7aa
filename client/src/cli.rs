use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    FailoverStats, JobSpec, Reducer, ResultPolicy, SessionAttribute, TaskInfo, TaskRequest,
    TaskStatus, WorkerMetrics,
};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una tarea descrita en un archivo JSON (TaskRequest)
    Submit {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
    },
    /// Demo: N jobs que se sincronizan por la sesión de la tarea.
    /// El primero publica el atributo y el resto lo espera.
    Rendezvous {
        #[arg(long, default_value_t = 5)]
        jobs: u32,
        #[arg(long, default_value = "testName")]
        key: String,
        #[arg(long, default_value = "testVal")]
        value: String,
        #[arg(long, default_value_t = 100_000)]
        timeout_ms: u64,
        /// Espera a que la tarea termine e imprime el resultado
        #[arg(long)]
        wait: bool,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Cancela una tarea en curso
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    Workers,
    /// Contadores del coordinador de failover
    Stats,
    /// Atributos de la sesión de una tarea (o sólo uno)
    Session {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
        key: Option<String>,
    },
}

/// Tarea de rendezvous: el job 0 publica `key = value` y los demás lo
/// esperan; cada uno devuelve 1 si vio el valor esperado. Con N jobs la
/// suma esperada es N - 1.
fn build_rendezvous_task(jobs: u32, key: &str, value: &str, timeout_ms: u64) -> TaskRequest {
    let setter = JobSpec {
        handler: "session_set".to_string(),
        arg: json!({ "key": key, "value": value }),
    };
    let waiters = (1..jobs).map(|_| JobSpec {
        handler: "session_wait".to_string(),
        arg: json!({ "key": key, "expected": value, "timeout_ms": timeout_ms }),
    });

    TaskRequest {
        name: format!("rendezvous-{jobs}"),
        jobs: std::iter::once(setter).chain(waiters).collect(),
        reducer: Reducer::Sum,
        result_policy: ResultPolicy::FailFast,
    }
}

fn print_task(task: &TaskInfo) {
    println!("Tarea:");
    println!("  id: {}", task.id);
    println!("  nombre: {}", task.name);
    println!("  estado: {:?}", task.status);
    println!(
        "  jobs: total={}, completados={}, fallidos={}, failovers={}, robos={}",
        task.total_jobs, task.completed_jobs, task.failed_jobs, task.failovers, task.steals
    );

    // progreso calculado localmente
    let done = task.completed_jobs + task.failed_jobs;
    if task.total_jobs > 0 {
        let pct = (done as f64 / task.total_jobs as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    }

    println!("  submitted_at: {}", task.submitted_at);
    if let Some(ref done) = task.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref result) = task.result {
        println!("  resultado: {}", result);
    }
    if let Some(ref error) = task.error {
        println!("  error: {}", error);
    }
}

async fn submit(client: &Client, base_url: &str, req: &TaskRequest) -> Result<TaskInfo> {
    let url = format!("{}/api/v1/tasks", base_url);
    let resp = client.post(&url).json(req).send().await?;
    match resp.status() {
        StatusCode::SERVICE_UNAVAILABLE => bail!("no hay workers vivos en el master"),
        StatusCode::BAD_REQUEST => bail!("la tarea no tiene jobs"),
        _ => Ok(resp.error_for_status()?.json().await?),
    }
}

async fn wait_finished(client: &Client, base_url: &str, id: &str) -> Result<TaskInfo> {
    let url = format!("{}/api/v1/tasks/{id}", base_url);
    loop {
        let task: TaskInfo = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if task.status != TaskStatus::Running {
            return Ok(task);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("no se pudo leer {}", file.display()))?;
            let req: TaskRequest = serde_json::from_str(&raw)
                .with_context(|| format!("{} no es un TaskRequest válido", file.display()))?;

            let task = submit(&client, &base_url, &req).await?;
            println!("Tarea creada:");
            print_task(&task);
        }

        Commands::Rendezvous {
            jobs,
            key,
            value,
            timeout_ms,
            wait,
        } => {
            if jobs == 0 {
                bail!("--jobs tiene que ser al menos 1");
            }
            let req = build_rendezvous_task(jobs, &key, &value, timeout_ms);
            let task = submit(&client, &base_url, &req).await?;
            println!("Rendezvous enviado ({} jobs, suma esperada {})", jobs, jobs - 1);

            let task = if wait {
                wait_finished(&client, &base_url, &task.id).await?
            } else {
                task
            };
            print_task(&task);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let task: TaskInfo = resp.json().await?;
                print_task(&task);
            } else {
                println!("No se encontró la tarea con id {id}");
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{id}/cancel", base_url);
            let resp = client.post(&url).send().await?;
            match resp.status() {
                s if s.is_success() => {
                    let task: TaskInfo = resp.json().await?;
                    println!("Tarea cancelada.");
                    print_task(&task);
                }
                StatusCode::CONFLICT => println!("La tarea {id} ya había terminado"),
                s => println!("No se pudo cancelar la tarea {id} (status {s})"),
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    println!("Worker {}", w.worker_id);
                    println!("  host           : {}", w.hostname);
                    println!("  dead           : {}", w.dead);
                    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                    println!(
                        "  jobs           : max={}, en cola={}, activos={}",
                        w.max_concurrency, w.queued_jobs, w.active_jobs
                    );
                    println!(
                        "  historial      : started={}, ok={}, failed={}, robados={}",
                        w.jobs_started, w.jobs_succeeded, w.jobs_failed, w.jobs_stolen
                    );
                    match w.avg_job_ms {
                        Some(avg) => println!("  avg_job_ms     : {:.1}", avg),
                        None => println!("  avg_job_ms     : (sin datos)"),
                    }
                    match w.last_cpu_percent {
                        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                        None => println!("  cpu_percent    : (sin datos)"),
                    }
                    match w.last_mem_bytes {
                        Some(mem) => println!("  mem_bytes      : {}", mem),
                        None => println!("  mem_bytes      : (sin datos)"),
                    }
                    println!();
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }

        Commands::Stats => {
            let url = format!("{}/api/v1/failover/stats", base_url);
            let stats: FailoverStats = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("Failover:");
            println!("  max_failover_attempts : {}", stats.max_failover_attempts);
            println!("  jobs con failover     : {}", stats.total_failed_over_jobs);
            println!("  jobs robados          : {}", stats.total_stolen_jobs);
        }

        Commands::Session { task_id, key } => {
            let url = match &key {
                Some(key) => format!("{}/api/v1/sessions/{task_id}/attributes/{key}", base_url),
                None => format!("{}/api/v1/sessions/{task_id}/attributes", base_url),
            };
            let resp = client.get(&url).send().await?;
            if resp.status() == StatusCode::NOT_FOUND {
                println!("La tarea {task_id} no tiene sesión abierta");
                return Ok(());
            }
            let resp = resp.error_for_status()?;

            if key.is_some() {
                let attr: SessionAttribute = resp.json().await?;
                match attr.value {
                    Some(v) => println!("{} = {}", attr.key, v),
                    None => println!("{} no tiene valor", attr.key),
                }
            } else {
                let attrs: BTreeMap<String, Value> = resp.json().await?;
                if attrs.is_empty() {
                    println!("(sesión vacía)");
                }
                for (k, v) in attrs {
                    println!("{} = {}", k, v);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_tiene_un_setter_y_n_menos_uno_waiters() {
        let req = build_rendezvous_task(5, "testName", "testVal", 100_000);

        assert_eq!(req.jobs.len(), 5);
        assert_eq!(req.jobs[0].handler, "session_set");
        assert_eq!(req.jobs[0].arg["value"], json!("testVal"));
        assert!(req.jobs[1..].iter().all(|j| j.handler == "session_wait"
            && j.arg["expected"] == json!("testVal")
            && j.arg["timeout_ms"] == json!(100_000)));
        assert_eq!(req.reducer, Reducer::Sum);
    }

    #[test]
    fn task_request_se_lee_desde_json() {
        let raw = r#"{
            "name": "demo",
            "jobs": [{ "handler": "echo", "arg": 2 }, { "handler": "sleep", "arg": { "ms": 10, "result": 3 } }],
            "reducer": "collect",
            "result_policy": "tolerate_failures"
        }"#;
        let req: TaskRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.jobs.len(), 2);
        assert_eq!(req.reducer, Reducer::Collect);
        assert_eq!(req.result_policy, ResultPolicy::TolerateFailures);
    }
}
