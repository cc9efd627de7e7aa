//! Cliente HTTP del master.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use common::{
    timeout_millis, Job, JobAssignmentRequest, JobAssignmentResponse, JobCompleteRequest, NodeId,
    SessionAttribute, SessionError, SessionSetRequest, SessionWaitRequest, StealRequest,
    StealResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use serde_json::Value;

#[derive(Clone)]
pub struct MasterClient {
    http: Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(
        &self,
        hostname: String,
        max_concurrency: u32,
        attributes: BTreeMap<String, Value>,
    ) -> Result<NodeId> {
        let res = self
            .http
            .post(self.url("/api/v1/workers/register"))
            .json(&WorkerRegisterRequest {
                hostname,
                max_concurrency,
                attributes,
            })
            .send()
            .await?;

        if res.status() == StatusCode::CONFLICT {
            bail!("el master rechazó el registro: configuración de failover inconsistente");
        }
        let WorkerRegisterResponse { worker_id } = res.error_for_status()?.json().await?;
        Ok(worker_id)
    }

    /// `None` si el master ya no conoce al worker (hay que re-registrarse).
    pub async fn heartbeat(
        &self,
        req: &WorkerHeartbeatRequest,
    ) -> Result<Option<WorkerHeartbeatResponse>> {
        let res = self
            .http
            .post(self.url("/api/v1/workers/heartbeat"))
            .json(req)
            .send()
            .await?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(res.error_for_status()?.json().await?))
    }

    pub async fn next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let res = self
            .http
            .post(self.url("/api/v1/jobs/next"))
            .json(&JobAssignmentRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let assignment: JobAssignmentResponse = res.json().await?;
        Ok(assignment.job)
    }

    pub async fn complete(&self, req: &JobCompleteRequest) -> Result<()> {
        self.http
            .post(self.url("/api/v1/jobs/complete"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn steal(&self, worker_id: &str, max_jobs: u32) -> Result<u32> {
        let res = self
            .http
            .post(self.url("/api/v1/jobs/steal"))
            .json(&StealRequest {
                worker_id: worker_id.to_string(),
                max_jobs,
            })
            .send()
            .await?
            .error_for_status()?;
        let StealResponse { stolen } = res.json().await?;
        Ok(stolen)
    }

    /* --------- Sesión de tarea --------- */

    fn attribute_url(&self, task_id: &str, key: &str) -> String {
        self.url(&format!("/api/v1/sessions/{task_id}/attributes/{key}"))
    }

    pub async fn session_set(
        &self,
        task_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), SessionError> {
        let res = self
            .http
            .put(self.attribute_url(task_id, key))
            .json(&SessionSetRequest { value })
            .send()
            .await
            .map_err(unavailable)?;
        check_session_status(res.status(), task_id, key, 0)
    }

    pub async fn session_get(&self, task_id: &str, key: &str) -> Result<Option<Value>, SessionError> {
        let res = self
            .http
            .get(self.attribute_url(task_id, key))
            .send()
            .await
            .map_err(unavailable)?;
        check_session_status(res.status(), task_id, key, 0)?;
        let attr: SessionAttribute = res.json().await.map_err(unavailable)?;
        Ok(attr.value)
    }

    /// Un long-poll sobre el mirror del master. `None` si el poll venció
    /// antes que `timeout`: el master corta cada poll en su propio tope.
    pub async fn session_wait(
        &self,
        task_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, SessionError> {
        let timeout_ms = timeout_millis(timeout);
        let res = self
            .http
            .post(format!("{}/wait", self.attribute_url(task_id, key)))
            .json(&SessionWaitRequest { timeout_ms })
            .send()
            .await
            .map_err(unavailable)?;
        check_session_status(res.status(), task_id, key, timeout_ms)?;

        let attr: SessionAttribute = res.json().await.map_err(unavailable)?;
        Ok(attr.value)
    }
}

fn unavailable(e: reqwest::Error) -> SessionError {
    SessionError::Unavailable(e.to_string())
}

fn check_session_status(
    status: StatusCode,
    task_id: &str,
    key: &str,
    timeout_ms: u64,
) -> Result<(), SessionError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::REQUEST_TIMEOUT => Err(SessionError::Timeout {
            key: key.to_string(),
            timeout_ms,
        }),
        StatusCode::GONE => Err(SessionError::Cancelled {
            key: key.to_string(),
        }),
        StatusCode::NOT_FOUND => Err(SessionError::UnknownSession(task_id.to_string())),
        s => Err(SessionError::Unavailable(format!("status {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_http_se_traducen_a_errores_de_sesion() {
        assert!(check_session_status(StatusCode::NO_CONTENT, "t", "k", 0).is_ok());
        assert_eq!(
            check_session_status(StatusCode::REQUEST_TIMEOUT, "t", "k", 50),
            Err(SessionError::Timeout {
                key: "k".into(),
                timeout_ms: 50
            })
        );
        assert_eq!(
            check_session_status(StatusCode::GONE, "t", "k", 0),
            Err(SessionError::Cancelled { key: "k".into() })
        );
        assert_eq!(
            check_session_status(StatusCode::NOT_FOUND, "t", "k", 0),
            Err(SessionError::UnknownSession("t".into()))
        );
        assert!(matches!(
            check_session_status(StatusCode::BAD_GATEWAY, "t", "k", 0),
            Err(SessionError::Unavailable(_))
        ));
    }
}
