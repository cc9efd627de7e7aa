//! Mirror autoritativo de las sesiones de tarea. Los workers escriben acá
//! y hacen long-poll para ver lo que publicaron los jobs de otros nodos.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use common::{SessionAttribute, SessionError, SessionSetRequest, SessionWaitRequest};
use serde_json::Value;
use tracing::debug;

use crate::state::AppState;

/// Tope del long-poll, para que una espera no retenga la conexión indefinidamente.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

pub fn status_for_session(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        SessionError::Cancelled { .. } => StatusCode::GONE,
        SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
        SessionError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn list_attributes(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<BTreeMap<String, Value>>, StatusCode> {
    let session = state
        .sessions
        .require(&task_id)
        .map_err(|e| status_for_session(&e))?;
    Ok(Json(session.attributes().into_iter().collect()))
}

pub async fn get_attribute(
    State(state): State<AppState>,
    Path((task_id, key)): Path<(String, String)>,
) -> Result<Json<SessionAttribute>, StatusCode> {
    let session = state
        .sessions
        .require(&task_id)
        .map_err(|e| status_for_session(&e))?;
    let value = session.get(&key);
    Ok(Json(SessionAttribute { key, value }))
}

pub async fn set_attribute(
    State(state): State<AppState>,
    Path((task_id, key)): Path<(String, String)>,
    Json(req): Json<SessionSetRequest>,
) -> Result<StatusCode, StatusCode> {
    let session = state
        .sessions
        .require(&task_id)
        .map_err(|e| status_for_session(&e))?;

    debug!("sesión {}: {} = {}", task_id, key, req.value);
    session
        .set(key, req.value)
        .map_err(|e| status_for_session(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Long-poll sobre un atributo. Cada poll dura a lo sumo [`MAX_WAIT`]: si el
/// plazo pedido es más largo y el poll vence sin valor se responde `200` con
/// `value: null` y el worker vuelve a pedir con lo que le queda. `408` queda
/// reservado para cuando vence el plazo pedido.
pub async fn wait_attribute(
    State(state): State<AppState>,
    Path((task_id, key)): Path<(String, String)>,
    Json(req): Json<SessionWaitRequest>,
) -> Result<Json<SessionAttribute>, StatusCode> {
    let session = state
        .sessions
        .require(&task_id)
        .map_err(|e| status_for_session(&e))?;

    let requested = Duration::from_millis(req.timeout_ms);
    let value = match session.wait_for(&key, requested.min(MAX_WAIT)).await {
        Ok(value) => Some(value),
        Err(SessionError::Timeout { .. }) if requested > MAX_WAIT => {
            debug!("sesión {}: poll de '{}' vencido, el worker reintenta", task_id, key);
            None
        }
        Err(e) => return Err(status_for_session(&e)),
    };

    Ok(Json(SessionAttribute { key, value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use serde_json::json;

    #[tokio::test]
    async fn set_despierta_al_que_espera() {
        let state = test_state(5);
        state.sessions.open("t1");

        let waiter = tokio::spawn(wait_attribute(
            State(state.clone()),
            Path(("t1".to_string(), "k".to_string())),
            Json(SessionWaitRequest { timeout_ms: 5_000 }),
        ));
        tokio::task::yield_now().await;

        let status = set_attribute(
            State(state.clone()),
            Path(("t1".to_string(), "k".to_string())),
            Json(SessionSetRequest { value: json!("v") }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let Json(attr) = waiter.await.unwrap().unwrap();
        assert_eq!(attr.value, Some(json!("v")));
    }

    #[tokio::test(start_paused = true)]
    async fn espera_sin_valor_da_408_y_sesion_cerrada_410() {
        let state = test_state(5);
        state.sessions.open("t1");

        let err = wait_attribute(
            State(state.clone()),
            Path(("t1".to_string(), "k".to_string())),
            Json(SessionWaitRequest { timeout_ms: 100 }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::REQUEST_TIMEOUT);

        let waiter = tokio::spawn(wait_attribute(
            State(state.clone()),
            Path(("t1".to_string(), "k".to_string())),
            Json(SessionWaitRequest { timeout_ms: 10_000 }),
        ));
        tokio::task::yield_now().await;
        state.sessions.close("t1");
        assert_eq!(waiter.await.unwrap().unwrap_err(), StatusCode::GONE);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_mas_largo_que_el_tope_vence_sin_valor_y_no_con_408() {
        let state = test_state(5);
        state.sessions.open("t1");
        let start = tokio::time::Instant::now();

        let Json(attr) = wait_attribute(
            State(state.clone()),
            Path(("t1".to_string(), "testName".to_string())),
            Json(SessionWaitRequest { timeout_ms: 100_000 }),
        )
        .await
        .unwrap();

        assert_eq!(attr.value, None);
        let elapsed = start.elapsed();
        assert!(elapsed >= MAX_WAIT && elapsed < MAX_WAIT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sesion_desconocida_da_404() {
        let state = test_state(5);
        let err = get_attribute(
            State(state),
            Path(("nada".to_string(), "k".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
