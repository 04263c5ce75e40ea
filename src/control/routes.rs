//! Control API route handlers.
//!
//! All endpoints return JSON. Supervisor errors map to HTTP statuses:
//! unknown trader 404, already running 409, anything else 422.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::runtime::Supervisor;
use crate::types::{SupervisorError, Trader};

pub type AppState = Arc<Supervisor>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TraderResponse {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub algorithm_id: Option<i64>,
    pub status: i64,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl From<Trader> for TraderResponse {
    fn from(t: Trader) -> Self {
        Self {
            id: t.id,
            user_id: t.user_id,
            name: t.name,
            algorithm_id: t.algorithm_id,
            status: t.status,
            last_run_at: t.last_run_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub id: i64,
    pub status: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SupervisorError::TraderNotFound(_) | SupervisorError::LoadTrader { .. } => StatusCode::NOT_FOUND,
            SupervisorError::AlreadyRunning(_) => StatusCode::CONFLICT,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/traders/:id
pub async fn get_trader(State(sup): State<AppState>, Path(id): Path<i64>) -> Result<Json<TraderResponse>, ApiError> {
    let trader = sup.describe(id).await?;
    Ok(Json(trader.into()))
}

/// POST /api/traders/:id/switch
pub async fn switch_trader(
    State(sup): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>, ApiError> {
    sup.switch(id).await?;
    Ok(Json(StatusResponse {
        id,
        status: sup.status(id),
    }))
}

/// POST /api/traders/:id/stop
pub async fn stop_trader(State(sup): State<AppState>, Path(id): Path<i64>) -> Result<Json<StatusResponse>, ApiError> {
    sup.stop(id)?;
    Ok(Json(StatusResponse {
        id,
        status: sup.status(id),
    }))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let status = |e: SupervisorError| ApiError(e).into_response().status();
        assert_eq!(status(SupervisorError::TraderNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status(SupervisorError::AlreadyRunning(1)), StatusCode::CONFLICT);
        assert_eq!(status(SupervisorError::NoAlgorithm(1)), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_trader_response_serializes() {
        let resp = TraderResponse::from(Trader::new(3, 1, "grid", Some(2)));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["name"], "grid");
        assert_eq!(json["status"], 0);
        assert!(json["last_run_at"].is_null());
    }
}
