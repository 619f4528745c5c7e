// src/api.rs
//! HTTP surface for inspection and administration: health probe, status
//! snapshot, forced reload, and on-demand source runs.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::engine::{EngineError, PulseEngine, StatusSnapshot};
use crate::trace;
use crate::types::PulseRunResult;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PulseEngine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/reload", post(reload))
        .route("/run_once", post(run_once))
        .layer(middleware::from_fn(trace::trace_middleware))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    service: &'static str,
    jobs: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    let jobs = state.engine.job_labels().await.len();
    Json(HealthResp {
        status: "ok",
        service: "pulse",
        jobs,
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.engine.status().await)
}

#[derive(Serialize)]
struct ReloadResp {
    status: &'static str,
    fingerprint: String,
}

#[derive(Serialize)]
struct ErrorResp {
    detail: String,
}

async fn reload(
    State(state): State<AppState>,
) -> Result<Json<ReloadResp>, (StatusCode, Json<ErrorResp>)> {
    match state.engine.load_and_schedule(true).await {
        Ok(_) => Ok(Json(ReloadResp {
            status: "reloaded",
            fingerprint: state.engine.fingerprint(),
        })),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResp {
                detail: format!("{err:#}"),
            }),
        )),
    }
}

#[derive(Deserialize)]
struct RunOnceQuery {
    source_id: Option<String>,
}

#[derive(Serialize)]
struct RunOnceResp {
    results: Vec<PulseRunResult>,
}

async fn run_once(
    State(state): State<AppState>,
    Query(query): Query<RunOnceQuery>,
) -> Result<Json<RunOnceResp>, (StatusCode, Json<ErrorResp>)> {
    let reject = |code: StatusCode, detail: String| (code, Json(ErrorResp { detail }));

    match query.source_id {
        Some(source_id) => match state.engine.run_source_by_id(&source_id).await {
            Ok(result) => Ok(Json(RunOnceResp {
                results: vec![result],
            })),
            Err(err @ EngineError::SourceNotFound(_)) => {
                Err(reject(StatusCode::NOT_FOUND, err.to_string()))
            }
            Err(err @ EngineError::Run(_)) => Err(reject(StatusCode::CONFLICT, err.to_string())),
            Err(err @ EngineError::RulesNotLoaded) => {
                Err(reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
            }
        },
        None => {
            if state.engine.rules_snapshot().is_none() {
                return Err(reject(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    EngineError::RulesNotLoaded.to_string(),
                ));
            }
            Ok(Json(RunOnceResp {
                results: state.engine.run_all_sources().await,
            }))
        }
    }
}
