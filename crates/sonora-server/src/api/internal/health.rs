use axum::{extract::State, Json};
use serde::Serialize;
use sonora_core::LoadedModels;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub models: LoadedModels,
    /// Tasks currently queued on or running in the worker.
    pub in_flight_tasks: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        models: state.registry.loaded().await,
        in_flight_tasks: state.worker.in_flight().len(),
    })
}
