use axum::{
    extract::{rejection::QueryRejection, Extension, Query, Request, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sonora_core::SeparatorPreset;
use tracing::info;

use crate::api::request_context::RequestContext;
use crate::api::task::{enqueue, TaskQueuedResponse};
use crate::api::upload::{parse_audio_upload, query_params};
use crate::db::TaskType;
use crate::error::ApiError;
use crate::state::AppState;
use crate::worker::JobKind;

#[derive(Debug, Default, Deserialize)]
pub struct SeparationQuery {
    model_size: Option<String>,
}

pub async fn create_separation(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<SeparationQuery>, QueryRejection>,
    req: Request,
) -> Result<(StatusCode, Json<TaskQueuedResponse>), ApiError> {
    let query = query_params(query)?;
    let preset = query
        .model_size
        .as_deref()
        .unwrap_or(&state.config.bgm_separation.model_size)
        .parse::<SeparatorPreset>()?;

    let upload = parse_audio_upload(req, state.max_upload_bytes()).await?;
    info!(
        correlation_id = %ctx.correlation_id,
        model = %preset,
        bytes = upload.bytes.len(),
        "Queueing music separation"
    );

    enqueue(
        &state,
        TaskType::BgmSeparation,
        upload,
        None,
        JobKind::BgmSeparation {
            model_size: preset.name().to_string(),
        },
    )
    .await
}
