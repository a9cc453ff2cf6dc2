use axum::{
    extract::{rejection::QueryRejection, Extension, Query, Request, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sonora_core::VadOptions;
use tracing::info;

use crate::api::request_context::RequestContext;
use crate::api::task::{enqueue, TaskQueuedResponse};
use crate::api::upload::{parse_audio_upload, query_params};
use crate::db::TaskType;
use crate::error::ApiError;
use crate::state::AppState;
use crate::worker::JobKind;

/// VAD overrides as query parameters. Unset fields keep the configured value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VadQuery {
    pub threshold: Option<f32>,
    pub neg_threshold: Option<f32>,
    pub min_speech_duration_ms: Option<u32>,
    pub max_speech_duration_s: Option<f32>,
    pub min_silence_duration_ms: Option<u32>,
    pub speech_pad_ms: Option<u32>,
}

impl VadQuery {
    pub fn into_options(self, base: &VadOptions) -> VadOptions {
        VadOptions {
            threshold: self.threshold.unwrap_or(base.threshold),
            neg_threshold: self.neg_threshold.or(base.neg_threshold),
            min_speech_duration_ms: self
                .min_speech_duration_ms
                .unwrap_or(base.min_speech_duration_ms),
            max_speech_duration_s: self.max_speech_duration_s.or(base.max_speech_duration_s),
            min_silence_duration_ms: self
                .min_silence_duration_ms
                .unwrap_or(base.min_silence_duration_ms),
            speech_pad_ms: self.speech_pad_ms.unwrap_or(base.speech_pad_ms),
        }
    }
}

pub async fn create_vad(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<VadQuery>, QueryRejection>,
    req: Request,
) -> Result<(StatusCode, Json<TaskQueuedResponse>), ApiError> {
    let options = query_params(query)?.into_options(&state.config.vad);
    options.validate()?;

    let upload = parse_audio_upload(req, state.max_upload_bytes()).await?;
    info!(
        correlation_id = %ctx.correlation_id,
        bytes = upload.bytes.len(),
        "Queueing speech detection"
    );

    enqueue(&state, TaskType::Vad, upload, None, JobKind::Vad { options }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_fall_back_to_the_base_options() {
        let base = VadOptions {
            threshold: 0.4,
            max_speech_duration_s: Some(30.0),
            ..VadOptions::default()
        };
        let options = VadQuery {
            speech_pad_ms: Some(30),
            ..VadQuery::default()
        }
        .into_options(&base);

        assert_eq!(options.threshold, 0.4);
        assert_eq!(options.speech_pad_ms, 30);
        assert_eq!(options.max_speech_duration_s, Some(30.0));
        assert_eq!(options.min_silence_duration_ms, base.min_silence_duration_ms);
    }
}
