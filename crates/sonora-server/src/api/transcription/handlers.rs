use axum::{
    extract::{rejection::QueryRejection, Extension, Query, Request, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sonora_core::transcription::WHISPER_MODEL_SIZES;
use sonora_core::{PipelineOptions, SeparatorPreset, WhisperParams};
use tracing::info;

use crate::api::request_context::RequestContext;
use crate::api::task::{enqueue, TaskQueuedResponse};
use crate::api::upload::{parse_audio_upload, query_params};
use crate::api::vad::VadQuery;
use crate::db::TaskType;
use crate::error::ApiError;
use crate::state::AppState;
use crate::worker::JobKind;

/// Decoding, VAD and music removal options, flattened into the query string.
/// Unset fields fall back to the server configuration.
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionQuery {
    pub model_size: Option<String>,
    pub lang: Option<String>,
    pub is_translate: Option<bool>,
    pub beam_size: Option<u32>,
    pub best_of: Option<u32>,
    pub temperature: Option<f32>,
    pub log_prob_threshold: Option<f32>,
    pub no_speech_threshold: Option<f32>,
    pub initial_prompt: Option<String>,

    pub vad_filter: Option<bool>,
    // Same fields as `VadQuery`. Not `#[serde(flatten)]`: flattened query
    // values reach the inner struct as strings and numbers fail to parse.
    pub threshold: Option<f32>,
    pub neg_threshold: Option<f32>,
    pub min_speech_duration_ms: Option<u32>,
    pub max_speech_duration_s: Option<f32>,
    pub min_silence_duration_ms: Option<u32>,
    pub speech_pad_ms: Option<u32>,

    pub is_separate_bgm: Option<bool>,
    pub uvr_model_size: Option<String>,
}

impl TranscriptionQuery {
    fn whisper_params(&self, state: &AppState) -> WhisperParams {
        let whisper = &state.config.whisper;
        let defaults = WhisperParams::default();
        WhisperParams {
            model_size: self
                .model_size
                .clone()
                .unwrap_or_else(|| whisper.model_size.clone()),
            lang: self.lang.clone(),
            is_translate: self.is_translate.unwrap_or(defaults.is_translate),
            beam_size: self.beam_size.unwrap_or(defaults.beam_size),
            best_of: self.best_of.unwrap_or(defaults.best_of),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            log_prob_threshold: self.log_prob_threshold.unwrap_or(defaults.log_prob_threshold),
            no_speech_threshold: self
                .no_speech_threshold
                .unwrap_or(defaults.no_speech_threshold),
            initial_prompt: self.initial_prompt.clone(),
            threads: whisper.threads.unwrap_or(defaults.threads),
        }
    }

    /// The VAD subset, mapped the same way as on `/vad`.
    fn vad_query(&self) -> VadQuery {
        VadQuery {
            threshold: self.threshold,
            neg_threshold: self.neg_threshold,
            min_speech_duration_ms: self.min_speech_duration_ms,
            max_speech_duration_s: self.max_speech_duration_s,
            min_silence_duration_ms: self.min_silence_duration_ms,
            speech_pad_ms: self.speech_pad_ms,
        }
    }
}

pub async fn create_transcription(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<TranscriptionQuery>, QueryRejection>,
    req: Request,
) -> Result<(StatusCode, Json<TaskQueuedResponse>), ApiError> {
    let query = query_params(query)?;

    let params = query.whisper_params(&state);
    if !WHISPER_MODEL_SIZES.contains(&params.model_size.as_str()) {
        return Err(ApiError::bad_request(format!(
            "Unknown whisper model size '{}'. Available: {}",
            params.model_size,
            WHISPER_MODEL_SIZES.join(", ")
        )));
    }
    let options = PipelineOptions {
        vad_filter: query.vad_filter.unwrap_or(false),
        vad: query.vad_query().into_options(&state.config.vad),
        separate_bgm: query.is_separate_bgm.unwrap_or(false),
    };
    if options.vad_filter {
        options.vad.validate()?;
    }
    let separator = match query.uvr_model_size.as_deref() {
        Some(name) => name.parse::<SeparatorPreset>()?,
        None => state.config.bgm_separation.model_size.parse::<SeparatorPreset>()?,
    };

    let upload = parse_audio_upload(req, state.max_upload_bytes()).await?;
    info!(
        correlation_id = %ctx.correlation_id,
        model = %params.model_size,
        bytes = upload.bytes.len(),
        "Queueing transcription"
    );

    enqueue(
        &state,
        TaskType::Transcription,
        upload,
        params.language_hint().map(str::to_string),
        JobKind::Transcription {
            params,
            options,
            separator: separator.name().to_string(),
        },
    )
    .await
}
