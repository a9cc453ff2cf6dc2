//! Whisper transcription route.

mod handlers;

use axum::{extract::DefaultBodyLimit, routing::post, Router};

use crate::state::AppState;

pub use handlers::TranscriptionQuery;

pub fn router(upload_limit_bytes: usize) -> Router<AppState> {
    Router::new().route(
        "/transcription",
        post(handlers::create_transcription).layer(DefaultBodyLimit::max(upload_limit_bytes)),
    )
}
