//! Voice activity detection route.

mod handlers;

use axum::{extract::DefaultBodyLimit, routing::post, Router};

use crate::state::AppState;

pub use handlers::VadQuery;

pub fn router(upload_limit_bytes: usize) -> Router<AppState> {
    Router::new().route(
        "/vad",
        post(handlers::create_vad).layer(DefaultBodyLimit::max(upload_limit_bytes)),
    )
}
