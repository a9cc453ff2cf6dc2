//! Background music separation route.

mod handlers;

use axum::{extract::DefaultBodyLimit, routing::post, Router};

use crate::state::AppState;

pub fn router(upload_limit_bytes: usize) -> Router<AppState> {
    Router::new().route(
        "/bgm-separation",
        post(handlers::create_separation).layer(DefaultBodyLimit::max(upload_limit_bytes)),
    )
}
