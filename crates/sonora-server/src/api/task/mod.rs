//! Task status, listing and result download routes.

mod handlers;

use axum::{routing::get, Router};

use crate::state::AppState;

pub(crate) use handlers::enqueue;
pub use handlers::{TaskListResponse, TaskQueuedResponse};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/task", get(handlers::list_tasks))
        .route("/task/:identifier", get(handlers::get_task))
        .route("/task/file/:identifier", get(handlers::download_task_file))
}
