//! API routes and handlers

pub mod bgm_separation;
pub mod docs;
pub mod internal;
pub mod request_context;
mod router;
pub mod task;
pub mod transcription;
pub(crate) mod upload;
pub mod vad;

pub use router::create_router;
