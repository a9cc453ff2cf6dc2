//! Sonora core: audio processing and speech inference behind the Sonora server.
//!
//! - Audio decoding, resampling and WAV encoding
//! - Voice activity detection with speech timestamp extraction
//! - Background music separation
//! - Whisper transcription with optional VAD and music removal
//! - Subtitle rendering and a shared model registry

pub mod audio;
pub mod config;
pub mod env;
pub mod error;
pub mod registry;
pub mod separation;
pub mod subtitle;
pub mod transcription;
pub mod vad;

pub use audio::{decode_audio_bytes, encode_wav, resample, AudioBuffer, TARGET_SAMPLE_RATE};
pub use config::{is_test_env, load_server_config, load_server_config_from, ServerConfig};
pub use env::read_env;
pub use error::{Error, Result};
pub use registry::{LoadedModels, ModelRegistry, OffloadPolicy, RecognizerLoader, WhisperCppLoader};
pub use separation::{BgmSeparator, SeparatedStems, SeparatorPreset};
pub use subtitle::SubtitleFormat;
pub use transcription::{
    PipelineOptions, ProgressFn, Segment, SpeechRecognizer, Transcript, TranscriptionPipeline,
    WhisperParams,
};
pub use vad::{
    get_speech_timestamps, SpeechChunk, SpeechSegment, SpeechTimestampsMap, VadOptions,
    VoiceActivityDetector,
};

/// Run CPU-bound work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Inference(format!("Blocking task failed: {e}")))?
}

#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
