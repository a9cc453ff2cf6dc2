//! Speech recognition types, backends and the transcription pipeline.

mod pipeline;
mod whisper_cpp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use pipeline::{PipelineOptions, ProgressFn, TranscriptionPipeline};
pub use whisper_cpp::{WhisperCppConfig, WhisperCppRecognizer, DEFAULT_EXECUTABLE};

/// Whisper checkpoints understood by the recognizer backends.
pub const WHISPER_MODEL_SIZES: &[&str] = &[
    "tiny", "tiny.en", "base", "base.en", "small", "small.en", "medium", "medium.en", "large-v1",
    "large-v2", "large-v3", "large-v3-turbo",
];

pub const DEFAULT_MODEL_SIZE: &str = "base";

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

/// Decoding parameters forwarded to the recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperParams {
    pub model_size: String,
    /// `None` lets the model detect the language.
    pub lang: Option<String>,
    pub is_translate: bool,
    pub beam_size: u32,
    pub best_of: u32,
    pub temperature: f32,
    pub log_prob_threshold: f32,
    pub no_speech_threshold: f32,
    pub initial_prompt: Option<String>,
    pub threads: usize,
}

impl Default for WhisperParams {
    fn default() -> Self {
        Self {
            model_size: DEFAULT_MODEL_SIZE.to_string(),
            lang: None,
            is_translate: false,
            beam_size: 5,
            best_of: 5,
            temperature: 0.0,
            log_prob_threshold: -1.0,
            no_speech_threshold: 0.6,
            initial_prompt: None,
            threads: default_threads(),
        }
    }
}

impl WhisperParams {
    /// Language hint with "auto" and empty strings treated as unset.
    pub fn language_hint(&self) -> Option<&str> {
        self.lang
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_logprob: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_speech_prob: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub language: Option<String>,
    pub segments: Vec<Segment>,
    /// Seconds of audio that were transcribed.
    pub duration: f64,
}

/// A loaded speech recognition backend.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Identifier of the loaded checkpoint, e.g. `base`.
    fn model_id(&self) -> &str;

    /// Transcribe mono 16 kHz samples. Segment times are relative to `samples`.
    async fn transcribe(&self, samples: &[f32], params: &WhisperParams) -> Result<Transcript>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_whisper_conventions() {
        let params = WhisperParams::default();
        assert_eq!(params.model_size, "base");
        assert_eq!(params.beam_size, 5);
        assert_eq!(params.no_speech_threshold, 0.6);
        assert!((1..=8).contains(&params.threads));
    }

    #[test]
    fn auto_language_is_treated_as_unset() {
        let mut params = WhisperParams {
            lang: Some("Auto".to_string()),
            ..Default::default()
        };
        assert_eq!(params.language_hint(), None);
        params.lang = Some(" en ".to_string());
        assert_eq!(params.language_hint(), Some("en"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let params: WhisperParams = serde_json::from_str(r#"{"model_size":"small"}"#).unwrap();
        assert_eq!(params.model_size, "small");
        assert_eq!(params.best_of, 5);
    }
}
