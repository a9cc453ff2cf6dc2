use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{SpeechRecognizer, Transcript, WhisperParams};
use crate::audio::{AudioBuffer, TARGET_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::run_blocking;
use crate::separation::BgmSeparator;
use crate::vad::{
    collect_chunks, get_speech_timestamps, SpeechTimestampsMap, VadOptions, VoiceActivityDetector,
};

/// Progress callback receiving the completed fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

const SEPARATION_DONE: f32 = 0.3;
const PREPROCESS_DONE: f32 = 0.4;

/// Pre-processing switches for a transcription run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Transcribe only the regions the VAD marks as speech.
    pub vad_filter: bool,
    pub vad: VadOptions,
    /// Remove background music before recognition.
    pub separate_bgm: bool,
}

/// Recognizer plus the optional pre-processing models it runs behind.
#[derive(Clone)]
pub struct TranscriptionPipeline {
    recognizer: Arc<dyn SpeechRecognizer>,
    vad: Option<Arc<VoiceActivityDetector>>,
    separator: Option<Arc<BgmSeparator>>,
}

impl TranscriptionPipeline {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            recognizer,
            vad: None,
            separator: None,
        }
    }

    pub fn with_vad(mut self, vad: Arc<VoiceActivityDetector>) -> Self {
        self.vad = Some(vad);
        self
    }

    pub fn with_separator(mut self, separator: Arc<BgmSeparator>) -> Self {
        self.separator = Some(separator);
        self
    }

    pub fn model_id(&self) -> &str {
        self.recognizer.model_id()
    }

    pub async fn run(
        &self,
        audio: AudioBuffer,
        params: &WhisperParams,
        options: &PipelineOptions,
        progress: ProgressFn,
    ) -> Result<Transcript> {
        let audio_duration = audio.duration_secs();

        let audio = if options.separate_bgm {
            self.isolate_vocals(audio, progress.clone()).await?
        } else {
            audio
        };
        progress(SEPARATION_DONE);

        let samples = run_blocking(move || audio.to_recognizer_input()).await?;

        let mut timestamps_map = None;
        let speech = if options.vad_filter {
            let detector = self.vad.clone().ok_or_else(|| {
                Error::InvalidInput("VAD filter requested but no VAD model is loaded".to_string())
            })?;
            let vad_options = options.vad.clone();
            let (samples, chunks) = run_blocking(move || {
                let chunks = get_speech_timestamps(&detector, &samples, &vad_options)?;
                Ok((samples, chunks))
            })
            .await?;

            if chunks.is_empty() {
                info!("No speech detected, skipping recognition");
                progress(1.0);
                return Ok(Transcript {
                    language: params.language_hint().map(str::to_string),
                    segments: Vec::new(),
                    duration: audio_duration,
                });
            }

            debug!(chunks = chunks.len(), "VAD filter kept speech chunks");
            timestamps_map = Some(SpeechTimestampsMap::new(&chunks, TARGET_SAMPLE_RATE));
            collect_chunks(&samples, &chunks)
        } else {
            samples
        };
        progress(PREPROCESS_DONE);

        let mut transcript = self.recognizer.transcribe(&speech, params).await?;

        if let Some(map) = &timestamps_map {
            for segment in &mut transcript.segments {
                segment.start = map.original_time(segment.start, false);
                segment.end = map.original_time(segment.end, true);
            }
        }
        transcript.segments = transcript
            .segments
            .into_iter()
            .filter_map(|mut segment| {
                let trimmed = segment.text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                segment.text = trimmed.to_string();
                Some(segment)
            })
            .enumerate()
            .map(|(id, mut segment)| {
                segment.id = id;
                segment
            })
            .collect();
        transcript.duration = audio_duration;

        progress(1.0);
        Ok(transcript)
    }

    async fn isolate_vocals(&self, audio: AudioBuffer, progress: ProgressFn) -> Result<AudioBuffer> {
        let Some(separator) = self.separator.clone() else {
            return Err(Error::InvalidInput(
                "Music separation requested but no separation model is loaded".to_string(),
            ));
        };
        if audio.channel_count() != 2 {
            warn!(
                channels = audio.channel_count(),
                "Skipping music separation for non-stereo audio"
            );
            return Ok(audio);
        }

        run_blocking(move || {
            let stems = separator.separate(&audio, &|p| progress(p * SEPARATION_DONE))?;
            Ok(stems.vocals)
        })
        .await
    }
}
