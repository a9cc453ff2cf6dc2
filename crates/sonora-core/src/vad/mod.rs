//! Voice activity detection.
//!
//! A frame classifier scores each 32 ms window with a speech probability and
//! [`get_speech_timestamps`] turns the probability track into speech chunks
//! using threshold hysteresis, minimum durations and padding.

mod detector;
mod timestamps;

use serde::{Deserialize, Serialize};

pub use detector::{VoiceActivityDetector, WINDOW_SIZE_SAMPLES};
pub use timestamps::{collect_chunks, speech_timestamps_from_probs, SpeechTimestampsMap};

#[cfg(test)]
pub(crate) use detector::tests::voiced;

use crate::audio::TARGET_SAMPLE_RATE;
use crate::error::{Error, Result};

/// Tunables for speech chunk extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadOptions {
    /// Probabilities at or above this value count as speech.
    pub threshold: f32,
    /// Probabilities below this value count as silence. Defaults to `threshold - 0.15`.
    pub neg_threshold: Option<f32>,
    /// Speech chunks shorter than this are discarded.
    pub min_speech_duration_ms: u32,
    /// Chunks longer than this are split. `None` means unbounded.
    pub max_speech_duration_s: Option<f32>,
    /// Silence needed before a chunk is closed.
    pub min_silence_duration_ms: u32,
    /// Padding added on both sides of every chunk.
    pub speech_pad_ms: u32,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            neg_threshold: None,
            min_speech_duration_ms: 250,
            max_speech_duration_s: None,
            min_silence_duration_ms: 2000,
            speech_pad_ms: 400,
        }
    }
}

impl VadOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(Error::InvalidInput(format!(
                "VAD threshold must be within (0, 1), got {}",
                self.threshold
            )));
        }
        if let Some(neg) = self.neg_threshold {
            if !(0.0..=self.threshold).contains(&neg) {
                return Err(Error::InvalidInput(format!(
                    "VAD neg_threshold must be within [0, threshold], got {neg}"
                )));
            }
        }
        if let Some(max) = self.max_speech_duration_s {
            if !(max.is_finite() && max > 0.0) {
                return Err(Error::InvalidInput(format!(
                    "max_speech_duration_s must be positive, got {max}"
                )));
            }
        }
        Ok(())
    }

    pub fn effective_neg_threshold(&self) -> f32 {
        self.neg_threshold
            .unwrap_or_else(|| (self.threshold - 0.15).max(0.01))
    }
}

/// Speech region in 16 kHz sample indices, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechChunk {
    pub start: usize,
    pub end: usize,
}

/// Speech region in seconds, as returned to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeechSegment {
    pub start: f64,
    pub end: f64,
}

impl From<SpeechChunk> for SpeechSegment {
    fn from(chunk: SpeechChunk) -> Self {
        let sr = TARGET_SAMPLE_RATE as f64;
        Self {
            start: round_to(chunk.start as f64 / sr, 3),
            end: round_to(chunk.end as f64 / sr, 3),
        }
    }
}

/// Run detection on 16 kHz mono samples.
pub fn get_speech_timestamps(
    detector: &VoiceActivityDetector,
    samples: &[f32],
    options: &VadOptions,
) -> Result<Vec<SpeechChunk>> {
    options.validate()?;
    let probs = detector.speech_probabilities(samples);
    Ok(speech_timestamps_from_probs(&probs, samples.len(), options))
}

pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}
