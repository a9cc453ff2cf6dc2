use super::detector::WINDOW_SIZE_SAMPLES;
use super::{round_to, SpeechChunk, VadOptions};
use crate::audio::TARGET_SAMPLE_RATE;

/// Shortest silence at which an over-long chunk may be split.
const MIN_SILENCE_AT_MAX_SPEECH_MS: usize = 98;

/// Convert a per-window probability track into padded speech chunks.
///
/// `audio_len` is the length of the analysed 16 kHz signal; chunk bounds never
/// exceed it.
pub fn speech_timestamps_from_probs(
    probs: &[f32],
    audio_len: usize,
    options: &VadOptions,
) -> Vec<SpeechChunk> {
    let sr = TARGET_SAMPLE_RATE as usize;
    let window = WINDOW_SIZE_SAMPLES;
    let threshold = options.threshold;
    let neg_threshold = options.effective_neg_threshold();

    let min_speech_samples = sr * options.min_speech_duration_ms as usize / 1000;
    let speech_pad_samples = sr * options.speech_pad_ms as usize / 1000;
    let min_silence_samples = sr * options.min_silence_duration_ms as usize / 1000;
    let min_silence_at_max_speech = sr * MIN_SILENCE_AT_MAX_SPEECH_MS / 1000;
    let max_speech_samples = match options.max_speech_duration_s {
        Some(secs) => {
            sr as f64 * secs as f64 - window as f64 - 2.0 * speech_pad_samples as f64
        }
        None => f64::INFINITY,
    };

    let mut speeches: Vec<SpeechChunk> = Vec::new();
    let mut current_start: Option<usize> = None;
    let mut triggered = false;
    let mut temp_end = 0usize;
    let mut prev_end = 0usize;
    let mut next_start = 0usize;

    for (i, &prob) in probs.iter().enumerate() {
        let position = window * i;

        if prob >= threshold && temp_end != 0 {
            temp_end = 0;
            if next_start < prev_end {
                next_start = position;
            }
        }

        if prob >= threshold && !triggered {
            triggered = true;
            current_start = Some(position);
            continue;
        }

        if triggered {
            let start = current_start.unwrap_or(0);
            if (position - start) as f64 > max_speech_samples {
                if prev_end != 0 {
                    speeches.push(SpeechChunk {
                        start,
                        end: prev_end,
                    });
                    if next_start < prev_end {
                        triggered = false;
                        current_start = None;
                    } else {
                        current_start = Some(next_start);
                    }
                    prev_end = 0;
                    next_start = 0;
                    temp_end = 0;
                } else {
                    speeches.push(SpeechChunk {
                        start,
                        end: position,
                    });
                    current_start = None;
                    prev_end = 0;
                    next_start = 0;
                    temp_end = 0;
                    triggered = false;
                    continue;
                }
            }
        }

        if prob < neg_threshold && triggered {
            if temp_end == 0 {
                temp_end = position;
            }
            if position - temp_end > min_silence_at_max_speech {
                prev_end = temp_end;
            }
            if position - temp_end < min_silence_samples {
                continue;
            }

            let start = current_start.unwrap_or(0);
            if temp_end.saturating_sub(start) > min_speech_samples {
                speeches.push(SpeechChunk {
                    start,
                    end: temp_end,
                });
            }
            current_start = None;
            prev_end = 0;
            next_start = 0;
            temp_end = 0;
            triggered = false;
        }
    }

    if let Some(start) = current_start {
        if audio_len.saturating_sub(start) > min_speech_samples {
            speeches.push(SpeechChunk {
                start,
                end: audio_len,
            });
        }
    }

    apply_padding(&mut speeches, audio_len, speech_pad_samples);
    speeches
}

fn apply_padding(speeches: &mut [SpeechChunk], audio_len: usize, pad: usize) {
    let count = speeches.len();
    for i in 0..count {
        if i == 0 {
            speeches[0].start = speeches[0].start.saturating_sub(pad);
        }
        if i + 1 < count {
            let silence = speeches[i + 1].start.saturating_sub(speeches[i].end);
            if silence < 2 * pad {
                speeches[i].end += silence / 2;
                speeches[i + 1].start = speeches[i + 1].start.saturating_sub(silence / 2);
            } else {
                speeches[i].end = (speeches[i].end + pad).min(audio_len);
                speeches[i + 1].start = speeches[i + 1].start.saturating_sub(pad);
            }
        } else {
            speeches[i].end = (speeches[i].end + pad).min(audio_len);
        }
    }
}

/// Concatenate the speech regions of `samples`.
pub fn collect_chunks(samples: &[f32], chunks: &[SpeechChunk]) -> Vec<f32> {
    let total: usize = chunks
        .iter()
        .map(|c| c.end.min(samples.len()).saturating_sub(c.start))
        .sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        let end = chunk.end.min(samples.len());
        if chunk.start < end {
            out.extend_from_slice(&samples[chunk.start..end]);
        }
    }
    out
}

/// Maps times measured on concatenated speech back to the original timeline.
#[derive(Debug, Clone)]
pub struct SpeechTimestampsMap {
    sample_rate: u32,
    chunk_end_sample: Vec<usize>,
    total_silence_before: Vec<f64>,
}

impl SpeechTimestampsMap {
    pub fn new(chunks: &[SpeechChunk], sample_rate: u32) -> Self {
        let mut chunk_end_sample = Vec::with_capacity(chunks.len());
        let mut total_silence_before = Vec::with_capacity(chunks.len());
        let mut previous_end = 0usize;
        let mut silent_samples = 0usize;

        for chunk in chunks {
            silent_samples += chunk.start.saturating_sub(previous_end);
            previous_end = chunk.end;
            chunk_end_sample.push(chunk.end.saturating_sub(silent_samples));
            total_silence_before.push(silent_samples as f64 / sample_rate as f64);
        }

        Self {
            sample_rate,
            chunk_end_sample,
            total_silence_before,
        }
    }

    /// Original-timeline position of `time` (seconds in the concatenated audio).
    ///
    /// `is_end` resolves times that land exactly on a chunk boundary to the
    /// chunk that ends there instead of the one that starts there.
    pub fn original_time(&self, time: f64, is_end: bool) -> f64 {
        if self.chunk_end_sample.is_empty() {
            return round_to(time, 3);
        }
        let index = self.chunk_index(time, is_end);
        round_to(self.total_silence_before[index] + time, 3)
    }

    fn chunk_index(&self, time: f64, is_end: bool) -> usize {
        let sample = (time.max(0.0) * self.sample_rate as f64) as usize;
        let sample = if is_end { sample.saturating_sub(1) } else { sample };
        let index = self.chunk_end_sample.partition_point(|&end| end <= sample);
        index.min(self.chunk_end_sample.len() - 1)
    }
}
