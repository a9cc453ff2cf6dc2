use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::audio::{hann_window, TARGET_SAMPLE_RATE};

/// Analysis window length in samples at 16 kHz (32 ms).
pub const WINDOW_SIZE_SAMPLES: usize = 512;

const ENERGY_EPS: f64 = 1e-10;
const ABSOLUTE_NOISE_FLOOR_DB: f64 = -60.0;
const MIN_DYNAMIC_RANGE_DB: f64 = 10.0;
const SNR_MIDPOINT_DB: f64 = 10.0;
const SNR_SLOPE_DB: f64 = 2.5;
const VOICE_BAND_HZ: (f32, f32) = (80.0, 4000.0);
const VOICING_FLOOR: f32 = 0.45;
const VOICING_SPAN: f32 = 0.35;

#[derive(Debug, Clone, Copy)]
struct FrameFeatures {
    energy_db: f64,
    band_ratio: f32,
    flatness: f32,
}

/// Frame-level speech scorer.
///
/// Combines the frame energy relative to the recording's noise floor with two
/// voicing cues computed from the power spectrum: the share of energy inside
/// the voice band and the spectral flatness inside that band.
pub struct VoiceActivityDetector {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    band: (usize, usize),
}

impl std::fmt::Debug for VoiceActivityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceActivityDetector")
            .field("window", &WINDOW_SIZE_SAMPLES)
            .field("band", &self.band)
            .finish()
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceActivityDetector {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(WINDOW_SIZE_SAMPLES);
        let bin_hz = TARGET_SAMPLE_RATE as f32 / WINDOW_SIZE_SAMPLES as f32;
        let low = (VOICE_BAND_HZ.0 / bin_hz).ceil() as usize;
        let high = ((VOICE_BAND_HZ.1 / bin_hz).floor() as usize).min(WINDOW_SIZE_SAMPLES / 2);

        Self {
            fft,
            window: hann_window(WINDOW_SIZE_SAMPLES),
            band: (low.max(1), high),
        }
    }

    /// One probability per started window of 16 kHz mono input.
    pub fn speech_probabilities(&self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }

        let features: Vec<FrameFeatures> = samples
            .chunks(WINDOW_SIZE_SAMPLES)
            .map(|frame| self.frame_features(frame))
            .collect();

        let floor = noise_floor_db(&features);
        let raw: Vec<f32> = features
            .iter()
            .map(|f| frame_probability(f, floor))
            .collect();

        smooth(&raw)
    }

    fn frame_features(&self, frame: &[f32]) -> FrameFeatures {
        let mut buffer: Vec<Complex<f32>> = (0..WINDOW_SIZE_SAMPLES)
            .map(|i| {
                let sample = frame.get(i).copied().unwrap_or(0.0);
                Complex::new(sample * self.window[i], 0.0)
            })
            .collect();

        let mean_square = frame
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum::<f64>()
            / WINDOW_SIZE_SAMPLES as f64;
        let energy_db = 10.0 * (mean_square + ENERGY_EPS).log10();

        self.fft.process(&mut buffer);

        let power: Vec<f32> = buffer[..=WINDOW_SIZE_SAMPLES / 2]
            .iter()
            .map(|c| c.norm_sqr())
            .collect();
        let total: f32 = power[1..].iter().sum();
        let band = &power[self.band.0..=self.band.1];
        let band_total: f32 = band.iter().sum();

        if total <= f32::EPSILON || band_total <= f32::EPSILON {
            return FrameFeatures {
                energy_db,
                band_ratio: 0.0,
                flatness: 1.0,
            };
        }

        let arithmetic = band_total / band.len() as f32;
        let log_mean = band.iter().map(|p| (p + 1e-12).ln()).sum::<f32>() / band.len() as f32;
        let flatness = (log_mean.exp() / arithmetic).clamp(0.0, 1.0);

        FrameFeatures {
            energy_db,
            band_ratio: (band_total / total).clamp(0.0, 1.0),
            flatness,
        }
    }
}

fn noise_floor_db(features: &[FrameFeatures]) -> f64 {
    let mut energies: Vec<f64> = features.iter().map(|f| f.energy_db).collect();
    energies.sort_by(|a, b| a.total_cmp(b));

    let p10 = percentile(&energies, 0.10);
    let p90 = percentile(&energies, 0.90);

    // Flat recordings carry no floor estimate of their own.
    if p90 - p10 < MIN_DYNAMIC_RANGE_DB {
        ABSOLUTE_NOISE_FLOOR_DB
    } else {
        p10
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return ABSOLUTE_NOISE_FLOOR_DB;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn frame_probability(features: &FrameFeatures, floor_db: f64) -> f32 {
    let snr = features.energy_db - floor_db;
    let energy_score = 1.0 / (1.0 + (-(snr - SNR_MIDPOINT_DB) / SNR_SLOPE_DB).exp());

    let voicing = 0.5 * features.band_ratio + 0.5 * (1.0 - features.flatness);
    let voicing_score = ((voicing - VOICING_FLOOR) / VOICING_SPAN).clamp(0.0, 1.0);

    (energy_score as f32 * voicing_score).clamp(0.0, 1.0)
}

fn smooth(raw: &[f32]) -> Vec<f32> {
    if raw.len() < 3 {
        return raw.to_vec();
    }
    (0..raw.len())
        .map(|i| {
            let prev = raw[i.saturating_sub(1)];
            let next = raw[(i + 1).min(raw.len() - 1)];
            0.25 * prev + 0.5 * raw[i] + 0.25 * next
        })
        .collect()
}
