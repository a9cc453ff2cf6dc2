//! Short-time Fourier transform helpers with centre padding and overlap-add.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::audio::hann_window;

pub(crate) struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub(crate) fn new(n_fft: usize, hop: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            n_fft,
            hop,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub(crate) fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub(crate) fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Centre-pad a signal so that every sample is covered by full windows.
    pub(crate) fn pad(&self, signal: &[f32]) -> Vec<f32> {
        let pad = self.n_fft / 2;
        let frames = self.frame_count(signal.len());
        let padded_len = (frames - 1) * self.hop + self.n_fft;
        let mut padded = vec![0.0; padded_len.max(signal.len() + 2 * pad)];
        padded[pad..pad + signal.len()].copy_from_slice(signal);
        padded
    }

    pub(crate) fn frame_count(&self, signal_len: usize) -> usize {
        let padded = signal_len + self.n_fft;
        (padded.saturating_sub(self.n_fft) + self.hop - 1) / self.hop + 1
    }

    /// Windowed spectrum of the frame starting at `frame * hop` in a padded signal.
    pub(crate) fn analyze(&self, padded: &[f32], frame: usize, out: &mut [Complex<f32>]) {
        let start = frame * self.hop;
        for (i, slot) in out.iter_mut().enumerate() {
            let sample = padded.get(start + i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.forward.process(out);
    }

    /// Inverse-transform `spectrum` in place and overlap-add it into `acc`.
    pub(crate) fn synthesize(
        &self,
        spectrum: &mut [Complex<f32>],
        frame: usize,
        acc: &mut [f32],
        weight: &mut [f32],
    ) {
        self.inverse.process(spectrum);
        let scale = 1.0 / self.n_fft as f32;
        let start = frame * self.hop;
        for i in 0..self.n_fft {
            let idx = start + i;
            if idx >= acc.len() {
                break;
            }
            let w = self.window[i];
            acc[idx] += spectrum[i].re * scale * w;
            weight[idx] += w * w;
        }
    }

    /// Normalise an overlap-added signal and strip the centre padding.
    pub(crate) fn finish(&self, acc: &[f32], weight: &[f32], signal_len: usize) -> Vec<f32> {
        let pad = self.n_fft / 2;
        (0..signal_len)
            .map(|i| {
                let w = weight[pad + i];
                if w > 1e-8 {
                    acc[pad + i] / w
                } else {
                    0.0
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip_reconstructs_signal() {
        let stft = Stft::new(256, 64);
        let signal: Vec<f32> = (0..1000)
            .map(|i| (i as f32 * 0.05).sin() * 0.5 + (i as f32 * 0.31).cos() * 0.2)
            .collect();

        let padded = stft.pad(&signal);
        let frames = stft.frame_count(signal.len());
        let mut acc = vec![0.0; padded.len()];
        let mut weight = vec![0.0; padded.len()];
        let mut buffer = vec![Complex::new(0.0, 0.0); stft.n_fft()];
        for frame in 0..frames {
            stft.analyze(&padded, frame, &mut buffer);
            stft.synthesize(&mut buffer, frame, &mut acc, &mut weight);
        }
        let out = stft.finish(&acc, &weight, signal.len());

        assert_eq!(out.len(), signal.len());
        for (a, b) in out.iter().zip(&signal) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }
}
