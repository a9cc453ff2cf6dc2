//! Background-music separation.
//!
//! Vocals in commercial mixes are almost always panned to the centre while
//! most accompaniment is spread across the stereo field. The separator scores
//! every time/frequency bin by how strongly the two channels agree, keeps the
//! agreeing energy inside the vocal band as the vocal stem, and returns the
//! residual as the instrumental stem.

mod stft;

use std::fmt;
use std::str::FromStr;

use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::AudioBuffer;
use crate::error::{Error, Result};
use stft::Stft;

/// Inter-channel similarity below which a bin is treated as accompaniment.
const SIMILARITY_KNEE: f32 = 0.6;
const MASK_EXPONENT: f32 = 2.0;
const VOCAL_BAND_HZ: (f32, f32) = (150.0, 7000.0);
/// Width of the cosine taper on each side of the vocal band, in octaves.
const BAND_TAPER_OCTAVES: f32 = 0.5;

/// Named separator configurations, selectable like model checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeparatorPreset {
    CenterMaskHq,
    CenterMaskFast,
}

impl SeparatorPreset {
    pub const ALL: [SeparatorPreset; 2] = [Self::CenterMaskHq, Self::CenterMaskFast];

    pub const fn name(self) -> &'static str {
        match self {
            Self::CenterMaskHq => "center-mask-hq",
            Self::CenterMaskFast => "center-mask-fast",
        }
    }

    pub const fn n_fft(self) -> usize {
        match self {
            Self::CenterMaskHq => 4096,
            Self::CenterMaskFast => 2048,
        }
    }

    pub const fn hop(self) -> usize {
        self.n_fft() / 4
    }
}

impl Default for SeparatorPreset {
    fn default() -> Self {
        Self::CenterMaskHq
    }
}

impl fmt::Display for SeparatorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SeparatorPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|preset| preset.name() == normalized)
            .ok_or_else(|| {
                Error::ModelNotFound(format!(
                    "Unknown separation model '{s}'. Available: {}",
                    Self::ALL.map(|p| p.name()).join(", ")
                ))
            })
    }
}

/// Output of a separation run. Both stems share the input's layout.
#[derive(Debug, Clone)]
pub struct SeparatedStems {
    pub instrumental: AudioBuffer,
    pub vocals: AudioBuffer,
}

pub struct BgmSeparator {
    preset: SeparatorPreset,
    stft: Stft,
}

impl fmt::Debug for BgmSeparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BgmSeparator")
            .field("preset", &self.preset)
            .finish()
    }
}

impl BgmSeparator {
    pub fn new(preset: SeparatorPreset) -> Self {
        Self {
            preset,
            stft: Stft::new(preset.n_fft(), preset.hop()),
        }
    }

    pub fn preset(&self) -> SeparatorPreset {
        self.preset
    }

    /// Split a stereo mix into instrumental and vocal stems.
    ///
    /// `progress` receives the completed fraction in `[0, 1]`.
    pub fn separate(
        &self,
        audio: &AudioBuffer,
        progress: &dyn Fn(f32),
    ) -> Result<SeparatedStems> {
        if audio.channel_count() != 2 {
            return Err(Error::InvalidInput(format!(
                "Music separation needs a stereo recording, got {} channel(s)",
                audio.channel_count()
            )));
        }
        if audio.frames() == 0 {
            return Err(Error::InvalidInput("Audio contains no samples".to_string()));
        }

        let len = audio.frames();
        let left = self.stft.pad(&audio.channels[0]);
        let right = self.stft.pad(&audio.channels[1]);
        let frames = self.stft.frame_count(len);
        let bins = self.stft.bins();
        let n_fft = self.stft.n_fft();
        let band_weights = band_weights(bins, n_fft, audio.sample_rate);

        debug!(
            preset = %self.preset,
            frames,
            bins,
            "Computing centre masks"
        );

        let mut buf_l = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut buf_r = vec![Complex::new(0.0f32, 0.0); n_fft];

        let mut masks = vec![0.0f32; frames * bins];
        for frame in 0..frames {
            self.stft.analyze(&left, frame, &mut buf_l);
            self.stft.analyze(&right, frame, &mut buf_r);
            let row = &mut masks[frame * bins..(frame + 1) * bins];
            for k in 0..bins {
                row[k] = centre_mask(buf_l[k], buf_r[k]) * band_weights[k];
            }
            if frame % 64 == 0 {
                progress(0.5 * frame as f32 / frames as f32);
            }
        }

        let mut acc_l = vec![0.0f32; left.len()];
        let mut acc_r = vec![0.0f32; right.len()];
        let mut weight = vec![0.0f32; left.len()];
        let mut scratch_weight = vec![0.0f32; left.len()];

        for frame in 0..frames {
            self.stft.analyze(&left, frame, &mut buf_l);
            self.stft.analyze(&right, frame, &mut buf_r);
            for k in 0..bins {
                let m = smoothed_mask(&masks, frame, k, frames, bins);
                buf_l[k] *= m;
                buf_r[k] *= m;
                let mirror = (n_fft - k) % n_fft;
                if mirror != k {
                    buf_l[mirror] *= m;
                    buf_r[mirror] *= m;
                }
            }
            self.stft.synthesize(&mut buf_l, frame, &mut acc_l, &mut weight);
            self.stft
                .synthesize(&mut buf_r, frame, &mut acc_r, &mut scratch_weight);
            if frame % 64 == 0 {
                progress(0.5 + 0.5 * frame as f32 / frames as f32);
            }
        }

        let vocals_l = self.stft.finish(&acc_l, &weight, len);
        let vocals_r = self.stft.finish(&acc_r, &weight, len);

        let instrumental_l = residual(&audio.channels[0], &vocals_l);
        let instrumental_r = residual(&audio.channels[1], &vocals_r);
        progress(1.0);

        Ok(SeparatedStems {
            instrumental: AudioBuffer::new(vec![instrumental_l, instrumental_r], audio.sample_rate)?,
            vocals: AudioBuffer::new(vec![vocals_l, vocals_r], audio.sample_rate)?,
        })
    }
}

/// Soft mask from the normalised in-phase cross-spectrum of the two channels.
fn centre_mask(l: Complex<f32>, r: Complex<f32>) -> f32 {
    let energy = l.norm_sqr() + r.norm_sqr();
    if energy <= 1e-12 {
        return 0.0;
    }
    let similarity = 2.0 * (l * r.conj()).re / energy;
    let normalized = ((similarity - SIMILARITY_KNEE) / (1.0 - SIMILARITY_KNEE)).clamp(0.0, 1.0);
    normalized.powf(MASK_EXPONENT)
}

fn smoothed_mask(masks: &[f32], frame: usize, k: usize, frames: usize, bins: usize) -> f32 {
    let prev = masks[frame.saturating_sub(1) * bins + k];
    let cur = masks[frame * bins + k];
    let next = masks[(frame + 1).min(frames - 1) * bins + k];
    0.25 * prev + 0.5 * cur + 0.25 * next
}

fn band_weights(bins: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let bin_hz = sample_rate as f32 / n_fft as f32;
    (0..bins)
        .map(|k| vocal_band_weight(k as f32 * bin_hz))
        .collect()
}

fn vocal_band_weight(freq: f32) -> f32 {
    let (low, high) = VOCAL_BAND_HZ;
    if freq <= 0.0 {
        return 0.0;
    }
    if (low..=high).contains(&freq) {
        return 1.0;
    }
    let octaves = if freq < low {
        (low / freq).log2()
    } else {
        (freq / high).log2()
    };
    if octaves >= BAND_TAPER_OCTAVES {
        0.0
    } else {
        0.5 + 0.5 * (std::f32::consts::PI * octaves / BAND_TAPER_OCTAVES).cos()
    }
}

fn residual(mix: &[f32], stem: &[f32]) -> Vec<f32> {
    mix.iter().zip(stem).map(|(m, s)| m - s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 16_000;

    fn tone(freq: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    fn energy(signal: &[f32]) -> f32 {
        signal.iter().map(|s| s * s).sum()
    }

    fn correlation(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        dot / (energy(a).sqrt() * energy(b).sqrt()).max(1e-12)
    }

    #[test]
    fn preset_names_round_trip() {
        for preset in SeparatorPreset::ALL {
            assert_eq!(preset.name().parse::<SeparatorPreset>().unwrap(), preset);
        }
        assert!(matches!(
            "UVR-MDX-NET-Inst_HQ_4".parse::<SeparatorPreset>(),
            Err(Error::ModelNotFound(_))
        ));
    }

    #[test]
    fn mono_input_is_rejected() {
        let separator = BgmSeparator::new(SeparatorPreset::CenterMaskFast);
        let mono = AudioBuffer::mono(vec![0.1; 4096], SR).unwrap();
        assert!(matches!(
            separator.separate(&mono, &|_| {}),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn stems_sum_back_to_the_mix() {
        let len = 20_000;
        let centre = tone(440.0, len, 0.3);
        let side = tone(1_000.0, len, 0.3);
        let left: Vec<f32> = centre.iter().zip(&side).map(|(c, s)| c + s).collect();
        let right = centre.clone();
        let mix = AudioBuffer::new(vec![left, right], SR).unwrap();

        let stems = BgmSeparator::new(SeparatorPreset::CenterMaskFast)
            .separate(&mix, &|_| {})
            .unwrap();

        assert_eq!(stems.vocals.frames(), len);
        assert_eq!(stems.instrumental.channel_count(), 2);
        for ch in 0..2 {
            for i in 0..len {
                let sum = stems.vocals.channels[ch][i] + stems.instrumental.channels[ch][i];
                assert!((sum - mix.channels[ch][i]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn centre_panned_voice_lands_in_vocal_stem() {
        let len = 32_000;
        let voice = tone(440.0, len, 0.3);
        // Accompaniment in opposite polarity across channels: maximally "wide".
        let band = tone(1_200.0, len, 0.3);
        let left: Vec<f32> = voice.iter().zip(&band).map(|(v, b)| v + b).collect();
        let right: Vec<f32> = voice.iter().zip(&band).map(|(v, b)| v - b).collect();
        let mix = AudioBuffer::new(vec![left, right], SR).unwrap();

        let stems = BgmSeparator::new(SeparatorPreset::CenterMaskFast)
            .separate(&mix, &|_| {})
            .unwrap();

        let interior = 4_000..len - 4_000;
        let vocals = &stems.vocals.channels[0][interior.clone()];
        let instrumental = &stems.instrumental.channels[0][interior.clone()];

        assert!(correlation(vocals, &voice[interior.clone()]) > 0.95);
        assert!(correlation(instrumental, &band[interior.clone()]) > 0.95);
    }

    #[test]
    fn bass_stays_with_the_instrumental() {
        let len = 32_000;
        let bass = tone(60.0, len, 0.4);
        let mix = AudioBuffer::new(vec![bass.clone(), bass.clone()], SR).unwrap();

        let stems = BgmSeparator::new(SeparatorPreset::CenterMaskFast)
            .separate(&mix, &|_| {})
            .unwrap();

        let interior = 4_000..len - 4_000;
        let vocal_energy = energy(&stems.vocals.channels[0][interior.clone()]);
        let total_energy = energy(&bass[interior]);
        assert!(vocal_energy < 0.01 * total_energy);
    }

    #[test]
    fn progress_reaches_completion() {
        let len = 8_000;
        let mix = AudioBuffer::new(vec![tone(300.0, len, 0.2), tone(300.0, len, 0.2)], SR).unwrap();
        let last = std::sync::Mutex::new(0.0f32);
        BgmSeparator::new(SeparatorPreset::CenterMaskFast)
            .separate(&mix, &|p| *last.lock().unwrap() = p)
            .unwrap();
        assert_eq!(*last.lock().unwrap(), 1.0);
    }
}
