//! Audio buffers, decoding, resampling and WAV encoding.

mod decode;
mod resample;

use std::io::Cursor;

pub use decode::decode_audio_bytes;
pub use resample::resample;

use crate::error::{Error, Result};

/// Sample rate expected by the recognizer and the VAD model.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Planar floating point audio. Every channel holds the same number of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::InvalidInput("Sample rate must be non-zero".to_string()));
        }
        if channels.is_empty() {
            return Err(Error::InvalidInput("Audio has no channels".to_string()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(Error::InvalidInput(
                "Audio channels have mismatched lengths".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => {
                let scale = 1.0 / n as f32;
                (0..self.frames())
                    .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() * scale)
                    .collect()
            }
        }
    }

    /// Mono samples at [`TARGET_SAMPLE_RATE`], ready for VAD and recognition.
    pub fn to_recognizer_input(&self) -> Result<Vec<f32>> {
        resample(&self.to_mono(), self.sample_rate, TARGET_SAMPLE_RATE)
    }
}

/// Encode a buffer as 16-bit PCM WAV.
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let channels = u16::try_from(buffer.channel_count())
        .map_err(|_| Error::InvalidInput("Too many audio channels".to_string()))?;
    let spec = hound::WavSpec {
        channels,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| Error::Inference(format!("Failed to create WAV writer: {e}")))?;
        for frame in 0..buffer.frames() {
            for channel in &buffer.channels {
                let sample = channel[frame];
                let sample = if sample.is_finite() { sample } else { 0.0 };
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| Error::Inference(format!("Failed to write WAV sample: {e}")))?;
            }
        }
        writer
            .finalize()
            .map_err(|e| Error::Inference(format!("Failed to finalize WAV: {e}")))?;
    }
    Ok(bytes)
}

/// Periodic Hann window.
pub(crate) fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len.max(1)];
    }
    (0..len)
        .map(|i| {
            let x = (2.0 * std::f32::consts::PI * i as f32) / len as f32;
            0.5 - 0.5 * x.cos()
        })
        .collect()
}
