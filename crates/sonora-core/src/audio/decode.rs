//! Container/codec decoding into planar `f32` buffers.

use std::io::Cursor;

use tracing::debug;

use super::AudioBuffer;
use crate::error::{Error, Result};

/// Decode any container symphonia understands, falling back to a plain WAV reader.
pub fn decode_audio_bytes(audio_bytes: &[u8]) -> Result<AudioBuffer> {
    if audio_bytes.is_empty() {
        return Err(Error::InvalidInput("Empty audio input".to_string()));
    }

    match decode_with_symphonia(audio_bytes) {
        Ok((channels, sample_rate)) => finalize(channels, sample_rate),
        Err(symphonia_err) => {
            let (channels, sample_rate) = decode_wav_with_hound(audio_bytes).map_err(|wav_err| {
                Error::AudioDecode(format!(
                    "Failed to decode audio. Symphonia: {symphonia_err}; WAV fallback: {wav_err}"
                ))
            })?;
            finalize(channels, sample_rate)
        }
    }
}

fn decode_with_symphonia(audio_bytes: &[u8]) -> Result<(Vec<Vec<f32>>, u32)> {
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;
    use symphonia::default::{get_codecs, get_probe};

    let media_source = MediaSourceStream::new(
        Box::new(Cursor::new(audio_bytes.to_vec())),
        Default::default(),
    );
    let probed = get_probe()
        .format(
            &Hint::new(),
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::AudioDecode(format!("Symphonia probe failed: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::AudioDecode("No default audio track found".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::AudioDecode(format!("Failed to create audio decoder: {e}")))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::ResetRequired) => {
                return Err(Error::AudioDecode(
                    "Audio stream format reset is not supported".to_string(),
                ));
            }
            Err(err) => {
                return Err(Error::AudioDecode(format!(
                    "Failed reading audio packets: {err}"
                )));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                debug!("Skipping undecodable packet: {err}");
                continue;
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => {
                return Err(Error::AudioDecode(format!(
                    "Failed decoding audio packet: {err}"
                )));
            }
        };

        if sample_rate == 0 {
            sample_rate = decoded.spec().rate;
        }
        let channel_count = decoded.spec().channels.count().max(1);
        if channels.is_empty() {
            channels = vec![Vec::new(); channel_count];
        }
        append_planar(decoded, &mut channels);
    }

    if sample_rate == 0 {
        return Err(Error::AudioDecode(
            "Decoded audio is missing sample rate metadata".to_string(),
        ));
    }

    Ok((channels, sample_rate))
}

fn append_planar(decoded: symphonia::core::audio::AudioBufferRef<'_>, out: &mut [Vec<f32>]) {
    use symphonia::core::audio::SampleBuffer;

    let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
    sample_buffer.copy_interleaved_ref(decoded);
    deinterleave_into(sample_buffer.samples(), out);
}

fn deinterleave_into(interleaved: &[f32], out: &mut [Vec<f32>]) {
    let channels = out.len().max(1);
    for frame in interleaved.chunks_exact(channels) {
        for (channel, sample) in out.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }
}

fn decode_wav_with_hound(wav_bytes: &[u8]) -> Result<(Vec<Vec<f32>>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(wav_bytes))
        .map_err(|e| Error::AudioDecode(format!("Failed to parse WAV: {e}")))?;

    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample.max(1) as u32;
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / max_val)
                .collect()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / channel_count + 1); channel_count];
    deinterleave_into(&interleaved, &mut channels);
    Ok((channels, spec.sample_rate))
}

fn finalize(mut channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<AudioBuffer> {
    if sample_rate == 0 {
        return Err(Error::AudioDecode(
            "Decoded audio has invalid sample rate 0".to_string(),
        ));
    }
    if channels.iter().all(|c| c.is_empty()) {
        return Err(Error::AudioDecode(
            "Decoded audio contains no samples".to_string(),
        ));
    }

    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    for channel in &mut channels {
        channel.truncate(frames);
        for sample in channel.iter_mut() {
            *sample = if sample.is_finite() {
                sample.clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }
    }

    AudioBuffer::new(channels, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(channels: u16, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut bytes = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
            for sample in samples {
                writer.write_sample(*sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        bytes
    }

    #[test]
    fn keeps_stereo_channels_separate() {
        let quarter = (0.25f32 * 32767.0) as i16;
        let half = (0.5f32 * 32767.0) as i16;
        let bytes = wav_bytes(2, &[quarter, -half, half, -quarter]);

        let buffer = decode_audio_bytes(&bytes).expect("stereo WAV should decode");
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 2);
        assert!((buffer.channels[0][0] - 0.25).abs() < 0.01);
        assert!((buffer.channels[1][0] + 0.5).abs() < 0.01);
        assert!((buffer.channels[0][1] - 0.5).abs() < 0.01);
    }

    #[test]
    fn rejects_empty_and_garbage_input() {
        assert!(matches!(
            decode_audio_bytes(&[]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            decode_audio_bytes(b"definitely not audio"),
            Err(Error::AudioDecode(_))
        ));
    }
}
