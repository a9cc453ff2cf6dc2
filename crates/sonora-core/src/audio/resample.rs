use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::{Error, Result};

/// Flush passes allowed when the input is shorter than the filter delay.
const MAX_FLUSH_CHUNKS: usize = 8;

/// Resample mono audio between sample rates.
pub fn resample(audio: &[f32], src_rate: u32, dst_rate: u32) -> Result<Vec<f32>> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(Error::InvalidInput(format!(
            "Cannot resample between {src_rate} Hz and {dst_rate} Hz"
        )));
    }
    if audio.is_empty() || src_rate == dst_rate {
        return Ok(audio.to_vec());
    }

    if audio.len() < 32 {
        return Ok(resample_linear(audio, src_rate, dst_rate));
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = dst_rate as f64 / src_rate as f64;
    match resample_sinc(audio, ratio, params) {
        Ok(out) => Ok(out),
        Err(err) => {
            debug!("Sinc resampling failed ({err}), using linear interpolation");
            Ok(resample_linear(audio, src_rate, dst_rate))
        }
    }
}

/// One-shot sinc pass, aligned with the input: the filter delay is trimmed
/// from the front and the tail is flushed out with zero-padded chunks.
fn resample_sinc(
    audio: &[f32],
    ratio: f64,
    params: SincInterpolationParameters,
) -> std::result::Result<Vec<f32>, String> {
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, audio.len(), 1)
        .map_err(|e| format!("init: {e}"))?;
    let delay = resampler.output_delay();
    let expected = ((audio.len() as f64) * ratio).round().max(1.0) as usize;

    let mut out = resampler
        .process(&[audio], None)
        .map_err(|e| e.to_string())?
        .pop()
        .unwrap_or_default();
    for _ in 0..MAX_FLUSH_CHUNKS {
        if out.len() >= delay + expected {
            break;
        }
        let tail = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| e.to_string())?
            .pop()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        out.extend(tail);
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

fn resample_linear(audio: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((audio.len() as f64) * ratio).round().max(1.0) as usize;
    let last = audio.len().saturating_sub(1);

    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let left = (src_pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let frac = (src_pos - left as f64).clamp(0.0, 1.0) as f32;
            audio[left] * (1.0 - frac) + audio[right] * frac
        })
        .collect()
}
