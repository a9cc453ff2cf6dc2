//! Audio upload parsing shared by the inference routes.

use axum::{
    extract::{rejection::QueryRejection, Multipart, Query, Request},
    http::header,
    Json, RequestExt,
};
use base64::Engine;
use serde::Deserialize;

use crate::error::ApiError;

/// Extra room for multipart boundaries, headers and JSON framing.
pub const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Request body allowance for a decoded audio limit of `max_audio_bytes`.
///
/// Sized for base64 payloads, which are 4/3 of the audio they carry; the exact
/// audio limit is enforced after decoding.
pub fn body_limit(max_audio_bytes: usize) -> usize {
    (max_audio_bytes / 3)
        .saturating_add(1)
        .saturating_mul(4)
        .saturating_add(BODY_OVERHEAD_BYTES)
}

#[derive(Debug, Default)]
pub struct AudioUpload {
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonUpload {
    audio_base64: String,
    #[serde(default)]
    file_name: Option<String>,
}

/// Read the `file` part of a multipart form, or `audio_base64` from JSON.
pub async fn parse_audio_upload(req: Request, max_bytes: usize) -> Result<AudioUpload, ApiError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let upload = if content_type.starts_with("multipart/form-data") {
        parse_multipart(req).await?
    } else if content_type.starts_with("application/json") {
        let Json(payload) = req
            .extract::<Json<JsonUpload>, _>()
            .await
            .map_err(|e| ApiError::new(e.status(), format!("Invalid JSON payload: {e}")))?;
        AudioUpload {
            bytes: decode_audio_base64(&payload.audio_base64)?,
            file_name: payload.file_name,
        }
    } else {
        return Err(ApiError::unsupported_media_type(
            "Expected `Content-Type: multipart/form-data` or `application/json`",
        ));
    };

    if upload.bytes.is_empty() {
        return Err(ApiError::bad_request("Uploaded audio file is empty"));
    }
    if upload.bytes.len() > max_bytes {
        return Err(ApiError::payload_too_large(format!(
            "Uploaded audio is {} bytes, the limit is {max_bytes} bytes",
            upload.bytes.len()
        )));
    }
    Ok(upload)
}

async fn parse_multipart(req: Request) -> Result<AudioUpload, ApiError> {
    let mut multipart = req
        .extract::<Multipart, _>()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?;

    let mut out = AudioUpload::default();
    let mut found = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), format!("Failed reading multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "audio" => {
                let file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::new(e.status(), format!("Failed reading '{name}' bytes: {e}"))
                })?;
                out.bytes = bytes.to_vec();
                out.file_name = file_name;
                found = true;
            }
            "audio_base64" => {
                let text = field.text().await.map_err(|e| {
                    ApiError::new(
                        e.status(),
                        format!("Failed reading multipart 'audio_base64' field: {e}"),
                    )
                })?;
                out.bytes = decode_audio_base64(&text)?;
                found = true;
            }
            _ => {}
        }
    }

    if !found {
        return Err(ApiError::bad_request(
            "Missing audio input (`file` or `audio_base64`)",
        ));
    }
    Ok(out)
}

fn decode_audio_base64(input: &str) -> Result<Vec<u8>, ApiError> {
    let payload = input
        .split_once(',')
        .map(|(_, value)| value)
        .unwrap_or(input)
        .trim();

    if payload.is_empty() {
        return Err(ApiError::bad_request("Uploaded audio file is empty"));
    }

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|err| ApiError::bad_request(format!("Invalid base64 audio payload: {err}")))
}

/// Turn query string rejections into `{"detail"}` errors.
pub fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limit_leaves_room_for_base64() {
        let mib = 1024 * 1024;
        assert!(body_limit(mib) >= mib * 4 / 3 + BODY_OVERHEAD_BYTES);
        assert_eq!(body_limit(0), 4 + BODY_OVERHEAD_BYTES);
        assert_eq!(body_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn base64_accepts_data_urls() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"RIFF");
        assert_eq!(
            decode_audio_base64(&format!("data:audio/wav;base64,{encoded}")).unwrap(),
            b"RIFF"
        );
        assert!(decode_audio_base64("  ").is_err());
        assert!(decode_audio_base64("%%%").is_err());
    }
}
