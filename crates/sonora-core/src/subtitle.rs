//! Subtitle and plain-text rendering of transcripts.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transcription::Transcript;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    #[default]
    Srt,
    Vtt,
    Txt,
    Json,
}

impl SubtitleFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Vtt => "vtt",
            Self::Txt => "txt",
            Self::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Srt => "application/x-subrip; charset=utf-8",
            Self::Vtt => "text/vtt; charset=utf-8",
            Self::Txt => "text/plain; charset=utf-8",
            Self::Json => "application/json",
        }
    }
}

impl FromStr for SubtitleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "srt" => Ok(Self::Srt),
            "vtt" | "webvtt" => Ok(Self::Vtt),
            "txt" | "text" => Ok(Self::Txt),
            "json" => Ok(Self::Json),
            other => Err(Error::InvalidInput(format!(
                "Unsupported subtitle format '{other}'. Use srt, vtt, txt or json"
            ))),
        }
    }
}

pub fn render(transcript: &Transcript, format: SubtitleFormat) -> Result<String> {
    Ok(match format {
        SubtitleFormat::Srt => to_srt(transcript),
        SubtitleFormat::Vtt => to_vtt(transcript),
        SubtitleFormat::Txt => to_txt(transcript),
        SubtitleFormat::Json => serde_json::to_string_pretty(transcript)?,
    })
}

pub fn to_srt(transcript: &Transcript) -> String {
    let mut out = String::new();
    for (index, segment) in transcript.segments.iter().enumerate() {
        let _ = writeln!(out, "{}", index + 1);
        let _ = writeln!(
            out,
            "{} --> {}",
            timestamp(segment.start, ','),
            timestamp(segment.end, ',')
        );
        let _ = writeln!(out, "{}\n", segment.text.trim());
    }
    out
}

pub fn to_vtt(transcript: &Transcript) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for segment in &transcript.segments {
        let _ = writeln!(
            out,
            "{} --> {}",
            timestamp(segment.start, '.'),
            timestamp(segment.end, '.')
        );
        let _ = writeln!(out, "{}\n", segment.text.trim());
    }
    out
}

pub fn to_txt(transcript: &Transcript) -> String {
    let mut out = String::new();
    for segment in &transcript.segments {
        let text = segment.text.trim();
        if !text.is_empty() {
            out.push_str(text);
            out.push('\n');
        }
    }
    out
}

/// `HH:MM:SS<sep>mmm`
fn timestamp(seconds: f64, separator: char) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02}{separator}{millis:03}")
}
