//! whisper.cpp backend driven through its command line tool.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Segment, SpeechRecognizer, Transcript, WhisperParams};
use crate::audio::{encode_wav, AudioBuffer, TARGET_SAMPLE_RATE};
use crate::error::{Error, Result};

pub const DEFAULT_EXECUTABLE: &str = "whisper-cli";

/// Where to find the whisper.cpp tool and its `ggml-*.bin` checkpoints.
#[derive(Debug, Clone)]
pub struct WhisperCppConfig {
    pub executable: PathBuf,
    pub models_dir: PathBuf,
}

impl WhisperCppConfig {
    pub fn model_path(&self, model_size: &str) -> PathBuf {
        self.models_dir.join(format!("ggml-{model_size}.bin"))
    }
}

#[derive(Debug)]
pub struct WhisperCppRecognizer {
    executable: PathBuf,
    model_path: PathBuf,
    model_size: String,
}

impl WhisperCppRecognizer {
    /// Resolve the executable and checkpoint for `model_size`.
    pub fn load(config: &WhisperCppConfig, model_size: &str) -> Result<Self> {
        let model_path = config.model_path(model_size);
        if !model_path.is_file() {
            return Err(Error::ModelNotFound(format!(
                "Whisper model '{model_size}' not found at {}",
                model_path.display()
            )));
        }

        let executable = resolve_executable(&config.executable).ok_or_else(|| {
            Error::ModelLoad(format!(
                "whisper.cpp executable '{}' not found",
                config.executable.display()
            ))
        })?;

        info!(
            model = model_size,
            path = %model_path.display(),
            executable = %executable.display(),
            "Loaded whisper.cpp recognizer"
        );

        Ok(Self {
            executable,
            model_path,
            model_size: model_size.to_string(),
        })
    }

    fn build_args(&self, input: &Path, output_stem: &Path, params: &WhisperParams) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.display().to_string(),
            "-f".to_string(),
            input.display().to_string(),
            "-oj".to_string(),
            "-of".to_string(),
            output_stem.display().to_string(),
            "-np".to_string(),
            "-t".to_string(),
            params.threads.max(1).to_string(),
            "-bs".to_string(),
            params.beam_size.max(1).to_string(),
            "-bo".to_string(),
            params.best_of.max(1).to_string(),
            "-tp".to_string(),
            params.temperature.to_string(),
            "-lpt".to_string(),
            params.log_prob_threshold.to_string(),
            "-nth".to_string(),
            params.no_speech_threshold.to_string(),
            "-l".to_string(),
            params.language_hint().unwrap_or("auto").to_string(),
        ];
        if params.is_translate {
            args.push("-tr".to_string());
        }
        if let Some(prompt) = params.initial_prompt.as_deref().filter(|p| !p.is_empty()) {
            args.push("--prompt".to_string());
            args.push(prompt.to_string());
        }
        args
    }

    async fn run(&self, work_dir: &Path, samples: &[f32], params: &WhisperParams) -> Result<Transcript> {
        let input = work_dir.join("input.wav");
        let output_stem = work_dir.join("output");

        let wav = encode_wav(&AudioBuffer::mono(samples.to_vec(), TARGET_SAMPLE_RATE)?)?;
        tokio::fs::write(&input, wav).await?;

        let args = self.build_args(&input, &output_stem, params);
        debug!(executable = %self.executable.display(), ?args, "Spawning whisper.cpp");

        let output = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Inference(format!("Failed to start whisper.cpp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Inference(format!(
                "whisper.cpp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let json = tokio::fs::read(output_stem.with_extension("json")).await?;
        let mut transcript = parse_whisper_json(&json)?;
        transcript.duration = samples.len() as f64 / TARGET_SAMPLE_RATE as f64;
        if transcript.language.is_none() {
            transcript.language = params.language_hint().map(str::to_string);
        }
        Ok(transcript)
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperCppRecognizer {
    fn model_id(&self) -> &str {
        &self.model_size
    }

    async fn transcribe(&self, samples: &[f32], params: &WhisperParams) -> Result<Transcript> {
        if samples.is_empty() {
            return Ok(Transcript {
                language: params.language_hint().map(str::to_string),
                ..Default::default()
            });
        }

        let work_dir =
            std::env::temp_dir().join(format!("sonora-whisper-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self.run(&work_dir, samples, params).await;

        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(dir = %work_dir.display(), "Failed to remove whisper.cpp work dir: {err}");
        }
        result
    }
}

fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return executable.is_file().then(|| executable.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Deserialize)]
struct WhisperJson {
    #[serde(default)]
    result: Option<WhisperJsonResult>,
    #[serde(default)]
    transcription: Vec<WhisperJsonSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperJsonResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperJsonSegment {
    offsets: WhisperJsonOffsets,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperJsonOffsets {
    from: u64,
    to: u64,
}

/// Parse the `-oj` output of whisper.cpp. Offsets are milliseconds.
pub(crate) fn parse_whisper_json(bytes: &[u8]) -> Result<Transcript> {
    let parsed: WhisperJson = serde_json::from_slice(bytes)
        .map_err(|e| Error::Inference(format!("Invalid whisper.cpp output: {e}")))?;

    let segments = parsed
        .transcription
        .into_iter()
        .enumerate()
        .map(|(id, seg)| Segment {
            id,
            start: seg.offsets.from as f64 / 1000.0,
            end: seg.offsets.to as f64 / 1000.0,
            text: seg.text,
            avg_logprob: None,
            no_speech_prob: None,
        })
        .collect();

    Ok(Transcript {
        language: parsed
            .result
            .and_then(|r| r.language)
            .filter(|l| !l.is_empty()),
        segments,
        duration: 0.0,
    })
}
