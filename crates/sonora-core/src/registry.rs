//! Model registry to ensure models are loaded once and shared across tasks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use crate::error::{Error, Result};
use crate::separation::{BgmSeparator, SeparatorPreset};
use crate::transcription::{
    SpeechRecognizer, TranscriptionPipeline, WhisperCppConfig, WhisperCppRecognizer,
    WHISPER_MODEL_SIZES,
};
use crate::vad::VoiceActivityDetector;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Builds recognizers for a model size.
#[async_trait]
pub trait RecognizerLoader: Send + Sync {
    async fn load(&self, model_size: &str) -> Result<Arc<dyn SpeechRecognizer>>;
}

pub struct WhisperCppLoader {
    config: WhisperCppConfig,
}

impl WhisperCppLoader {
    pub fn new(config: WhisperCppConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RecognizerLoader for WhisperCppLoader {
    async fn load(&self, model_size: &str) -> Result<Arc<dyn SpeechRecognizer>> {
        let config = self.config.clone();
        let model_size = model_size.to_string();
        let recognizer = tokio::task::spawn_blocking(move || {
            WhisperCppRecognizer::load(&config, &model_size)
        })
        .await
        .map_err(|e| Error::ModelLoad(e.to_string()))??;
        Ok(Arc::new(recognizer))
    }
}

/// Model families that may be released right after a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadPolicy {
    pub transcription: bool,
    pub bgm_separation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadedModels {
    pub transcription: Vec<String>,
    pub vad: bool,
    pub bgm_separation: Vec<String>,
}

#[derive(Clone)]
pub struct ModelRegistry {
    loader: Arc<dyn RecognizerLoader>,
    offload: OffloadPolicy,
    recognizers: Arc<RwLock<HashMap<String, Arc<OnceCell<Arc<dyn SpeechRecognizer>>>>>>,
    vad: Arc<RwLock<Option<Slot<VoiceActivityDetector>>>>,
    separators: Arc<RwLock<HashMap<SeparatorPreset, Slot<BgmSeparator>>>>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn RecognizerLoader>, offload: OffloadPolicy) -> Self {
        Self {
            loader,
            offload,
            recognizers: Arc::new(RwLock::new(HashMap::new())),
            vad: Arc::new(RwLock::new(None)),
            separators: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn offload_policy(&self) -> OffloadPolicy {
        self.offload
    }

    pub async fn load_transcription(&self, model_size: &str) -> Result<Arc<dyn SpeechRecognizer>> {
        if !WHISPER_MODEL_SIZES.contains(&model_size) {
            return Err(Error::ModelNotFound(format!(
                "Unknown whisper model size '{model_size}'. Available: {}",
                WHISPER_MODEL_SIZES.join(", ")
            )));
        }

        let cell = {
            let mut guard = self.recognizers.write().await;
            guard
                .entry(model_size.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let recognizer = cell
            .get_or_try_init(|| async {
                info!("Loading whisper model {model_size}");
                self.loader.load(model_size).await
            })
            .await?;

        Ok(recognizer.clone())
    }

    pub async fn load_vad(&self) -> Result<Arc<VoiceActivityDetector>> {
        let cell = {
            let mut guard = self.vad.write().await;
            guard.get_or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let detector = cell
            .get_or_try_init(|| async {
                info!("Loading VAD model");
                tokio::task::spawn_blocking(|| Arc::new(VoiceActivityDetector::new()))
                    .await
                    .map_err(|e| Error::ModelLoad(e.to_string()))
            })
            .await?;

        Ok(detector.clone())
    }

    pub async fn load_separator(&self, name: &str) -> Result<Arc<BgmSeparator>> {
        let preset: SeparatorPreset = name.parse()?;

        let cell = {
            let mut guard = self.separators.write().await;
            guard
                .entry(preset)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let separator = cell
            .get_or_try_init(|| async move {
                info!("Loading music separation model {preset}");
                tokio::task::spawn_blocking(move || Arc::new(BgmSeparator::new(preset)))
                    .await
                    .map_err(|e| Error::ModelLoad(e.to_string()))
            })
            .await?;

        Ok(separator.clone())
    }

    /// Recognizer wired with the pre-processing models a request asked for.
    pub async fn transcription_pipeline(
        &self,
        model_size: &str,
        with_vad: bool,
        separator: Option<&str>,
    ) -> Result<TranscriptionPipeline> {
        let mut pipeline = TranscriptionPipeline::new(self.load_transcription(model_size).await?);
        if with_vad {
            pipeline = pipeline.with_vad(self.load_vad().await?);
        }
        if let Some(name) = separator {
            pipeline = pipeline.with_separator(self.load_separator(name).await?);
        }
        Ok(pipeline)
    }

    pub async fn unload_transcription(&self, model_size: &str) {
        let mut guard = self.recognizers.write().await;
        if guard.remove(model_size).is_some() {
            info!("Unloaded whisper model {model_size}");
        }
    }

    pub async fn unload_separator(&self, name: &str) -> Result<()> {
        let preset: SeparatorPreset = name.parse()?;
        let mut guard = self.separators.write().await;
        if guard.remove(&preset).is_some() {
            info!("Unloaded music separation model {preset}");
        }
        Ok(())
    }

    /// Drop every registry reference. Tasks still holding a model keep it alive
    /// until they finish.
    pub async fn unload_all(&self) {
        self.recognizers.write().await.clear();
        self.vad.write().await.take();
        self.separators.write().await.clear();
        info!("Released all models");
    }

    /// Apply the offload policy after a task used the given models.
    pub async fn offload_after_use(&self, transcription: Option<&str>, separator: Option<&str>) {
        if self.offload.transcription {
            if let Some(model_size) = transcription {
                self.unload_transcription(model_size).await;
            }
        }
        if self.offload.bgm_separation {
            if let Some(name) = separator {
                // Names were validated when the model was loaded.
                let _ = self.unload_separator(name).await;
            }
        }
    }

    pub async fn loaded(&self) -> LoadedModels {
        let mut transcription: Vec<String> = self
            .recognizers
            .read()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(size, _)| size.clone())
            .collect();
        transcription.sort();

        let vad = self
            .vad
            .read()
            .await
            .as_ref()
            .is_some_and(|cell| cell.initialized());

        let mut bgm_separation: Vec<String> = self
            .separators
            .read()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(preset, _)| preset.name().to_string())
            .collect();
        bgm_separation.sort();

        LoadedModels {
            transcription,
            vad,
            bgm_separation,
        }
    }
}
