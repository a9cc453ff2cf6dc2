//! Background execution of queued tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sonora_core::{
    decode_audio_bytes, get_speech_timestamps, AudioBuffer, ModelRegistry, PipelineOptions,
    ProgressFn, SpeechSegment, VadOptions, WhisperParams,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::cache::ResultCache;
use crate::db::{TaskCompletion, TaskStore};

/// Inference requested by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Transcription {
        params: WhisperParams,
        options: PipelineOptions,
        /// Separation model used when `options.separate_bgm` is set.
        separator: String,
    },
    Vad {
        options: VadOptions,
    },
    BgmSeparation {
        model_size: String,
    },
}

#[derive(Debug, Clone)]
pub struct TaskJob {
    pub task_id: String,
    pub audio: Vec<u8>,
    pub kind: JobKind,
}

struct JobOutput {
    result: serde_json::Value,
    language: Option<String>,
}

#[derive(Clone)]
pub struct TaskWorker {
    store: TaskStore,
    registry: ModelRegistry,
    cache: ResultCache,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskWorker {
    pub fn new(
        store: TaskStore,
        registry: ModelRegistry,
        cache: ResultCache,
        max_concurrent_tasks: usize,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue a job. It starts once a concurrency permit is free.
    pub fn submit(&self, job: TaskJob) {
        let worker = self.clone();
        let task_id = job.task_id.clone();
        let span = info_span!("task", task_id = %task_id);

        let mut in_flight = self.lock_in_flight();
        let handle = tokio::spawn(
            async move {
                let id = job.task_id.clone();
                worker.run(job).await;
                worker.lock_in_flight().remove(&id);
            }
            .instrument(span),
        );
        in_flight.insert(task_id, handle);
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.lock_in_flight().keys().cloned().collect()
    }

    /// Abort queued and running jobs. Their rows are cancelled by the caller.
    pub fn shutdown(&self) -> usize {
        self.permits.close();
        let handles: Vec<_> = self.lock_in_flight().drain().collect();
        for (task_id, handle) in &handles {
            info!(task_id = %task_id, "Aborting unfinished task");
            handle.abort();
        }
        handles.len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(&self, job: TaskJob) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let task_id = job.task_id.clone();
        match self.store.mark_in_progress(&task_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Task is no longer queued, skipping");
                return;
            }
            Err(err) => {
                warn!("Failed to start task: {err:#}");
                return;
            }
        }

        let started = Instant::now();
        let outcome = self.execute(job).await;
        let elapsed = started.elapsed().as_secs_f64();

        let recorded = match outcome {
            Ok(output) => {
                info!(elapsed_secs = elapsed, "Task completed");
                self.store
                    .complete_task(
                        &task_id,
                        TaskCompletion {
                            result: output.result,
                            language: output.language,
                            duration: elapsed,
                        },
                    )
                    .await
            }
            Err(err) => {
                warn!("Task failed: {err:#}");
                self.store
                    .fail_task(&task_id, &format!("{err:#}"), Some(elapsed))
                    .await
            }
        };
        if let Err(err) = recorded {
            warn!("Failed to record task outcome: {err:#}");
        }
    }

    async fn execute(&self, job: TaskJob) -> anyhow::Result<JobOutput> {
        let TaskJob {
            task_id,
            audio,
            kind,
        } = job;

        let audio = tokio::task::spawn_blocking(move || decode_audio_bytes(&audio))
            .await
            .map_err(|err| anyhow!("Audio decoder failed: {err}"))??;
        self.store
            .set_audio_duration(&task_id, audio.duration_secs())
            .await?;

        match kind {
            JobKind::Transcription {
                params,
                options,
                separator,
            } => {
                self.transcribe(&task_id, audio, params, options, separator)
                    .await
            }
            JobKind::Vad { options } => self.detect_speech(audio, options).await,
            JobKind::BgmSeparation { model_size } => {
                self.separate(&task_id, audio, model_size).await
            }
        }
    }

    async fn transcribe(
        &self,
        task_id: &str,
        audio: AudioBuffer,
        params: WhisperParams,
        options: PipelineOptions,
        separator: String,
    ) -> anyhow::Result<JobOutput> {
        let separator = options.separate_bgm.then_some(separator);
        let pipeline = self
            .registry
            .transcription_pipeline(&params.model_size, options.vad_filter, separator.as_deref())
            .await?;

        let transcript = pipeline
            .run(audio, &params, &options, self.progress_reporter(task_id))
            .await;
        self.registry
            .offload_after_use(Some(&params.model_size), separator.as_deref())
            .await;
        let transcript = transcript?;

        Ok(JobOutput {
            language: transcript.language.clone(),
            result: serde_json::to_value(&transcript.segments)
                .context("Failed to serialize transcript")?,
        })
    }

    async fn detect_speech(&self, audio: AudioBuffer, options: VadOptions) -> anyhow::Result<JobOutput> {
        options.validate()?;
        let detector = self.registry.load_vad().await?;
        let segments = tokio::task::spawn_blocking(move || {
            let samples = audio.to_recognizer_input()?;
            let chunks = get_speech_timestamps(&detector, &samples, &options)?;
            Ok::<_, sonora_core::Error>(
                chunks
                    .into_iter()
                    .map(SpeechSegment::from)
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .map_err(|err| anyhow!("VAD worker failed: {err}"))??;

        Ok(JobOutput {
            result: serde_json::to_value(&segments).context("Failed to serialize speech segments")?,
            language: None,
        })
    }

    async fn separate(
        &self,
        task_id: &str,
        audio: AudioBuffer,
        model_size: String,
    ) -> anyhow::Result<JobOutput> {
        let separator = self.registry.load_separator(&model_size).await?;
        let progress = self.progress_reporter(task_id);

        let stems = tokio::task::spawn_blocking(move || {
            separator.separate(&audio, &|p| progress(p * 0.9))
        })
        .await
        .map_err(|err| anyhow!("Separation worker failed: {err}"));
        self.registry
            .offload_after_use(None, Some(&model_size))
            .await;

        let files = self.cache.write_stems(task_id, stems??).await?;
        Ok(JobOutput {
            result: serde_json::to_value(&files).context("Failed to serialize stem paths")?,
            language: None,
        })
    }

    /// Progress callback safe to call from blocking threads.
    fn progress_reporter(&self, task_id: &str) -> ProgressFn {
        let store = self.store.clone();
        let task_id = task_id.to_string();
        let runtime = tokio::runtime::Handle::current();
        Arc::new(move |progress: f32| {
            let store = store.clone();
            let task_id = task_id.clone();
            runtime.spawn(async move {
                if let Err(err) = store.update_progress(&task_id, progress as f64).await {
                    warn!(task_id = %task_id, "Failed to update progress: {err:#}");
                }
            });
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use sonora_core::{
        encode_wav, OffloadPolicy, RecognizerLoader, Segment, SpeechRecognizer, Transcript,
    };

    use super::*;
    use crate::db::{init_db, NewTask, Task, TaskStatus, TaskType};

    pub(crate) struct FixedRecognizer;

    #[async_trait]
    impl SpeechRecognizer for FixedRecognizer {
        fn model_id(&self) -> &str {
            "fixed"
        }

        async fn transcribe(
            &self,
            samples: &[f32],
            _params: &WhisperParams,
        ) -> sonora_core::Result<Transcript> {
            Ok(Transcript {
                language: Some("en".to_string()),
                segments: vec![Segment {
                    id: 0,
                    start: 0.0,
                    end: samples.len() as f64 / 16_000.0,
                    text: " Hello from the test recognizer ".to_string(),
                    avg_logprob: None,
                    no_speech_prob: None,
                }],
                duration: samples.len() as f64 / 16_000.0,
            })
        }
    }

    pub(crate) struct FixedLoader;

    #[async_trait]
    impl RecognizerLoader for FixedLoader {
        async fn load(&self, _model_size: &str) -> sonora_core::Result<Arc<dyn SpeechRecognizer>> {
            Ok(Arc::new(FixedRecognizer))
        }
    }

    pub(crate) fn test_registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(FixedLoader), OffloadPolicy::default())
    }

    pub(crate) fn stereo_wav(secs: f32) -> Vec<u8> {
        let frames = (secs * 16_000.0) as usize;
        let left: Vec<f32> = (0..frames)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 16_000.0).sin())
            .collect();
        let right = left.clone();
        encode_wav(&AudioBuffer::new(vec![left, right], 16_000).unwrap()).unwrap()
    }

    pub(crate) async fn wait_for_terminal(store: &TaskStore, id: &str) -> Task {
        for _ in 0..400 {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} did not finish");
    }

    async fn setup() -> (TaskWorker, TaskStore, ResultCache) {
        let store = init_db(":memory:").await.unwrap();
        let dir = std::env::temp_dir().join(format!("sonora-worker-{}", uuid::Uuid::new_v4()));
        let cache = ResultCache::new(dir, 60, 60);
        let worker = TaskWorker::new(store.clone(), test_registry(), cache.clone(), 1);
        (worker, store, cache)
    }

    async fn queue(store: &TaskStore, task_type: TaskType) -> String {
        store
            .create_task(NewTask {
                task_type,
                file_name: None,
                language: None,
                task_params: serde_json::json!({}),
            })
            .await
            .unwrap()
            .identifier
    }

    #[tokio::test]
    async fn transcription_job_stores_segments() {
        let (worker, store, _) = setup().await;
        let id = queue(&store, TaskType::Transcription).await;

        worker.submit(TaskJob {
            task_id: id.clone(),
            audio: stereo_wav(1.0),
            kind: JobKind::Transcription {
                params: WhisperParams::default(),
                options: PipelineOptions::default(),
                separator: "center-mask-fast".to_string(),
            },
        });

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.language.as_deref(), Some("en"));
        assert_eq!(task.audio_duration, Some(1.0));
        let result = task.result.unwrap();
        assert_eq!(result[0]["text"], "Hello from the test recognizer");
    }

    #[tokio::test]
    async fn undecodable_audio_fails_the_task() {
        let (worker, store, _) = setup().await;
        let id = queue(&store, TaskType::Vad).await;

        worker.submit(TaskJob {
            task_id: id.clone(),
            audio: b"definitely not audio".to_vec(),
            kind: JobKind::Vad {
                options: VadOptions::default(),
            },
        });

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(worker.in_flight().is_empty());
    }

    #[tokio::test]
    async fn separation_job_writes_stems() {
        let (worker, store, cache) = setup().await;
        let id = queue(&store, TaskType::BgmSeparation).await;

        worker.submit(TaskJob {
            task_id: id.clone(),
            audio: stereo_wav(0.5),
            kind: JobKind::BgmSeparation {
                model_size: "center-mask-fast".to_string(),
            },
        });

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        let files: crate::cache::StemFiles = serde_json::from_value(task.result.unwrap()).unwrap();
        assert!(files.vocals_path.is_file());
        assert!(files.instrumental_path.starts_with(cache.dir()));
        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn mono_separation_request_fails() {
        let (worker, store, _) = setup().await;
        let id = queue(&store, TaskType::BgmSeparation).await;
        let mono = encode_wav(&AudioBuffer::mono(vec![0.1; 8_000], 16_000).unwrap()).unwrap();

        worker.submit(TaskJob {
            task_id: id.clone(),
            audio: mono,
            kind: JobKind::BgmSeparation {
                model_size: "center-mask-fast".to_string(),
            },
        });

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("stereo"));
    }
}
