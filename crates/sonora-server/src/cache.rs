//! On-disk cache for file results, swept by a background janitor.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sonora_core::{encode_wav, SeparatedStems};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

pub const INSTRUMENTAL_FILE: &str = "instrumental.wav";
pub const VOCALS_FILE: &str = "vocals.wav";

/// Locations of separated stems, stored as a task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemFiles {
    pub instrumental_path: PathBuf,
    pub vocals_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    ttl: Duration,
    frequency: Duration,
}

impl ResultCache {
    pub fn new(dir: PathBuf, ttl_secs: u64, frequency_secs: u64) -> Self {
        Self {
            dir,
            ttl: Duration::from_secs(ttl_secs),
            frequency: Duration::from_secs(frequency_secs.max(1)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.dir.join(task_id)
    }

    pub async fn write_stems(
        &self,
        task_id: &str,
        stems: SeparatedStems,
    ) -> anyhow::Result<StemFiles> {
        let task_dir = self.task_dir(task_id);
        task::spawn_blocking(move || -> anyhow::Result<StemFiles> {
            std::fs::create_dir_all(&task_dir).with_context(|| {
                format!("Failed to create cache directory {}", task_dir.display())
            })?;

            let files = StemFiles {
                instrumental_path: task_dir.join(INSTRUMENTAL_FILE),
                vocals_path: task_dir.join(VOCALS_FILE),
            };
            for (buffer, path) in [
                (&stems.instrumental, &files.instrumental_path),
                (&stems.vocals, &files.vocals_path),
            ] {
                let wav = encode_wav(buffer)?;
                std::fs::write(path, wav)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            Ok(files)
        })
        .await
        .map_err(|err| anyhow!("Cache writer failed: {err}"))?
    }

    /// Delete cached entries last modified more than `ttl` before `now`.
    pub fn sweep(&self, now: SystemTime) -> anyhow::Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read cache dir {}", self.dir.display()))
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.ttl {
                continue;
            }

            let outcome = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match outcome {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed expired cache entry");
                    removed += 1;
                }
                Err(err) => warn!(path = %path.display(), "Failed to remove cache entry: {err}"),
            }
        }
        Ok(removed)
    }

    /// Sweep every `frequency` until the returned handle is aborted.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.frequency);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sweeper = cache.clone();
                match task::spawn_blocking(move || sweeper.sweep(SystemTime::now())).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(removed, "Cache cleanup removed expired results"),
                    Ok(Err(err)) => warn!("Cache cleanup failed: {err:#}"),
                    Err(err) => warn!("Cache cleanup task failed: {err}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use sonora_core::AudioBuffer;

    use super::*;

    fn temp_cache(ttl_secs: u64) -> ResultCache {
        let dir = std::env::temp_dir().join(format!("sonora-cache-{}", uuid::Uuid::new_v4()));
        ResultCache::new(dir, ttl_secs, 60)
    }

    fn stems() -> SeparatedStems {
        let buffer = AudioBuffer::new(vec![vec![0.1; 160], vec![-0.1; 160]], 16_000).unwrap();
        SeparatedStems {
            instrumental: buffer.clone(),
            vocals: buffer,
        }
    }

    #[tokio::test]
    async fn writes_both_stems_under_task_dir() {
        let cache = temp_cache(60);
        let files = cache.write_stems("task-1", stems()).await.unwrap();

        assert_eq!(files.vocals_path, cache.task_dir("task-1").join(VOCALS_FILE));
        let decoded =
            sonora_core::decode_audio_bytes(&std::fs::read(&files.instrumental_path).unwrap())
                .unwrap();
        assert_eq!(decoded.channel_count(), 2);
        assert_eq!(decoded.frames(), 160);
        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = temp_cache(60);
        cache.write_stems("task-1", stems()).await.unwrap();

        assert_eq!(cache.sweep(SystemTime::now()).unwrap(), 0);
        assert!(cache.task_dir("task-1").exists());

        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(cache.sweep(later).unwrap(), 1);
        assert!(!cache.task_dir("task-1").exists());
        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn sweeping_a_missing_dir_is_a_no_op() {
        assert_eq!(temp_cache(1).sweep(SystemTime::now()).unwrap(), 0);
    }
}
