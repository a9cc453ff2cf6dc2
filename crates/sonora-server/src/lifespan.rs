//! Startup and shutdown sequencing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sonora_core::config::{default_config_path, is_test_env, load_server_config_from};
use sonora_core::env::{read_env_from, DEFAULT_ENV_FILE};
use sonora_core::{ModelRegistry, RecognizerLoader, WhisperCppLoader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::init_db;
use crate::state::AppState;

pub struct StartupOptions {
    pub config_path: PathBuf,
    pub env_file: PathBuf,
    /// Overrides the whisper.cpp backend.
    pub loader: Option<Arc<dyn RecognizerLoader>>,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            loader: None,
        }
    }
}

/// A started application: shared state plus background jobs owned by it.
pub struct Lifespan {
    pub state: AppState,
    janitor: JoinHandle<()>,
}

/// Config, `DB_URL`, database, then the three models. Any failure aborts boot.
pub async fn startup(options: StartupOptions) -> anyhow::Result<Lifespan> {
    let test = is_test_env();
    let config = load_server_config_from(&options.config_path, test)
        .with_context(|| format!("Failed to load config {}", options.config_path.display()))?;

    let db_url = read_env_from(&options.env_file, "DB_URL")?;
    let store = init_db(&db_url)
        .await
        .context("Failed to initialize the task database")?;

    let loader = options
        .loader
        .unwrap_or_else(|| Arc::new(WhisperCppLoader::new(config.whisper.cpp_config())));
    let registry = ModelRegistry::new(loader, config.offload_policy());

    registry
        .load_transcription(&config.whisper.model_size)
        .await
        .with_context(|| format!("Failed to load whisper model '{}'", config.whisper.model_size))?;
    registry.load_vad().await.context("Failed to load VAD model")?;
    registry
        .load_separator(&config.bgm_separation.model_size)
        .await
        .with_context(|| {
            format!(
                "Failed to load separation model '{}'",
                config.bgm_separation.model_size
            )
        })?;
    info!(
        whisper = %config.whisper.model_size,
        separator = %config.bgm_separation.model_size,
        test_profile = test,
        "Models loaded"
    );

    let state = AppState::new(config, store, registry);
    let janitor = state.cache.spawn_janitor();

    Ok(Lifespan { state, janitor })
}

impl Lifespan {
    /// Cancel unfinished tasks and release every model.
    pub async fn shutdown(self) {
        let aborted = self.state.worker.shutdown();
        match self.state.store.cancel_unfinished().await {
            Ok(cancelled) => info!(aborted, cancelled, "Cancelled unfinished tasks"),
            Err(err) => warn!("Failed to cancel unfinished tasks: {err:#}"),
        }
        self.janitor.abort();
        self.state.registry.unload_all().await;
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewTask, TaskStatus, TaskType};
    use crate::env_lock;
    use crate::worker::tests::FixedLoader;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sonora-lifespan-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn options(dir: &std::path::Path) -> StartupOptions {
        StartupOptions {
            config_path: dir.join("config.toml"),
            env_file: dir.join(".env"),
            loader: Some(Arc::new(FixedLoader)),
        }
    }

    #[tokio::test]
    async fn startup_fails_without_db_url() {
        let _guard = env_lock();
        std::env::remove_var("DB_URL");
        let dir = scratch_dir();

        let err = startup(options(&dir)).await.err().unwrap();
        assert!(format!("{err:#}").contains("DB_URL"), "{err:#}");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn startup_reads_db_url_from_env_file_and_loads_models() {
        let _guard = env_lock();
        std::env::remove_var("DB_URL");
        std::env::set_var("TEST_ENV", "true");
        let dir = scratch_dir();
        std::fs::write(
            dir.join(".env"),
            format!("DB_URL=sqlite:///{}\n", dir.join("tasks.db").display()),
        )
        .unwrap();

        let lifespan = startup(options(&dir)).await.unwrap();
        std::env::remove_var("DB_URL");
        std::env::remove_var("TEST_ENV");

        assert!(dir.join("tasks.db").is_file());
        let loaded = lifespan.state.registry.loaded().await;
        assert_eq!(loaded.transcription, vec!["tiny".to_string()]);
        assert!(loaded.vad);
        assert_eq!(loaded.bgm_separation, vec!["center-mask-fast".to_string()]);

        let store = lifespan.state.store.clone();
        let registry = lifespan.state.registry.clone();
        let id = store
            .create_task(NewTask {
                task_type: TaskType::Vad,
                file_name: None,
                language: None,
                task_params: serde_json::json!({}),
            })
            .await
            .unwrap()
            .identifier;

        lifespan.shutdown().await;

        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(registry.loaded().await, sonora_core::LoadedModels::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn startup_rejects_unsupported_database() {
        let _guard = env_lock();
        std::env::set_var("DB_URL", "postgresql://localhost/sonora");
        let dir = scratch_dir();

        let result = startup(options(&dir)).await;
        std::env::remove_var("DB_URL");

        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
