use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Backend;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub(super) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    identifier TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    task_type TEXT NOT NULL,
    file_name TEXT NULL,
    language TEXT NULL,
    audio_duration REAL NULL,
    duration REAL NULL,
    progress REAL NOT NULL DEFAULT 0,
    task_params TEXT NOT NULL,
    result TEXT NULL,
    result_type TEXT NOT NULL,
    error TEXT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
"#;

const TASK_COLUMNS: &str = "identifier, status, task_type, file_name, language, audio_duration, \
     duration, progress, task_params, result, result_type, error, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(anyhow!("Unknown task status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Transcription,
    Vad,
    BgmSeparation,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Vad => "vad",
            Self::BgmSeparation => "bgm_separation",
        }
    }

    pub fn result_type(self) -> ResultType {
        match self {
            Self::Transcription | Self::Vad => ResultType::Json,
            Self::BgmSeparation => ResultType::Filepath,
        }
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "transcription" => Ok(Self::Transcription),
            "vad" => Ok(Self::Vad),
            "bgm_separation" => Ok(Self::BgmSeparation),
            other => Err(anyhow!("Unknown task type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Json,
    Filepath,
}

impl ResultType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Filepath => "filepath",
        }
    }
}

impl FromStr for ResultType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "filepath" => Ok(Self::Filepath),
            other => Err(anyhow!("Unknown result type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub identifier: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub file_name: Option<String>,
    pub language: Option<String>,
    pub audio_duration: Option<f64>,
    pub duration: Option<f64>,
    pub progress: f64,
    pub task_params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub result_type: ResultType,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub file_name: Option<String>,
    pub language: Option<String>,
    pub task_params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub result: serde_json::Value,
    pub language: Option<String>,
    /// Processing wall time in seconds.
    pub duration: f64,
}

#[derive(Clone)]
pub struct TaskStore {
    backend: Backend,
}

impl TaskStore {
    pub(super) fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub async fn create_task(&self, task: NewTask) -> anyhow::Result<Task> {
        self.backend
            .run_blocking(move |conn| {
                let now = now_unix_millis_i64();
                let identifier = uuid::Uuid::new_v4().to_string();
                let params_json = serde_json::to_string(&task.task_params)
                    .context("Failed to serialize task parameters")?;

                conn.execute(
                    r#"
                    INSERT INTO tasks (
                        identifier, status, task_type, file_name, language, progress,
                        task_params, result_type, created_at, updated_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)
                    "#,
                    params![
                        &identifier,
                        TaskStatus::Queued.as_str(),
                        task.task_type.as_str(),
                        sanitize_optional_text(task.file_name.as_deref(), 260),
                        sanitize_optional_text(task.language.as_deref(), 40),
                        params_json,
                        task.task_type.result_type().as_str(),
                        now
                    ],
                )?;

                fetch_task(conn, &identifier)?
                    .ok_or_else(|| anyhow!("Failed to fetch created task"))
            })
            .await
    }

    /// Move a queued task to `in_progress`. Returns false if it was not queued.
    pub async fn mark_in_progress(&self, identifier: &str) -> anyhow::Result<bool> {
        let identifier = identifier.to_string();
        self.backend
            .run_blocking(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE identifier = ?1 AND status = ?4",
                    params![
                        identifier,
                        TaskStatus::InProgress.as_str(),
                        now_unix_millis_i64(),
                        TaskStatus::Queued.as_str()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn set_audio_duration(&self, identifier: &str, seconds: f64) -> anyhow::Result<()> {
        let identifier = identifier.to_string();
        let seconds = Some(seconds).filter(|v| v.is_finite() && *v >= 0.0);
        self.backend
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE tasks SET audio_duration = ?2, updated_at = ?3 WHERE identifier = ?1",
                    params![identifier, seconds, now_unix_millis_i64()],
                )?;
                Ok(())
            })
            .await
    }

    /// Raise the progress of a running task. Lower values are ignored.
    pub async fn update_progress(&self, identifier: &str, progress: f64) -> anyhow::Result<()> {
        let identifier = identifier.to_string();
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.backend
            .run_blocking(move |conn| {
                conn.execute(
                    r#"
                    UPDATE tasks
                    SET progress = MAX(progress, ?2), updated_at = ?3
                    WHERE identifier = ?1 AND status = ?4 AND progress < ?2
                    "#,
                    params![
                        identifier,
                        progress,
                        now_unix_millis_i64(),
                        TaskStatus::InProgress.as_str()
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn complete_task(
        &self,
        identifier: &str,
        completion: TaskCompletion,
    ) -> anyhow::Result<bool> {
        let identifier = identifier.to_string();
        self.backend
            .run_blocking(move |conn| {
                let result = serde_json::to_string(&completion.result)
                    .context("Failed to serialize task result")?;
                let changed = conn.execute(
                    r#"
                    UPDATE tasks
                    SET status = ?2, result = ?3, language = COALESCE(?4, language),
                        duration = ?5, progress = 1.0, error = NULL, updated_at = ?6
                    WHERE identifier = ?1 AND status = ?7
                    "#,
                    params![
                        identifier,
                        TaskStatus::Completed.as_str(),
                        result,
                        sanitize_optional_text(completion.language.as_deref(), 40),
                        finite_non_negative(completion.duration),
                        now_unix_millis_i64(),
                        TaskStatus::InProgress.as_str()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    pub async fn fail_task(
        &self,
        identifier: &str,
        error: &str,
        duration: Option<f64>,
    ) -> anyhow::Result<bool> {
        let identifier = identifier.to_string();
        let error = error.trim().to_string();
        self.backend
            .run_blocking(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE tasks
                    SET status = ?2, error = ?3, duration = ?4, updated_at = ?5
                    WHERE identifier = ?1 AND status IN (?6, ?7)
                    "#,
                    params![
                        identifier,
                        TaskStatus::Failed.as_str(),
                        error,
                        duration.and_then(finite_non_negative),
                        now_unix_millis_i64(),
                        TaskStatus::Queued.as_str(),
                        TaskStatus::InProgress.as_str()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Cancel every queued or running task. Returns how many were cancelled.
    pub async fn cancel_unfinished(&self) -> anyhow::Result<usize> {
        self.backend
            .run_blocking(|conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE tasks
                    SET status = ?1, error = COALESCE(error, 'Server shut down before the task finished'),
                        updated_at = ?2
                    WHERE status IN (?3, ?4)
                    "#,
                    params![
                        TaskStatus::Cancelled.as_str(),
                        now_unix_millis_i64(),
                        TaskStatus::Queued.as_str(),
                        TaskStatus::InProgress.as_str()
                    ],
                )?;
                Ok(changed)
            })
            .await
    }

    pub async fn get_task(&self, identifier: &str) -> anyhow::Result<Option<Task>> {
        let identifier = identifier.to_string();
        self.backend
            .run_blocking(move |conn| fetch_task(conn, &identifier))
            .await
    }

    /// Most recent tasks first.
    pub async fn list_tasks(&self, limit: Option<usize>) -> anyhow::Result<Vec<Task>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.backend
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], map_task_row)?;

                let mut tasks = Vec::new();
                for row in rows {
                    tasks.push(row??);
                }
                Ok(tasks)
            })
            .await
    }
}

fn fetch_task(conn: &Connection, identifier: &str) -> anyhow::Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE identifier = ?1"),
            params![identifier],
            map_task_row,
        )
        .optional()?;
    task.transpose()
}

/// Raw column values; enum and JSON decoding happen in [`TaskRow::into_task`].
struct TaskRow {
    identifier: String,
    status: String,
    task_type: String,
    file_name: Option<String>,
    language: Option<String>,
    audio_duration: Option<f64>,
    duration: Option<f64>,
    progress: f64,
    task_params: String,
    result: Option<String>,
    result_type: String,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> anyhow::Result<Task> {
        let result: Option<serde_json::Value> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Stored task result is not valid JSON")?;

        Ok(Task {
            identifier: self.identifier,
            status: self.status.parse()?,
            task_type: self.task_type.parse()?,
            file_name: self.file_name,
            language: self.language,
            audio_duration: self.audio_duration,
            duration: self.duration,
            progress: self.progress,
            task_params: serde_json::from_str(&self.task_params)
                .context("Stored task parameters are not valid JSON")?,
            result,
            result_type: self.result_type.parse()?,
            error: self.error,
            created_at: i64_to_u64(self.created_at),
            updated_at: i64_to_u64(self.updated_at),
        })
    }
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<anyhow::Result<Task>> {
    let raw = TaskRow {
        identifier: row.get(0)?,
        status: row.get(1)?,
        task_type: row.get(2)?,
        file_name: row.get(3)?,
        language: row.get(4)?,
        audio_duration: row.get(5)?,
        duration: row.get(6)?,
        progress: row.get(7)?,
        task_params: row.get(8)?,
        result: row.get(9)?,
        result_type: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    };
    Ok(raw.into_task())
}

fn sanitize_optional_text(raw: Option<&str>, max_chars: usize) -> Option<String> {
    let normalized = raw
        .unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.chars().take(max_chars).collect())
    }
}

fn finite_non_negative(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

fn now_unix_millis_i64() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}

fn i64_to_u64(value: i64) -> u64 {
    if value.is_negative() {
        0
    } else {
        value as u64
    }
}
