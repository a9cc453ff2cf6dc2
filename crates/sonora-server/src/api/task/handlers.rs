use std::io::{Cursor, Write};
use std::path::Path;

use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path as UrlPath, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use sonora_core::{subtitle, Segment, SubtitleFormat, Transcript};
use zip::write::SimpleFileOptions;

use crate::api::upload::{query_params, AudioUpload};
use crate::cache::{StemFiles, INSTRUMENTAL_FILE, VOCALS_FILE};
use crate::db::{NewTask, Task, TaskStatus, TaskType};
use crate::error::{map_store_error, ApiError};
use crate::state::AppState;
use crate::worker::{JobKind, TaskJob};

#[derive(Debug, Serialize)]
pub struct TaskQueuedResponse {
    pub identifier: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    format: Option<String>,
}

/// Persist a queued task and hand its audio to the worker.
pub(crate) async fn enqueue(
    state: &AppState,
    task_type: TaskType,
    upload: AudioUpload,
    language: Option<String>,
    kind: JobKind,
) -> Result<(StatusCode, Json<TaskQueuedResponse>), ApiError> {
    let task_params = serde_json::to_value(&kind)
        .map_err(|e| ApiError::internal(format!("Failed to encode task parameters: {e}")))?;
    let task = state
        .store
        .create_task(NewTask {
            task_type,
            file_name: upload.file_name,
            language,
            task_params,
        })
        .await
        .map_err(map_store_error)?;

    state.worker.submit(TaskJob {
        task_id: task.identifier.clone(),
        audio: upload.bytes,
        kind,
    });

    Ok((
        StatusCode::CREATED,
        Json(TaskQueuedResponse {
            message: format!("{} task has been queued", task_type.as_str()),
            identifier: task.identifier,
            status: task.status,
        }),
    ))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let query = query_params(query)?;
    let tasks = state
        .store
        .list_tasks(query.limit)
        .await
        .map_err(map_store_error)?;

    Ok(Json(TaskListResponse { tasks }))
}

pub async fn get_task(
    State(state): State<AppState>,
    UrlPath(identifier): UrlPath<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(find_task(&state, &identifier).await?))
}

pub async fn download_task_file(
    State(state): State<AppState>,
    UrlPath(identifier): UrlPath<String>,
    query: Result<Query<FileQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let query = query_params(query)?;
    let task = find_task(&state, &identifier).await?;

    if task.task_type == TaskType::Vad {
        return Err(ApiError::bad_request(
            "VAD results are JSON only, read them from GET /task/{identifier}",
        ));
    }
    if task.status != TaskStatus::Completed {
        return Err(ApiError::conflict(format!(
            "Task {} is {}, results are available once it is completed",
            task.identifier, task.status
        )));
    }

    match task.task_type {
        TaskType::Transcription => {
            let format = match query.format.as_deref() {
                Some(raw) => raw.parse::<SubtitleFormat>()?,
                None => SubtitleFormat::default(),
            };
            subtitle_response(&task, format)
        }
        TaskType::BgmSeparation => stems_response(&task).await,
        TaskType::Vad => Err(ApiError::bad_request("VAD results are JSON only")),
    }
}

async fn find_task(state: &AppState, identifier: &str) -> Result<Task, ApiError> {
    state
        .store
        .get_task(identifier)
        .await
        .map_err(map_store_error)?
        .ok_or_else(|| ApiError::not_found(format!("Task {identifier} not found")))
}

fn subtitle_response(task: &Task, format: SubtitleFormat) -> Result<Response, ApiError> {
    let result = task
        .result
        .clone()
        .ok_or_else(|| ApiError::internal("Completed task has no result"))?;
    let segments: Vec<Segment> = serde_json::from_value(result)
        .map_err(|e| ApiError::internal(format!("Stored transcript is malformed: {e}")))?;

    let transcript = Transcript {
        language: task.language.clone(),
        duration: task.audio_duration.unwrap_or_else(|| {
            segments.last().map(|segment| segment.end).unwrap_or_default()
        }),
        segments,
    };
    let body = subtitle::render(&transcript, format)?;

    file_response(
        body.into_bytes(),
        format.content_type(),
        &format!("{}.{}", download_stem(task), format.extension()),
    )
}

async fn stems_response(task: &Task) -> Result<Response, ApiError> {
    let result = task
        .result
        .clone()
        .ok_or_else(|| ApiError::internal("Completed task has no result"))?;
    let files: StemFiles = serde_json::from_value(result)
        .map_err(|e| ApiError::internal(format!("Stored stem paths are malformed: {e}")))?;

    let instrumental = read_stem(&files.instrumental_path).await?;
    let vocals = read_stem(&files.vocals_path).await?;
    let archive = tokio::task::spawn_blocking(move || {
        zip_stems(&[(INSTRUMENTAL_FILE, instrumental), (VOCALS_FILE, vocals)])
    })
    .await
    .map_err(|e| ApiError::internal(format!("Archive worker failed: {e}")))??;

    file_response(
        archive,
        "application/zip",
        &format!("{}.zip", download_stem(task)),
    )
}

async fn read_stem(path: &Path) -> Result<Vec<u8>, ApiError> {
    tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::not_found("Result files have expired from the cache")
        } else {
            ApiError::internal(format!("Failed reading {}: {e}", path.display()))
        }
    })
}

fn zip_stems(entries: &[(&str, Vec<u8>)]) -> Result<Vec<u8>, ApiError> {
    let map_zip = |e: zip::result::ZipError| ApiError::internal(format!("Failed to build archive: {e}"));

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in entries {
        writer.start_file(*name, options).map_err(map_zip)?;
        writer
            .write_all(bytes)
            .map_err(|e| ApiError::internal(format!("Failed to build archive: {e}")))?;
    }
    Ok(writer.finish().map_err(map_zip)?.into_inner())
}

/// Base name for downloads: the uploaded file name without extension.
fn download_stem(task: &Task) -> String {
    task.file_name
        .as_deref()
        .and_then(|name| Path::new(name).file_stem())
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.replace('"', ""))
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or_else(|| task.identifier.clone())
}

fn file_response(bytes: Vec<u8>, content_type: &str, filename: &str) -> Result<Response, ApiError> {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from(bytes))
        .map_err(|e| ApiError::internal(format!("Failed to build file response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(file_name: Option<&str>) -> Task {
        Task {
            identifier: "abc".to_string(),
            status: TaskStatus::Completed,
            task_type: TaskType::Transcription,
            file_name: file_name.map(str::to_string),
            language: None,
            audio_duration: None,
            duration: None,
            progress: 1.0,
            task_params: serde_json::json!({}),
            result: None,
            result_type: TaskType::Transcription.result_type(),
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn download_name_prefers_uploaded_file_stem() {
        assert_eq!(download_stem(&task(Some("podcast.mp3"))), "podcast");
        assert_eq!(download_stem(&task(None)), "abc");
        assert_eq!(download_stem(&task(Some(".."))), "abc");
    }

    #[test]
    fn zip_holds_every_entry() {
        let archive = zip_stems(&[("a.wav", vec![1, 2, 3]), ("b.wav", vec![4])]).unwrap();
        let mut reader = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.by_name("a.wav").unwrap().size(), 3);
    }
}
