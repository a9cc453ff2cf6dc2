use axum::{
    extract::Request,
    http::{Method, Uri},
    middleware, Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::api::request_context::{attach_request_context, REQUEST_ID_HEADER};
use crate::api::upload::body_limit;
use crate::error::ApiError;
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %request_id
        )
    });

    let upload_limit = body_limit(state.max_upload_bytes());

    Router::new()
        .merge(crate::api::docs::router())
        .merge(crate::api::internal::router())
        .merge(crate::api::transcription::router(upload_limit))
        .merge(crate::api::vad::router(upload_limit))
        .merge(crate::api::bgm_separation::router(upload_limit))
        .merge(crate::api::task::router())
        .fallback(route_not_found)
        .layer(trace_layer)
        .layer(middleware::from_fn(attach_request_context))
        .layer(cors_layer())
        .with_state(state)
}

/// Any origin and header, with credentials. DELETE is not offered.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn route_not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use sonora_core::ServerConfig;
    use tower::ServiceExt;

    use super::*;
    use crate::db::{init_db, TaskStatus};
    use crate::worker::tests::{stereo_wav, test_registry, wait_for_terminal};

    const BOUNDARY: &str = "sonora-test-boundary";

    async fn test_state(max_upload_mb: usize) -> AppState {
        let mut config = ServerConfig::default();
        config.server.max_upload_mb = max_upload_mb;
        config.cache.dir =
            std::env::temp_dir().join(format!("sonora-router-{}", uuid::Uuid::new_v4()));
        let store = init_db(":memory:").await.unwrap();
        AppState::new(config, store, test_registry())
    }

    fn multipart_request(uri: &str, file_name: &str, audio: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(audio);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn queue(app: &Router, uri: &str, audio: &[u8]) -> String {
        let response = app
            .clone()
            .oneshot(multipart_request(uri, "clip.wav", audio))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "queued");
        body["identifier"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn root_redirects_to_docs() {
        let app = create_router(test_state(10).await);
        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/docs");
    }

    #[tokio::test]
    async fn docs_and_schema_are_served() {
        let app = create_router(test_state(10).await);

        let docs = app.clone().oneshot(get("/docs")).await.unwrap();
        assert_eq!(docs.status(), StatusCode::OK);
        assert!(docs.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));

        let schema = json_body(app.oneshot(get("/openapi.json")).await.unwrap()).await;
        assert!(schema["paths"]["/bgm-separation"].is_object());
    }

    #[tokio::test]
    async fn cors_preflight_mirrors_origin_and_omits_delete() {
        let app = create_router(test_state(10).await);
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/transcription")
            .header(header::ORIGIN, "https://app.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-custom-header")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "x-custom-header"
        );
        let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .to_string();
        for method in ["GET", "POST", "PUT", "PATCH", "OPTIONS"] {
            assert!(methods.contains(method), "{methods}");
        }
        assert!(!methods.contains("DELETE"), "{methods}");
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let app = create_router(test_state(10).await);
        let request = Request::builder()
            .uri("/health")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_request_id_is_generated() {
        let app = create_router(test_state(10).await);
        let response = app.oneshot(get("/health")).await.unwrap();

        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok(), "{id}");
    }

    #[tokio::test]
    async fn transcription_upload_completes_and_renders_subtitles() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state);
        let id = queue(&app, "/transcription?lang=en", &stereo_wav(1.0)).await;

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert_eq!(task.language.as_deref(), Some("en"));

        let response = app
            .clone()
            .oneshot(get(&format!("/task/file/{id}?format=vtt")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("clip.vtt"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("WEBVTT"));
        assert!(text.contains("Hello from the test recognizer"));
    }

    #[tokio::test]
    async fn separation_result_downloads_as_zip() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state);
        let id = queue(&app, "/bgm-separation?model_size=center-mask-fast", &stereo_wav(0.5)).await;

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);

        let response = app
            .oneshot(get(&format!("/task/file/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["instrumental.wav", "vocals.wav"]);
    }

    #[tokio::test]
    async fn vad_results_have_no_file_download() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state);
        let id = queue(&app, "/vad?threshold=0.5", &stereo_wav(0.5)).await;
        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert!(task.result.unwrap().is_array());

        let response = app
            .oneshot(get(&format!("/task/file/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn file_download_conflicts_until_completed() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state.clone());
        let task = store
            .create_task(crate::db::NewTask {
                task_type: crate::db::TaskType::Transcription,
                file_name: None,
                language: None,
                task_params: serde_json::json!({}),
            })
            .await
            .unwrap();

        let response = app
            .oneshot(get(&format!("/task/file/{}", task.identifier)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(json_body(response).await["detail"].is_string());
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let app = create_router(test_state(10).await);
        let response = app
            .oneshot(multipart_request("/transcription", "empty.wav", b""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["detail"].as_str().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let app = create_router(test_state(0).await);
        let response = app
            .oneshot(multipart_request("/vad", "clip.wav", &stereo_wav(0.1)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn encoded(len: usize) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(vec![0u8; len])
    }

    #[tokio::test]
    async fn oversized_json_upload_is_rejected() {
        let mib = 1024 * 1024;
        let app = create_router(test_state(1).await);

        // Decodes to more than the 1 MiB limit but fits the body allowance.
        let over_limit = app
            .clone()
            .oneshot(json_request(
                "/vad",
                serde_json::json!({ "audio_base64": encoded(mib + mib / 2) }),
            ))
            .await
            .unwrap();
        assert_eq!(over_limit.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(json_body(over_limit).await["detail"].is_string());

        // Larger than the body allowance itself.
        let over_body = app
            .oneshot(json_request(
                "/vad",
                serde_json::json!({ "audio_base64": encoded(3 * mib) }),
            ))
            .await
            .unwrap();
        assert_eq!(over_body.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn json_upload_just_under_the_limit_is_accepted() {
        let mib = 1024 * 1024;
        let app = create_router(test_state(1).await);

        let response = app
            .oneshot(json_request(
                "/vad",
                serde_json::json!({ "audio_base64": encoded(mib * 9 / 10), "file_name": "clip.wav" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected_before_queueing() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state);

        let bad_threshold = app
            .clone()
            .oneshot(multipart_request("/vad?threshold=1.5", "clip.wav", &stereo_wav(0.1)))
            .await
            .unwrap();
        assert_eq!(bad_threshold.status(), StatusCode::BAD_REQUEST);

        let bad_transcription_vad = app
            .clone()
            .oneshot(multipart_request(
                "/transcription?vad_filter=true&threshold=1.5",
                "clip.wav",
                &stereo_wav(0.1),
            ))
            .await
            .unwrap();
        assert_eq!(bad_transcription_vad.status(), StatusCode::BAD_REQUEST);

        let bad_model = app
            .oneshot(multipart_request(
                "/bgm-separation?model_size=unknown",
                "clip.wav",
                &stereo_wav(0.1),
            ))
            .await
            .unwrap();
        assert_eq!(bad_model.status(), StatusCode::NOT_FOUND);

        assert!(store.list_tasks(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_audio_fails_the_task_not_the_request() {
        let state = test_state(10).await;
        let store = state.store.clone();
        let app = create_router(state);
        let id = queue(&app, "/vad", b"definitely not audio").await;

        let task = wait_for_terminal(&store, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let app = create_router(test_state(10).await);
        let response = app.oneshot(get("/task/missing")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["detail"], "Task missing not found");
    }

    #[tokio::test]
    async fn task_list_returns_newest_first() {
        let state = test_state(10).await;
        let app = create_router(state);
        let first = queue(&app, "/vad", &stereo_wav(0.1)).await;
        let second = queue(&app, "/vad", &stereo_wav(0.1)).await;

        let body = json_body(app.oneshot(get("/task?limit=1")).await.unwrap()).await;
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["identifier"], second.as_str());
        assert_ne!(first, second);
    }
}
