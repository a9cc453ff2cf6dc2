use serde_json::{json, Value};

fn query(name: &str, ty: &str, description: &str) -> Value {
    json!({
        "name": name,
        "in": "query",
        "required": false,
        "schema": { "type": ty },
        "description": description,
    })
}

fn path_identifier() -> Value {
    json!({
        "name": "identifier",
        "in": "path",
        "required": true,
        "schema": { "type": "string", "format": "uuid" },
    })
}

fn error_response(description: &str) -> Value {
    json!({
        "description": description,
        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/Error" } } },
    })
}

fn upload_body() -> Value {
    json!({
        "required": true,
        "content": {
            "multipart/form-data": {
                "schema": {
                    "type": "object",
                    "properties": {
                        "file": { "type": "string", "format": "binary" },
                        "audio_base64": { "type": "string" },
                    },
                },
            },
            "application/json": {
                "schema": {
                    "type": "object",
                    "required": ["audio_base64"],
                    "properties": {
                        "audio_base64": { "type": "string" },
                        "file_name": { "type": "string" },
                    },
                },
            },
        },
    })
}

fn queued_responses() -> Value {
    json!({
        "201": {
            "description": "Task queued",
            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/TaskQueued" } } },
        },
        "400": error_response("Invalid parameters or empty upload"),
        "404": error_response("Unknown model"),
        "413": error_response("Upload exceeds the configured limit"),
        "415": error_response("Unsupported content type"),
    })
}

fn vad_parameters() -> Vec<Value> {
    vec![
        query("threshold", "number", "Speech probability threshold"),
        query("neg_threshold", "number", "Silence threshold, defaults to threshold - 0.15"),
        query("min_speech_duration_ms", "integer", "Shorter speech chunks are dropped"),
        query("max_speech_duration_s", "number", "Longer speech chunks are split"),
        query("min_silence_duration_ms", "integer", "Silence needed to close a chunk"),
        query("speech_pad_ms", "integer", "Padding added around each chunk"),
    ]
}

/// OpenAPI 3.1 description of every public route.
pub fn openapi_document() -> Value {
    let mut transcription_params = vec![
        query("model_size", "string", "Whisper model size, e.g. tiny, base, large-v3"),
        query("lang", "string", "Source language; omit or `auto` to detect"),
        query("is_translate", "boolean", "Translate into English"),
        query("beam_size", "integer", "Beam search width"),
        query("best_of", "integer", "Candidates when sampling"),
        query("temperature", "number", "Sampling temperature"),
        query("log_prob_threshold", "number", "Average log probability threshold"),
        query("no_speech_threshold", "number", "No-speech probability threshold"),
        query("initial_prompt", "string", "Prompt for the first window"),
        query("vad_filter", "boolean", "Transcribe only detected speech"),
    ];
    transcription_params.extend(vad_parameters());
    transcription_params.push(query("is_separate_bgm", "boolean", "Remove background music first"));
    transcription_params.push(query("uvr_model_size", "string", "Separation model used with is_separate_bgm"));

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Sonora API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Transcription, voice activity detection and background music separation as background tasks.",
        },
        "paths": {
            "/transcription": {
                "post": {
                    "tags": ["Transcription"],
                    "summary": "Transcribe an audio file",
                    "parameters": transcription_params,
                    "requestBody": upload_body(),
                    "responses": queued_responses(),
                },
            },
            "/vad": {
                "post": {
                    "tags": ["Voice Activity Detection"],
                    "summary": "Detect speech segments",
                    "parameters": vad_parameters(),
                    "requestBody": upload_body(),
                    "responses": queued_responses(),
                },
            },
            "/bgm-separation": {
                "post": {
                    "tags": ["BGM Separation"],
                    "summary": "Split a stereo recording into instrumental and vocals",
                    "parameters": [query("model_size", "string", "center-mask-hq or center-mask-fast")],
                    "requestBody": upload_body(),
                    "responses": queued_responses(),
                },
            },
            "/task": {
                "get": {
                    "tags": ["Tasks"],
                    "summary": "List recent tasks",
                    "parameters": [query("limit", "integer", "Maximum tasks returned (default 50, max 500)")],
                    "responses": {
                        "200": {
                            "description": "Tasks, newest first",
                            "content": { "application/json": { "schema": {
                                "type": "object",
                                "properties": { "tasks": { "type": "array", "items": { "$ref": "#/components/schemas/Task" } } },
                            } } },
                        },
                    },
                },
            },
            "/task/{identifier}": {
                "get": {
                    "tags": ["Tasks"],
                    "summary": "Get task status, progress and result",
                    "parameters": [path_identifier()],
                    "responses": {
                        "200": {
                            "description": "Task",
                            "content": { "application/json": { "schema": { "$ref": "#/components/schemas/Task" } } },
                        },
                        "404": error_response("Unknown task"),
                    },
                },
            },
            "/task/file/{identifier}": {
                "get": {
                    "tags": ["Tasks"],
                    "summary": "Download a task result file",
                    "description": "Transcriptions render as subtitles; separations download as a zip of instrumental.wav and vocals.wav.",
                    "parameters": [
                        path_identifier(),
                        query("format", "string", "srt, vtt, txt or json (transcription only, default srt)"),
                    ],
                    "responses": {
                        "200": { "description": "Result file" },
                        "400": error_response("Task has no file result"),
                        "404": error_response("Unknown task or expired result"),
                        "409": error_response("Task not completed"),
                    },
                },
            },
            "/health": {
                "get": {
                    "tags": ["Internal"],
                    "summary": "Liveness and loaded models",
                    "responses": { "200": { "description": "Server is up" } },
                },
            },
        },
        "components": {
            "schemas": {
                "Error": {
                    "type": "object",
                    "required": ["detail"],
                    "properties": { "detail": { "type": "string" } },
                },
                "TaskQueued": {
                    "type": "object",
                    "properties": {
                        "identifier": { "type": "string" },
                        "status": { "type": "string" },
                        "message": { "type": "string" },
                    },
                },
                "Task": {
                    "type": "object",
                    "properties": {
                        "identifier": { "type": "string" },
                        "status": { "type": "string", "enum": ["queued", "in_progress", "completed", "failed", "cancelled"] },
                        "task_type": { "type": "string", "enum": ["transcription", "vad", "bgm_separation"] },
                        "file_name": { "type": ["string", "null"] },
                        "language": { "type": ["string", "null"] },
                        "audio_duration": { "type": ["number", "null"] },
                        "duration": { "type": ["number", "null"] },
                        "progress": { "type": "number" },
                        "task_params": { "type": "object" },
                        "result": {},
                        "result_type": { "type": "string", "enum": ["json", "filepath"] },
                        "error": { "type": ["string", "null"] },
                        "created_at": { "type": "integer" },
                        "updated_at": { "type": "integer" },
                    },
                },
            },
        },
    })
}
