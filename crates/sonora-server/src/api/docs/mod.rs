//! Interactive API documentation and the OpenAPI document behind it.

mod openapi;

use axum::{
    response::{Html, Redirect},
    routing::get,
    Json, Router,
};

use crate::state::AppState;

pub use openapi::openapi_document;

pub const DOCS_PATH: &str = "/docs";
pub const OPENAPI_PATH: &str = "/openapi.json";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(redirect_to_docs))
        .route(DOCS_PATH, get(docs_page))
        .route(OPENAPI_PATH, get(openapi_json))
}

pub async fn redirect_to_docs() -> Redirect {
    Redirect::temporary(DOCS_PATH)
}

pub async fn openapi_json() -> Json<serde_json::Value> {
    Json(openapi_document())
}

pub async fn docs_page() -> Html<&'static str> {
    Html(DOCS_HTML)
}

const DOCS_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Sonora API</title>
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 60rem; padding: 0 1rem; color: #1f2328; }
    h1 { margin-bottom: 0.25rem; }
    .op { border: 1px solid #d0d7de; border-radius: 6px; margin: 0.75rem 0; padding: 0.75rem 1rem; }
    .method { display: inline-block; min-width: 4rem; font-weight: 700; }
    .params { margin: 0.5rem 0 0; font-size: 0.9rem; color: #57606a; }
    code { background: #f6f8fa; padding: 0 0.25rem; border-radius: 4px; }
  </style>
</head>
<body>
  <h1>Sonora API</h1>
  <p>Transcription, voice activity detection and background music separation.
     Uploads return a task identifier; poll <code>GET /task/{identifier}</code> for progress.
     The raw document is at <a href="/openapi.json">/openapi.json</a>.</p>
  <div id="ops">Loading&hellip;</div>
  <script>
    fetch("/openapi.json")
      .then((res) => res.json())
      .then((doc) => {
        const root = document.getElementById("ops");
        root.textContent = "";
        for (const [path, item] of Object.entries(doc.paths)) {
          for (const [method, op] of Object.entries(item)) {
            const el = document.createElement("div");
            el.className = "op";
            const head = document.createElement("div");
            head.innerHTML = `<span class="method">${method.toUpperCase()}</span><code>${path}</code> ${op.summary || ""}`;
            el.appendChild(head);
            const params = (op.parameters || []).map((p) => p.name);
            if (params.length) {
              const list = document.createElement("div");
              list.className = "params";
              list.textContent = "Parameters: " + params.join(", ");
              el.appendChild(list);
            }
            root.appendChild(el);
          }
        }
      })
      .catch((err) => {
        document.getElementById("ops").textContent = "Failed to load /openapi.json: " + err;
      });
  </script>
</body>
</html>
"#;
