//! HTTP front door for a model directory (spec §6 wire protocol): plain
//! `GET /manifest.json` and `GET /<filename>` for each shard, the
//! counterpart the downloader's `${base_url}/...` requests expect. New
//! code in the teacher's idiom (`axum` is the ecosystem-standard minimal
//! router for exactly this shape; the teacher itself never serves HTTP, it
//! only consumes it).

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

#[derive(Clone)]
struct ServeState {
    dir: Arc<PathBuf>,
}

pub fn router(model_dir: PathBuf) -> Router {
    let state = ServeState {
        dir: Arc::new(model_dir),
    };
    Router::new()
        .route("/manifest.json", get(get_manifest))
        .route("/:filename", get(get_file))
        .with_state(state)
}

async fn get_manifest(State(state): State<ServeState>) -> Response {
    serve_file(&state.dir.join("manifest.json"), "application/json").await
}

async fn get_file(State(state): State<ServeState>, AxumPath(filename): AxumPath<String>) -> Response {
    // Reject path traversal; every legitimate request names a bare shard
    // or tokenizer filename with no directory component.
    if filename.contains('/') || filename.contains("..") {
        return (StatusCode::BAD_REQUEST, "invalid filename").into_response();
    }
    serve_file(&state.dir.join(&filename), "application/octet-stream").await
}

async fn serve_file(path: &std::path::Path, content_type: &'static str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let len = bytes.len();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, len)
                .body(Body::from(bytes))
                .unwrap()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "read error").into_response(),
    }
}
