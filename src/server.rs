use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{StudioError, StudioResult};
use crate::llm::media::{
    detect_mime_type, extension_for_mime, normalize_image_mime_type, upload_supports_mime,
};
use crate::pipeline::{run_refine, run_remake, EntryView};
use crate::session::{SharedSession, SourceImage};
use crate::utils::timing::ActionTimer;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub api_key: Option<String>,
}

pub fn build_router(session: SharedSession) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/api/upload", post(upload))
        .route("/api/source", get(source_image))
        .route("/api/remake", post(remake))
        .route("/api/refine", post(refine))
        .route("/api/history", get(history_list))
        .route("/api/history/:index/image", get(history_image))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Remake Studio is running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn upload(
    State(session): State<SharedSession>,
    mut multipart: Multipart,
) -> StudioResult<Json<Value>> {
    let mut image_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        StudioError::UserInput(format!("Could not read the upload form: {err}"))
    })? {
        if field.name() != Some("image") {
            continue;
        }
        let bytes = field.bytes().await.map_err(|err| {
            StudioError::UserInput(format!("Could not read the uploaded file: {err}"))
        })?;
        image_bytes = Some(bytes.to_vec());
        break;
    }

    let bytes = image_bytes.ok_or_else(|| {
        StudioError::UserInput("The upload form had no 'image' field.".to_string())
    })?;
    if bytes.is_empty() {
        return Err(StudioError::UserInput("The uploaded file is empty.".to_string()));
    }

    // Trust the sniffed type over whatever the browser claims.
    let mime_type = detect_mime_type(&bytes)
        .map(|mime| normalize_image_mime_type(&mime))
        .ok_or_else(|| {
            StudioError::UserInput("The uploaded file is not a recognized image.".to_string())
        })?;
    if !upload_supports_mime(&mime_type) {
        return Err(StudioError::UserInput(format!(
            "Unsupported image type {mime_type}; upload a JPG, PNG, or WEBP."
        )));
    }

    let decoded = image::load_from_memory(&bytes).map_err(|err| {
        StudioError::UserInput(format!("The uploaded image could not be decoded: {err}"))
    })?;
    let (width, height) = (decoded.width(), decoded.height());

    info!("New source image uploaded: {mime_type}, {width}x{height}, {} bytes", bytes.len());
    session.lock().reset_with_source(SourceImage {
        bytes,
        mime_type: mime_type.clone(),
        width,
        height,
    });

    Ok(Json(json!({
        "mime": mime_type,
        "width": width,
        "height": height,
    })))
}

async fn source_image(State(session): State<SharedSession>) -> StudioResult<Response> {
    let locked = session.lock();
    let source = locked.require_source()?;
    Ok((
        [(header::CONTENT_TYPE, source.mime_type.clone())],
        source.bytes.clone(),
    )
        .into_response())
}

async fn remake(
    State(session): State<SharedSession>,
    payload: Option<Json<ActionRequest>>,
) -> StudioResult<Json<EntryView>> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let mut timer = ActionTimer::start("remake");
    let result = run_remake(&session, request.api_key.as_deref()).await;
    match &result {
        Ok(entry) => timer.complete("success", Some(format!("entry={}", entry.index))),
        Err(err) => timer.complete("error", Some(err.to_string())),
    }
    result.map(Json)
}

async fn refine(
    State(session): State<SharedSession>,
    payload: Option<Json<ActionRequest>>,
) -> StudioResult<Json<EntryView>> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let mut timer = ActionTimer::start("refine");
    let result = run_refine(&session, request.api_key.as_deref()).await;
    match &result {
        Ok(entry) => timer.complete("success", Some(format!("entry={}", entry.index))),
        Err(err) => timer.complete("error", Some(err.to_string())),
    }
    result.map(Json)
}

async fn history_list(State(session): State<SharedSession>) -> Json<Vec<EntryView>> {
    let locked = session.lock();
    Json(locked.history.entries().iter().map(EntryView::from_entry).collect())
}

// Raw stored bytes, untouched, so the download matches what the model
// returned at that step.
async fn history_image(
    State(session): State<SharedSession>,
    Path(index): Path<usize>,
) -> StudioResult<Response> {
    let locked = session.lock();
    let entry = locked.history.get(index).ok_or_else(|| {
        StudioError::NotFound(format!(
            "History entry {index} does not exist (history holds {} entries).",
            locked.history.len()
        ))
    })?;
    let filename = format!("remake-{index}.{}", extension_for_mime(&entry.image_mime));
    Ok((
        [
            (header::CONTENT_TYPE, entry.image_mime.clone()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        entry.image_bytes.clone(),
    )
        .into_response())
}
