//! HTTP surface of the daemon.
//!
//! Routes:
//! - `POST /verify`: multipart `image1`, `image2`
//! - `POST /analyze`: multipart `image`; query `fdr`, `minFaceWidthInPixels`, `numFacesToDetect`
//! - `POST /search`: multipart `gallery`, `probe`; query `maxGalleryFaces`, `candidates`
//! - `GET|POST /ping`: liveness
//!
//! Every upload is read fully and checked before anything touches disk;
//! files are then written into a per-request [`RequestScratch`] that is
//! released when the handler finishes, whatever the outcome.

use crate::engine::EngineHandle;
use crate::error::{ServiceError, ServiceResult};
use crate::scratch::RequestScratch;
use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use facegate_core::{AnalysisParams, AnalysisResult, SearchParams, SearchResult, VerificationResult};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    tmp_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(engine: EngineHandle, tmp_dir: PathBuf) -> Self {
        Self {
            engine,
            tmp_dir: Arc::new(tmp_dir),
        }
    }
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/verify", post(verify))
        .route("/analyze", post(analyze))
        .route("/search", post(search))
        .route("/ping", get(ping).post(ping))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn verify(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<VerificationResult>> {
    let [image1, image2] = read_fields(multipart?, ["image1", "image2"]).await?;

    let mut scratch = RequestScratch::new(&state.tmp_dir)?;
    let request_id = scratch.request_id();
    tracing::info!(%request_id, route = "/verify", "request accepted");
    let a = scratch.materialize("image1", &image1).await?;
    let b = scratch.materialize("image2", &image2).await?;

    let result = state.engine.verify([a, b]).await;
    finish(scratch);
    let result = result?;
    tracing::info!(%request_id, similarity = result.similarity, code = ?result.code, "verify answered");
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeQuery {
    fdr: Option<String>,
    #[serde(rename = "minFaceWidthInPixels")]
    min_face_width: Option<String>,
    #[serde(rename = "numFacesToDetect")]
    faces_to_detect: Option<String>,
}

async fn analyze(
    State(state): State<AppState>,
    query: Result<Query<AnalyzeQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<AnalysisResult>> {
    let Query(query) = query?;
    let params = AnalysisParams::from_query(
        query.fdr.as_deref(),
        query.min_face_width.as_deref(),
        query.faces_to_detect.as_deref(),
    )?;
    let [image] = read_fields(multipart?, ["image"]).await?;

    let mut scratch = RequestScratch::new(&state.tmp_dir)?;
    let request_id = scratch.request_id();
    tracing::info!(%request_id, route = "/analyze", ?params, "request accepted");
    let path = scratch.materialize("image", &image).await?;

    let result = state.engine.analyze(path, params).await;
    finish(scratch);
    let result = result?;
    tracing::info!(%request_id, faces = result.faces_detected, code = ?result.code, "analyze answered");
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(rename = "maxGalleryFaces")]
    max_gallery_faces: Option<String>,
    candidates: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ServiceResult<Json<SearchResult>> {
    let Query(query) = query?;
    let params = SearchParams::from_query(query.max_gallery_faces.as_deref(), query.candidates.as_deref())?;
    let [gallery, probe] = read_fields(multipart?, ["gallery", "probe"]).await?;

    let mut scratch = RequestScratch::new(&state.tmp_dir)?;
    let request_id = scratch.request_id();
    tracing::info!(%request_id, route = "/search", ?params, "request accepted");
    let gallery = scratch.materialize("gallery", &gallery).await?;
    let probe = scratch.materialize("probe", &probe).await?;

    let result = state.engine.search(gallery, probe, params).await;
    finish(scratch);
    let result = result?;
    tracing::info!(%request_id, enrolled = result.enrolled, candidates = result.candidates.len(), "search answered");
    Ok(Json(result))
}

/// Read the whole body and return the named fields in the order asked for.
///
/// Unknown fields are drained and ignored; a repeated field keeps its first
/// value. A missing or empty field is a bad request.
async fn read_fields<const N: usize>(
    mut multipart: Multipart,
    names: [&'static str; N],
) -> ServiceResult<[Bytes; N]> {
    let mut found: [Option<Bytes>; N] = std::array::from_fn(|_| None);

    while let Some(field) = multipart.next_field().await? {
        let Some(slot) = field.name().and_then(|n| names.iter().position(|w| *w == n)) else {
            continue;
        };
        let bytes = field.bytes().await?;
        if found[slot].is_none() {
            found[slot] = Some(bytes);
        }
    }
    tracing::debug!(
        fields = ?names.iter().zip(&found).filter(|(_, b)| b.is_some()).map(|(n, _)| *n).collect::<Vec<_>>(),
        "multipart read"
    );

    let mut out: [Bytes; N] = std::array::from_fn(|_| Bytes::new());
    for (slot, name) in names.iter().enumerate() {
        match found[slot].take() {
            Some(bytes) if !bytes.is_empty() => out[slot] = bytes,
            Some(_) => return Err(ServiceError::BadRequest(format!("form field '{name}' is empty"))),
            None => return Err(ServiceError::missing_field(name)),
        }
    }
    Ok(out)
}

fn finish(scratch: RequestScratch) {
    let request_id = scratch.request_id();
    if let Err(err) = scratch.release_all() {
        tracing::warn!(%request_id, error = %err, "scratch release failed");
    }
}
