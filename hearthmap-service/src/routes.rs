use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use hearthmap_core::models::GenerationStatus;

use crate::errors::ApiError;
use crate::large_tiles::TileKey;
use crate::AppState;

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub id: String,
    pub generation_status: GenerationStatus,
    pub generation_progress: i64,
    pub tile_count: i64,
    pub last_generated_at: Option<i64>,
    pub last_generation_duration_seconds: Option<i64>,
    pub generation_error: Option<String>,
}

pub async fn map_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let maps = Arc::clone(&state.maps);
    let row = tokio::task::spawn_blocking(move || maps.get_public_map(&id))
        .await
        .map_err(|e| ApiError::Internal(e.into()))??;
    Ok(Json(StatusResponse {
        id: row.id,
        generation_status: row.generation_status,
        generation_progress: row.generation_progress,
        tile_count: row.tile_count,
        last_generated_at: row.last_generated_at,
        last_generation_duration_seconds: row.last_generation_duration_seconds,
        generation_error: row.generation_error,
    }))
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub queued: bool,
}

pub async fn generate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    {
        let maps = Arc::clone(&state.maps);
        let id = id.clone();
        tokio::task::spawn_blocking(move || maps.get_public_map(&id))
            .await
            .map_err(|e| ApiError::Internal(e.into()))??;
    }
    if state.orchestrator.is_running(&id) {
        return Err(ApiError::Conflict(format!("generation already running for '{id}'")));
    }
    state.orchestrator.enqueue(&id);
    Ok((StatusCode::ACCEPTED, Json(GenerateResponse { queued: true })))
}

/// Serve one per-tenant large tile, generating it on demand. The route
/// accepts `{x}_{y}.webp` file names.
pub async fn large_tile(
    State(state): State<AppState>,
    Path((tenant_id, map_id, zoom, tile)): Path<(String, i64, u8, String)>,
) -> Result<Response, ApiError> {
    if zoom > crate::pyramid::MAX_ZOOM {
        return Err(ApiError::InvalidArgument(format!("zoom {zoom} out of range")));
    }
    let Some((x, y)) = parse_tile_name(&tile) else {
        return Err(ApiError::InvalidArgument(format!("bad tile name '{tile}'")));
    };
    let key = TileKey::new(&tenant_id, map_id, zoom, x, y);
    match Arc::clone(&state.large_tiles).get_or_generate(key).await? {
        Some(bytes) => {
            let mut resp = Response::new(bytes.into());
            resp.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/webp"));
            Ok(resp)
        }
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

fn parse_tile_name(name: &str) -> Option<(i32, i32)> {
    let stem = name.strip_suffix(".webp").unwrap_or(name);
    let (x, y) = stem.split_once('_')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}
