use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::Value;

use super::images::{
    ImageCacheHeaders, apply_cache_headers, is_not_modified, not_modified_response,
};
use super::prelude::*;
use crate::metadata::{EmbeddedMetadata, read_embedded};
use crate::storage::GalleryEntry;

/// handles GET /gallery
pub(crate) async fn gallery_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<GalleryEntry>>, ApiError> {
    let images = state.store.list().await.map_err(ApiError::gallery)?;
    Ok(Json(images))
}

/// handles GET /image-metadata/{filename}
pub(crate) async fn image_metadata_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!("Attempting to read metadata from: {}", filename);

    let Some(blob) = state
        .store
        .read(&filename)
        .await
        .map_err(ApiError::metadata)?
    else {
        return Err(ApiError::metadata(GalleryError::NotFound("Image not found")));
    };

    match read_embedded(&blob.bytes).map_err(|err| ApiError::metadata(err.into()))? {
        EmbeddedMetadata::NoExif => Err(ApiError::metadata(GalleryError::NotFound(
            "No EXIF data found",
        ))),
        EmbeddedMetadata::NoDescription => Err(ApiError::metadata(GalleryError::NotFound(
            "Metadata not found in EXIF",
        ))),
        EmbeddedMetadata::Found(value) => Ok(Json(value)),
    }
}

/// handles GET /images/{filename}
pub(crate) async fn image_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let Some(blob) = state
        .store
        .read(&filename)
        .await
        .map_err(ApiError::serving)?
    else {
        return Err(ApiError::serving(GalleryError::NotFound("Image not found")));
    };

    let cache_headers = ImageCacheHeaders::from_blob(&blob);
    if is_not_modified(&headers, &cache_headers) {
        return not_modified_response(&cache_headers).map_err(ApiError::serving);
    }
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "image/jpeg");
    apply_cache_headers(builder, &cache_headers)
        .body(Body::from(blob.bytes))
        .map_err(|err| ApiError::serving(err.into()))
}
