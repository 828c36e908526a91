use std::path::{Path as StdPath, PathBuf};

use axum::extract::Multipart;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::prelude::*;
use crate::fetch::fetch_and_store;
use crate::generation::{GenerateImageRequest, ImageToImageForm, ModelInput};
use crate::metadata::timestamp_now;

/// Body returned by both generation endpoints.
#[derive(Debug, Serialize)]
pub(crate) struct GenerateResponse {
    image_urls: Vec<String>,
}

/// handles POST /generate-image
pub(crate) async fn generate_image_handler(
    State(state): State<AppState>,
    body: Result<Json<GenerateImageRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        ApiError::generating(GalleryError::Validation(rejection.body_text()))
    })?;
    debug!("Request payload: {:?}", request);

    let image_urls = text_to_image(&state, &request)
        .await
        .map_err(ApiError::generating)?;
    Ok(Json(GenerateResponse { image_urls }))
}

#[instrument(skip_all, fields(model = %request.model))]
async fn text_to_image(
    state: &AppState,
    request: &GenerateImageRequest,
) -> Result<Vec<String>, GalleryError> {
    let input = ModelInput::try_from(request)?;
    let result = state.fal.submit(&input).await?;

    let mut image_urls = Vec::with_capacity(result.images.len());
    for image in &result.images {
        let metadata = request.metadata(&input, result.seed, timestamp_now());
        let url = fetch_and_store(&state.http, state.store.as_ref(), &image.url, &metadata).await?;
        image_urls.push(url);
    }
    Ok(image_urls)
}

/// A source image saved to the upload directory.
#[derive(Debug)]
struct UploadedFile {
    path: PathBuf,
    file_name: String,
    content_type: String,
}

/// The file part of the form, held in memory until the form is read.
struct FilePart {
    file_name: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// handles POST /generate-img2img
pub(crate) async fn generate_img2img_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let multipart = multipart.map_err(|rejection| {
        debug!("Not a multipart request: {}", rejection.body_text());
        ApiError::generating(GalleryError::NoUpload)
    })?;
    let (form, file) = read_form(multipart).await.map_err(ApiError::generating)?;
    let Some(file) = file else {
        return Err(ApiError::generating(GalleryError::NoUpload));
    };

    let upload = save_upload(&state.upload_dir, file)
        .await
        .map_err(ApiError::generating)?;
    let result = image_to_image(&state, &form, &upload).await;
    remove_upload(&upload.path).await;

    let image_urls = result.map_err(ApiError::generating)?;
    Ok(Json(GenerateResponse { image_urls }))
}

async fn read_form(
    mut multipart: Multipart,
) -> Result<(ImageToImageForm, Option<FilePart>), GalleryError> {
    let mut form = ImageToImageForm::default();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| GalleryError::Validation(err.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name == "file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| GalleryError::Validation(err.body_text()))?;
            // browsers send an empty part when no file was picked
            if (bytes.is_empty() && file_name.is_empty()) || file.is_some() {
                continue;
            }
            file = Some(FilePart {
                file_name: if file_name.is_empty() {
                    "upload".to_string()
                } else {
                    file_name
                },
                content_type,
                bytes: bytes.to_vec(),
            });
            continue;
        }

        let slot = match field_name.as_str() {
            "prompt" => &mut form.prompt,
            "strength" => &mut form.strength,
            "image_size" => &mut form.image_size,
            "num_inference_steps" => &mut form.num_inference_steps,
            "guidance_scale" => &mut form.guidance_scale,
            _ => continue,
        };
        let value = field
            .text()
            .await
            .map_err(|err| GalleryError::Validation(err.body_text()))?;
        *slot = Some(value);
    }
    Ok((form, file))
}

async fn save_upload(upload_dir: &StdPath, file: FilePart) -> Result<UploadedFile, GalleryError> {
    tokio::fs::create_dir_all(upload_dir).await?;
    let path = upload_dir.join(Uuid::new_v4().simple().to_string());
    tokio::fs::write(&path, &file.bytes).await?;
    debug!("Saved upload {} to {}", file.file_name, path.display());
    Ok(UploadedFile {
        path,
        file_name: file.file_name,
        content_type: file.content_type,
    })
}

async fn remove_upload(path: &StdPath) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove upload {}: {}", path.display(), err);
    }
}

#[instrument(skip_all, fields(file = %upload.file_name))]
async fn image_to_image(
    state: &AppState,
    form: &ImageToImageForm,
    upload: &UploadedFile,
) -> Result<Vec<String>, GalleryError> {
    let bytes = tokio::fs::read(&upload.path).await?;
    let image_url = state
        .fal
        .upload(bytes, &upload.file_name, &upload.content_type)
        .await?;
    let input = form.to_input(image_url)?;
    let result = state.fal.submit_image_to_image(&input).await?;

    let mut image_urls = Vec::with_capacity(result.images.len());
    for image in &result.images {
        let metadata = form.metadata(result.seed, timestamp_now());
        let url = fetch_and_store(&state.http, state.store.as_ref(), &image.url, &metadata).await?;
        image_urls.push(url);
    }
    Ok(image_urls)
}
