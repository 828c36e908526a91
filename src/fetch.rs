//! Downloads generated images and persists them with their metadata.

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::constants::{IMAGE_EXTENSION, image_url};
use crate::error::GalleryError;
use crate::metadata::ImageMetadata;
use crate::storage::ImageStore;

/// A fresh, effectively unique file name for a stored image.
pub fn new_image_filename() -> String {
    format!("{}.{}", Uuid::new_v4(), IMAGE_EXTENSION)
}

/// Fetches `remote_url` and stores it with `metadata` embedded.
///
/// Returns the public URL of the stored copy. There is no retry; any
/// transport failure or non-2xx status is a [`GalleryError::Network`].
#[instrument(skip(http, store, metadata))]
pub async fn fetch_and_store(
    http: &reqwest::Client,
    store: &dyn ImageStore,
    remote_url: &str,
    metadata: &ImageMetadata,
) -> Result<String, GalleryError> {
    let response = http
        .get(remote_url)
        .send()
        .await
        .map_err(|err| GalleryError::Network(format!("Failed to download image: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(GalleryError::Network(format!(
            "Image download error {status} for {remote_url}"
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| GalleryError::Network(format!("Failed to read image bytes: {err}")))?;
    debug!("Downloaded {} bytes", bytes.len());

    let filename = new_image_filename();
    store.write(&filename, bytes.to_vec(), metadata).await?;
    Ok(image_url(&filename))
}
