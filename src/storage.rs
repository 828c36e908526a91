//! Where generated images live.
//!
//! [`ImageStore`] hides the flat image directory behind list/read/write so a
//! real index could replace it without touching the handlers.

use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::constants::{IMAGE_EXTENSION, image_url};
use crate::error::GalleryError;
use crate::metadata::{self, ImageMetadata};

/// Boxed future returned by [`ImageStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GalleryError>> + Send + 'a>>;

/// One row of the gallery listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GalleryEntry {
    /// File name inside the store
    pub filename: String,
    /// Public URL of the image
    pub url: String,
    /// When the image was created
    pub created: DateTime<Utc>,
}

impl GalleryEntry {
    /// Builds an entry for `filename` created at `created`.
    pub fn new(filename: String, created: DateTime<Utc>) -> Self {
        Self {
            url: image_url(&filename),
            filename,
            created,
        }
    }
}

/// Stored image bytes plus what caching needs.
#[derive(Clone, Debug)]
pub struct ImageBlob {
    /// Raw file contents
    pub bytes: Vec<u8>,
    /// Last modification time, when known
    pub modified: Option<SystemTime>,
}

/// Storage for generated images and their embedded metadata.
pub trait ImageStore: Send + Sync + std::fmt::Debug {
    /// All stored images, newest first.
    fn list(&self) -> StoreFuture<'_, Vec<GalleryEntry>>;

    /// The image called `filename`, or `None` if there is no such image.
    fn read<'a>(&'a self, filename: &'a str) -> StoreFuture<'a, Option<ImageBlob>>;

    /// Stores `bytes` as `filename` with `metadata` attached.
    fn write<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
        metadata: &'a ImageMetadata,
    ) -> StoreFuture<'a, ()>;
}

/// Returns true for a bare file name that cannot escape the store.
pub fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0'])
}

/// Sorts newest first, ties broken by name.
pub fn sort_newest_first(entries: &mut [GalleryEntry]) {
    entries.sort_by(|a, b| {
        b.created
            .cmp(&a.created)
            .then_with(|| a.filename.cmp(&b.filename))
    });
}

/// A flat directory of JPEG files with EXIF-embedded metadata.
#[derive(Clone, Debug)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    /// Uses `root` as the image directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the image directory if needed.
    pub async fn ensure_root(&self) -> Result<(), GalleryError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_jpg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION))
                .unwrap_or(false);
            if !is_jpg {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let stats = entry.metadata().await?;
            if !stats.is_file() {
                continue;
            }
            // birth time isn't available everywhere
            let created = stats.created().or_else(|_| stats.modified())?;
            images.push(GalleryEntry::new(name.to_string(), created.into()));
        }
        sort_newest_first(&mut images);
        Ok(images)
    }

    async fn read_image(&self, filename: &str) -> Result<Option<ImageBlob>, GalleryError> {
        if !is_safe_filename(filename) {
            debug!("Refusing unsafe filename {:?}", filename);
            return Ok(None);
        }
        let path = self.root.join(filename);
        let stats = match tokio::fs::metadata(&path).await {
            Ok(stats) if stats.is_file() => stats,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(ImageBlob {
                bytes,
                modified: stats.modified().ok(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_image(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        metadata: &ImageMetadata,
    ) -> Result<(), GalleryError> {
        if !is_safe_filename(filename) {
            return Err(GalleryError::InternalServerError(format!(
                "Invalid image filename {filename:?}"
            )));
        }
        let record = metadata.clone();
        // decoding and re-encoding is CPU bound
        let encoded = tokio::task::spawn_blocking(move || metadata::embed(&bytes, &record))
            .await
            .map_err(|err| GalleryError::InternalServerError(format!("Embed task failed: {err}")))??;
        let path = self.root.join(filename);
        tokio::fs::write(&path, encoded).await?;
        info!("Image saved with metadata: {}", path.display());
        Ok(())
    }
}

impl ImageStore for FsImageStore {
    fn list(&self) -> StoreFuture<'_, Vec<GalleryEntry>> {
        Box::pin(self.list_images())
    }

    fn read<'a>(&'a self, filename: &'a str) -> StoreFuture<'a, Option<ImageBlob>> {
        Box::pin(self.read_image(filename))
    }

    fn write<'a>(
        &'a self,
        filename: &'a str,
        bytes: Vec<u8>,
        metadata: &'a ImageMetadata,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.write_image(filename, bytes, metadata))
    }
}
