//! Shared constants/setters for things
//!

use std::sync::LazyLock;

/// Extension given to every stored image
pub const IMAGE_EXTENSION: &str = "jpg";

/// URL prefix generated images are served under
pub const IMAGES_URL_PREFIX: &str = "/images";

/// Max age (in seconds) for image cache entries.
pub const IMAGE_CACHE_MAX_AGE_SECONDS: u64 = 60 * 60;

/// Shared cache max age (in seconds) for image cache entries.
pub const IMAGE_CACHE_S_MAXAGE_SECONDS: u64 = 60 * 60 * 24;

/// Cache-Control value for image responses.
pub static IMAGE_CACHE_CONTROL: LazyLock<String> = LazyLock::new(|| {
    format!(
        "public, max-age={}, s-maxage={}, immutable",
        IMAGE_CACHE_MAX_AGE_SECONDS, IMAGE_CACHE_S_MAXAGE_SECONDS,
    )
});

/// Public URL for a stored image
pub fn image_url(filename: &str) -> String {
    format!("{IMAGES_URL_PREFIX}/{filename}")
}
