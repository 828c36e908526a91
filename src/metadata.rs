//! Generation parameters embedded in the images we store.
//!
//! The record is serialized as JSON into the EXIF `ImageDescription` field,
//! so each file on disk carries its own provenance.

use std::io::Cursor;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::exif::{self, ExifError};

/// Provenance record stored inside every generated image.
///
/// Loosely typed fields hold the value exactly as the client sent it, so a
/// numeric string stays a string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Model identifier, absent for image-to-image generations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// The text prompt.
    pub prompt: String,
    /// Image size preset or explicit dimensions.
    pub image_size: Value,
    /// Step count as provided by the client.
    pub num_inference_steps: Value,
    /// Guidance scale, when the model takes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<Value>,
    /// FLUX Pro safety tolerance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<Value>,
    /// Image-to-image strength.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<Value>,
    /// Seed reported by the generation service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// ISO-8601 creation time.
    pub timestamp: String,
}

/// Current UTC time formatted like `2024-08-01T12:00:00.000Z`.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// What [`read_embedded`] found in an image.
#[derive(Clone, Debug, PartialEq)]
pub enum EmbeddedMetadata {
    /// The image has no EXIF block at all.
    NoExif,
    /// EXIF is present but carries no description record.
    NoDescription,
    /// The parsed record, returned verbatim.
    Found(Value),
}

/// Metadata codec failures.
#[derive(Debug)]
pub enum MetadataError {
    /// The bytes could not be decoded as an image.
    InvalidImage(String),
    /// Re-encoding to JPEG failed.
    Encode(String),
    /// The JPEG structure is damaged.
    Exif(ExifError),
    /// The record is too large to embed.
    TooLarge(usize),
    /// The description is not valid JSON.
    Parse(serde_json::Error),
    /// The record could not be serialized.
    Serialize(serde_json::Error),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidImage(err) => write!(f, "Invalid image data: {err}"),
            Self::Encode(err) => write!(f, "Failed to encode JPEG: {err}"),
            Self::Exif(err) => write!(f, "Invalid EXIF data: {err}"),
            Self::TooLarge(len) => write!(f, "Metadata of {len} bytes is too large to embed"),
            Self::Parse(err) => write!(f, "{err}"),
            Self::Serialize(err) => write!(f, "Failed to serialize metadata: {err}"),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<ExifError> for MetadataError {
    fn from(err: ExifError) -> Self {
        match err {
            ExifError::TooLarge(len) => MetadataError::TooLarge(len),
            other => MetadataError::Exif(other),
        }
    }
}

/// Returns JPEG bytes with `metadata` embedded as the image description.
pub fn embed(image_bytes: &[u8], metadata: &ImageMetadata) -> Result<Vec<u8>, MetadataError> {
    let description = serde_json::to_string(metadata).map_err(MetadataError::Serialize)?;
    debug!("Embedding metadata: {}", description);
    let jpeg = normalize_image_to_jpeg(image_bytes)?;
    Ok(exif::with_image_description(&jpeg, &description)?)
}

/// Reads the embedded record back out of `image_bytes`.
pub fn read_embedded(image_bytes: &[u8]) -> Result<EmbeddedMetadata, MetadataError> {
    let Some(tiff) = exif::find_exif(image_bytes)? else {
        return Ok(EmbeddedMetadata::NoExif);
    };
    debug!("EXIF data found, length: {}", tiff.len());

    let description = match exif::image_description(tiff) {
        Some(description) if !description.is_empty() => description,
        _ => return Ok(EmbeddedMetadata::NoDescription),
    };
    match serde_json::from_str::<Value>(&description).map_err(MetadataError::Parse)? {
        Value::Null => Ok(EmbeddedMetadata::NoDescription),
        value => Ok(EmbeddedMetadata::Found(value)),
    }
}

/// Ensures image bytes are a JPEG, converting if possible.
///
/// JPEG input is returned untouched so no generation loss is added.
fn normalize_image_to_jpeg(bytes: &[u8]) -> Result<Vec<u8>, MetadataError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| MetadataError::InvalidImage(err.to_string()))?;
    let format = reader.format();
    if format == Some(image::ImageFormat::Jpeg) {
        return Ok(bytes.to_vec());
    }

    let image = reader.decode().map_err(|err| {
        debug!("Failed to decode image: {}", err);
        MetadataError::InvalidImage(err.to_string())
    })?;

    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut output = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, 95);
    encoder
        .encode_image(&rgb)
        .map_err(|err| MetadataError::Encode(err.to_string()))?;
    Ok(output)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A small solid-colour JPEG.
    pub(crate) fn sample_jpeg() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 40, 10]));
        let mut output = Vec::new();
        image::codecs::jpeg::JpegEncoder::new(&mut output)
            .encode_image(&image)
            .expect("encode sample jpeg");
        output
    }

    pub(crate) fn sample_png() -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 40, 200, 128]));
        let mut output = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
            .expect("encode sample png");
        output
    }

    pub(crate) fn sample_metadata() -> ImageMetadata {
        ImageMetadata {
            model: Some("fal-ai/flux/dev".to_string()),
            prompt: "a red fox in the snow".to_string(),
            image_size: json!("landscape_4_3"),
            num_inference_steps: json!("28"),
            guidance_scale: Some(json!(3.5)),
            safety_tolerance: None,
            strength: None,
            seed: Some(1234567),
            timestamp: "2024-08-01T12:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn metadata_round_trips_through_a_jpeg() {
        let metadata = sample_metadata();
        let jpeg = embed(&sample_jpeg(), &metadata).expect("embed");

        let EmbeddedMetadata::Found(value) = read_embedded(&jpeg).expect("read") else {
            panic!("metadata missing");
        };
        assert_eq!(value["num_inference_steps"], json!("28"));
        assert!(value.get("strength").is_none());
        let decoded: ImageMetadata = serde_json::from_value(value).expect("typed metadata");
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn embedded_jpeg_still_decodes_to_the_same_pixels() {
        let original = sample_jpeg();
        let jpeg = embed(&original, &sample_metadata()).expect("embed");
        let before = image::load_from_memory(&original).expect("decode original");
        let after = image::load_from_memory(&jpeg).expect("decode embedded");
        assert_eq!(before.to_rgb8(), after.to_rgb8());
    }

    #[test]
    fn png_input_is_converted_to_jpeg() {
        let jpeg = embed(&sample_png(), &sample_metadata()).expect("embed png");
        assert_eq!(
            image::guess_format(&jpeg).expect("guess"),
            image::ImageFormat::Jpeg
        );
        assert!(matches!(
            read_embedded(&jpeg).expect("read"),
            EmbeddedMetadata::Found(_)
        ));
    }

    #[test]
    fn plain_jpeg_has_no_exif() {
        assert_eq!(
            read_embedded(&sample_jpeg()).expect("read"),
            EmbeddedMetadata::NoExif
        );
    }

    #[test]
    fn empty_or_null_description_is_missing_metadata() {
        let jpeg = exif::with_image_description(&sample_jpeg(), "").expect("write");
        assert_eq!(
            read_embedded(&jpeg).expect("read"),
            EmbeddedMetadata::NoDescription
        );
        let jpeg = exif::with_image_description(&sample_jpeg(), "null").expect("write");
        assert_eq!(
            read_embedded(&jpeg).expect("read"),
            EmbeddedMetadata::NoDescription
        );
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let jpeg = exif::with_image_description(&sample_jpeg(), "not { json").expect("write");
        assert!(matches!(
            read_embedded(&jpeg),
            Err(MetadataError::Parse(_))
        ));
    }

    #[test]
    fn garbage_is_rejected_on_embed() {
        assert!(matches!(
            embed(b"This is not an image.", &sample_metadata()),
            Err(MetadataError::InvalidImage(_))
        ));
    }

    #[test]
    fn timestamps_are_iso_8601_millis() {
        let stamp = timestamp_now();
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2024-08-01T12:00:00.000Z".len());
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }
}
