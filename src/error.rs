//! Error handling

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::metadata::MetadataError;

/// definitions for the falgallery application.
#[derive(Debug)]
pub enum GalleryError {
    /// Malformed or missing request fields
    Validation(String),
    /// The generation service rejected or failed the job
    Gateway {
        /// HTTP status returned upstream, if any
        status: Option<u16>,
        /// Human readable summary
        message: String,
        /// The upstream `detail` payload, usually validation errors
        detail: Option<Value>,
    },
    /// Downloading or uploading image bytes failed
    Network(String),
    /// Reading or writing the image directory failed
    Filesystem(std::io::Error),
    /// Embedding or reading image metadata failed
    Metadata(MetadataError),
    /// A requested resource is missing, with the client facing reason
    NotFound(&'static str),
    /// An image-to-image request arrived without a file
    NoUpload,
    /// Anything else
    InternalServerError(String),
}

impl std::fmt::Display for GalleryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "Invalid request: {message}"),
            Self::Gateway {
                status: Some(status),
                message,
                ..
            } => write!(f, "Generation service error {status}: {message}"),
            Self::Gateway { message, .. } => write!(f, "Generation service error: {message}"),
            Self::Network(message) => write!(f, "Network error: {message}"),
            Self::Filesystem(err) => write!(f, "Filesystem error: {err}"),
            Self::Metadata(err) => write!(f, "{err}"),
            Self::NotFound(reason) => write!(f, "{reason}"),
            Self::NoUpload => write!(f, "No file uploaded"),
            Self::InternalServerError(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for GalleryError {}

impl From<std::io::Error> for GalleryError {
    fn from(err: std::io::Error) -> Self {
        GalleryError::Filesystem(err)
    }
}

impl From<MetadataError> for GalleryError {
    fn from(err: MetadataError) -> Self {
        GalleryError::Metadata(err)
    }
}

impl From<url::ParseError> for GalleryError {
    fn from(err: url::ParseError) -> Self {
        GalleryError::InternalServerError(err.to_string())
    }
}

impl From<axum::http::Error> for GalleryError {
    fn from(err: axum::http::Error) -> Self {
        GalleryError::InternalServerError(err.to_string())
    }
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(rename = "validationErrors", skip_serializing_if = "Option::is_none")]
    validation_errors: Option<Value>,
}

/// A [`GalleryError`] raised while handling one endpoint.
///
/// `action` names what the endpoint was doing and becomes the `error` field
/// for failures that map to a 500.
#[derive(Debug)]
pub struct ApiError {
    action: &'static str,
    source: GalleryError,
}

impl ApiError {
    /// Wraps an error raised by the generation endpoints.
    pub fn generating(source: GalleryError) -> Self {
        Self {
            action: "Error generating image",
            source,
        }
    }

    /// Wraps an error raised by the gallery listing.
    pub fn gallery(source: GalleryError) -> Self {
        Self {
            action: "Error reading gallery",
            source,
        }
    }

    /// Wraps an error raised by the metadata lookup.
    pub fn metadata(source: GalleryError) -> Self {
        Self {
            action: "Error reading metadata",
            source,
        }
    }

    /// Wraps an error raised while serving image bytes.
    pub fn serving(source: GalleryError) -> Self {
        Self {
            action: "Error serving image",
            source,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.source {
            GalleryError::NotFound(reason) => {
                info!("404 {reason}");
                (
                    StatusCode::NOT_FOUND,
                    ErrorBody {
                        error: reason.to_string(),
                        details: None,
                        validation_errors: None,
                    },
                )
            }
            GalleryError::NoUpload => {
                info!("Bad request received: no file uploaded");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorBody {
                        error: "No file uploaded".to_string(),
                        details: None,
                        validation_errors: None,
                    },
                )
            }
            GalleryError::Metadata(MetadataError::Parse(err)) => {
                error!("Error parsing image description: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Error parsing image description".to_string(),
                        details: Some(err.to_string()),
                        validation_errors: None,
                    },
                )
            }
            GalleryError::Gateway {
                status,
                message,
                detail,
            } => {
                error!("{}: generation service error {:?}: {}", self.action, status, message);
                if let Some(detail) = &detail {
                    error!("Validation errors: {}", detail);
                }
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: self.action.to_string(),
                        details: Some(message),
                        validation_errors: detail,
                    },
                )
            }
            other => {
                error!("{}: {}", self.action, other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: self.action.to_string(),
                        details: Some(other.to_string()),
                        validation_errors: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
