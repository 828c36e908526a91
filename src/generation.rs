//! Request shapes for the FLUX models we front, validated into the exact
//! input payload each model takes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GalleryError;
use crate::metadata::ImageMetadata;

/// fal.ai endpoint for FLUX.1 [dev]
pub const FLUX_DEV: &str = "fal-ai/flux/dev";
/// fal.ai endpoint for FLUX.1 [pro]
pub const FLUX_PRO: &str = "fal-ai/flux-pro";
/// fal.ai endpoint for FLUX.1 [schnell]
pub const FLUX_SCHNELL: &str = "fal-ai/flux/schnell";
/// fal.ai endpoint for FLUX.1 [dev] image-to-image
pub const FLUX_DEV_IMAGE_TO_IMAGE: &str = "fal-ai/flux/dev/image-to-image";

/// JSON body of `POST /generate-image`.
///
/// Numeric fields are accepted as numbers or numeric strings, the way a
/// browser form serializes them.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GenerateImageRequest {
    /// Model identifier, one of the `FLUX_*` constants
    #[serde(default)]
    pub model: String,
    /// Text prompt
    #[serde(default)]
    pub prompt: Option<String>,
    /// Size preset such as `landscape_4_3`, or `{width, height}`
    #[serde(default)]
    pub image_size: Option<Value>,
    /// Number of denoising steps
    #[serde(default)]
    pub num_inference_steps: Option<Value>,
    /// How many images to generate, defaults to 1
    #[serde(default)]
    pub image_count: Option<Value>,
    /// Classifier-free guidance scale
    #[serde(default)]
    pub guidance_scale: Option<Value>,
    /// FLUX Pro safety tolerance, `1` (strict) to `6`
    #[serde(default)]
    pub safety_tolerance: Option<Value>,
}

/// Fields every text-to-image model takes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BaseInput {
    /// Text prompt
    pub prompt: String,
    /// Size preset or dimensions, passed through
    pub image_size: Value,
    /// Number of denoising steps
    pub num_inference_steps: u32,
    /// Number of images to generate
    pub num_images: u32,
}

/// FLUX.1 [dev] input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FluxDevInput {
    /// Shared fields
    #[serde(flatten)]
    pub base: BaseInput,
    /// Guidance scale
    pub guidance_scale: f64,
    /// Always `false`
    pub enable_safety_checker: bool,
}

/// FLUX.1 [pro] input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FluxProInput {
    /// Shared fields
    #[serde(flatten)]
    pub base: BaseInput,
    /// Guidance scale
    pub guidance_scale: f64,
    /// Safety tolerance, carried verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<String>,
}

/// FLUX.1 [schnell] input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FluxSchnellInput {
    /// Shared fields
    #[serde(flatten)]
    pub base: BaseInput,
    /// Always `false`
    pub enable_safety_checker: bool,
}

/// A validated text-to-image request, one variant per model.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelInput {
    /// `fal-ai/flux/dev`
    FluxDev(FluxDevInput),
    /// `fal-ai/flux-pro`
    FluxPro(FluxProInput),
    /// `fal-ai/flux/schnell`
    FluxSchnell(FluxSchnellInput),
}

impl ModelInput {
    /// The fal.ai endpoint this input is submitted to.
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::FluxDev(_) => FLUX_DEV,
            Self::FluxPro(_) => FLUX_PRO,
            Self::FluxSchnell(_) => FLUX_SCHNELL,
        }
    }

    /// The JSON payload sent to the generation service.
    pub fn payload(&self) -> Result<Value, GalleryError> {
        let value = match self {
            Self::FluxDev(input) => serde_json::to_value(input),
            Self::FluxPro(input) => serde_json::to_value(input),
            Self::FluxSchnell(input) => serde_json::to_value(input),
        };
        value.map_err(|err| GalleryError::InternalServerError(err.to_string()))
    }

    fn guidance_scale(&self) -> Option<f64> {
        match self {
            Self::FluxDev(input) => Some(input.guidance_scale),
            Self::FluxPro(input) => Some(input.guidance_scale),
            Self::FluxSchnell(_) => None,
        }
    }

    fn safety_tolerance(&self) -> Option<&str> {
        match self {
            Self::FluxPro(input) => input.safety_tolerance.as_deref(),
            _ => None,
        }
    }
}

impl TryFrom<&GenerateImageRequest> for ModelInput {
    type Error = GalleryError;

    fn try_from(request: &GenerateImageRequest) -> Result<Self, Self::Error> {
        let base = BaseInput {
            prompt: required_prompt(request.prompt.as_deref())?,
            image_size: required_image_size(request.image_size.as_ref())?,
            num_inference_steps: required_steps(request.num_inference_steps.as_ref())?,
            num_images: request
                .image_count
                .as_ref()
                .and_then(lenient_u32)
                .filter(|count| *count > 0)
                .unwrap_or(1),
        };

        match request.model.as_str() {
            FLUX_DEV => Ok(Self::FluxDev(FluxDevInput {
                base,
                guidance_scale: required_float("guidance_scale", request.guidance_scale.as_ref())?,
                enable_safety_checker: false,
            })),
            FLUX_PRO => Ok(Self::FluxPro(FluxProInput {
                base,
                guidance_scale: required_float("guidance_scale", request.guidance_scale.as_ref())?,
                safety_tolerance: request
                    .safety_tolerance
                    .as_ref()
                    .and_then(value_as_text),
            })),
            FLUX_SCHNELL => Ok(Self::FluxSchnell(FluxSchnellInput {
                base,
                enable_safety_checker: false,
            })),
            "" => Err(GalleryError::Validation("model is required".to_string())),
            other => Err(GalleryError::Validation(format!("unsupported model {other}"))),
        }
    }
}

impl GenerateImageRequest {
    /// Metadata to embed in each image this request produced.
    ///
    /// The step count keeps the client's original form; guidance scale and
    /// safety tolerance are the values actually sent to the model.
    pub fn metadata(&self, input: &ModelInput, seed: Option<u64>, timestamp: String) -> ImageMetadata {
        ImageMetadata {
            model: Some(input.model_id().to_string()),
            prompt: self.prompt.clone().unwrap_or_default(),
            image_size: self.image_size.clone().unwrap_or(Value::Null),
            num_inference_steps: self.num_inference_steps.clone().unwrap_or(Value::Null),
            guidance_scale: input
                .guidance_scale()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            safety_tolerance: input
                .safety_tolerance()
                .map(|tolerance| Value::String(tolerance.to_string())),
            strength: None,
            seed,
            timestamp,
        }
    }
}

/// Text fields of the `POST /generate-img2img` form, as received.
#[derive(Clone, Debug, Default)]
pub struct ImageToImageForm {
    /// Text prompt
    pub prompt: Option<String>,
    /// How strongly the source image constrains the result
    pub strength: Option<String>,
    /// Size preset
    pub image_size: Option<String>,
    /// Number of denoising steps
    pub num_inference_steps: Option<String>,
    /// Guidance scale
    pub guidance_scale: Option<String>,
}

/// FLUX.1 [dev] image-to-image input.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImageToImageInput {
    /// URL of the uploaded source image
    pub image_url: String,
    /// Text prompt
    pub prompt: String,
    /// 0 ignores the source image, 1 keeps it
    pub strength: f64,
    /// Size preset
    pub image_size: Value,
    /// Number of denoising steps
    pub num_inference_steps: u32,
    /// Guidance scale
    pub guidance_scale: f64,
    /// Always `false`
    pub enable_safety_checker: bool,
}

impl ImageToImageForm {
    /// Validates the form into a model input referencing `image_url`.
    pub fn to_input(&self, image_url: String) -> Result<ImageToImageInput, GalleryError> {
        Ok(ImageToImageInput {
            image_url,
            prompt: required_prompt(self.prompt.as_deref())?,
            strength: required_float("strength", self.strength.clone().map(Value::String).as_ref())?,
            image_size: required_image_size(self.image_size.clone().map(Value::String).as_ref())?,
            num_inference_steps: required_steps(
                self.num_inference_steps.clone().map(Value::String).as_ref(),
            )?,
            guidance_scale: required_float(
                "guidance_scale",
                self.guidance_scale.clone().map(Value::String).as_ref(),
            )?,
            enable_safety_checker: false,
        })
    }

    /// Metadata to embed, with every field exactly as submitted.
    pub fn metadata(&self, seed: Option<u64>, timestamp: String) -> ImageMetadata {
        let text = |value: &Option<String>| value.clone().map(Value::String);
        ImageMetadata {
            model: None,
            prompt: self.prompt.clone().unwrap_or_default(),
            image_size: text(&self.image_size).unwrap_or(Value::Null),
            num_inference_steps: text(&self.num_inference_steps).unwrap_or(Value::Null),
            guidance_scale: text(&self.guidance_scale),
            safety_tolerance: None,
            strength: text(&self.strength),
            seed,
            timestamp,
        }
    }
}

fn required_prompt(prompt: Option<&str>) -> Result<String, GalleryError> {
    match prompt {
        Some(prompt) if !prompt.trim().is_empty() => Ok(prompt.to_string()),
        _ => Err(GalleryError::Validation("prompt is required".to_string())),
    }
}

fn required_image_size(image_size: Option<&Value>) -> Result<Value, GalleryError> {
    match image_size {
        Some(Value::String(size)) if !size.is_empty() => Ok(Value::String(size.clone())),
        Some(Value::Object(dimensions)) => Ok(Value::Object(dimensions.clone())),
        _ => Err(GalleryError::Validation("image_size is required".to_string())),
    }
}

fn required_steps(steps: Option<&Value>) -> Result<u32, GalleryError> {
    steps.and_then(lenient_u32).ok_or_else(|| {
        GalleryError::Validation("num_inference_steps must be an integer".to_string())
    })
}

fn required_float(field: &str, value: Option<&Value>) -> Result<f64, GalleryError> {
    value
        .and_then(lenient_f64)
        .ok_or_else(|| GalleryError::Validation(format!("{field} must be a number")))
}

/// Reads an integer from a JSON number or a numeric string.
///
/// Trailing garbage after the leading digits is ignored, so `"4 steps"` is 4.
fn lenient_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| *n >= 0.0).map(|n| n.trunc() as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => {
            let text = text.trim();
            let digits = text
                .char_indices()
                .find(|(_, c)| !c.is_ascii_digit())
                .map(|(idx, _)| &text[..idx])
                .unwrap_or(text);
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Reads a float from a JSON number or the numeric prefix of a string.
///
/// `"3.5x"` is 3.5, matching how `lenient_u32` treats trailing text.
fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => float_prefix(text.trim())
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite()),
        _ => None,
    }
}

/// The longest leading `[+-]digits[.digits][e[+-]digits]` run of `text`.
fn float_prefix(text: &str) -> &str {
    let bytes = text.as_bytes();
    let digits_from = |mut idx: usize| {
        while idx < bytes.len() && bytes[idx].is_ascii_digit() {
            idx += 1;
        }
        idx
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_end = digits_from(end);
    let mut mantissa_end = int_end;
    if bytes.get(int_end) == Some(&b'.') {
        mantissa_end = digits_from(int_end + 1);
    }
    let has_digits = int_end > end || mantissa_end > int_end + 1;
    if !has_digits {
        return "";
    }
    end = mantissa_end;

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_start = end + 1;
        if matches!(bytes.get(exp_start), Some(b'+' | b'-')) {
            exp_start += 1;
        }
        let exp_end = digits_from(exp_start);
        if exp_end > exp_start {
            end = exp_end;
        }
    }
    &text[..end]
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
