//! Client for the fal.ai queue and storage APIs.
//!
//! Submitting a job is synchronous from the caller's side: [`FalClient`]
//! enqueues the request, polls its status until it completes and then
//! fetches the result.

use std::time::Duration;

use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::FalConfig;
use crate::error::GalleryError;
use crate::generation::{FLUX_DEV_IMAGE_TO_IMAGE, ImageToImageInput, ModelInput};

/// One generated image as reported by the service.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResultImage {
    /// Where to download the image
    pub url: String,
    /// Pixel width
    #[serde(default)]
    pub width: Option<u32>,
    /// Pixel height
    #[serde(default)]
    pub height: Option<u32>,
    /// MIME type, eg `image/jpeg`
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Output of a completed generation job.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GenerationResult {
    /// Generated images, in order
    #[serde(default)]
    pub images: Vec<ResultImage>,
    /// Seed used for the generation
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct QueueSubmitResponse {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
enum QueueStatus {
    InQueue {
        #[serde(default)]
        queue_position: Option<u64>,
    },
    InProgress {
        #[serde(default)]
        logs: Option<Vec<QueueLog>>,
    },
    Completed {
        #[serde(default)]
        logs: Option<Vec<QueueLog>>,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct QueueLog {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadInitiateResponse {
    upload_url: String,
    file_url: String,
}

/// Talks to fal.ai on behalf of the HTTP handlers.
#[derive(Clone, Debug)]
pub struct FalClient {
    http: reqwest::Client,
    credentials: String,
    queue_url: Url,
    rest_url: Url,
    poll_interval: Duration,
}

impl FalClient {
    /// Builds a client from configuration.
    pub fn new(http: reqwest::Client, config: &FalConfig) -> Self {
        Self {
            http,
            credentials: config.credentials.clone(),
            queue_url: config.queue_url.clone(),
            rest_url: config.rest_url.clone(),
            poll_interval: config.poll_interval,
        }
    }

    fn authorization(&self) -> String {
        format!("Key {}", self.credentials)
    }

    /// Runs a text-to-image job and waits for the result.
    pub async fn submit(&self, input: &ModelInput) -> Result<GenerationResult, GalleryError> {
        self.subscribe(input.model_id(), &input.payload()?).await
    }

    /// Runs an image-to-image job and waits for the result.
    pub async fn submit_image_to_image(
        &self,
        input: &ImageToImageInput,
    ) -> Result<GenerationResult, GalleryError> {
        self.subscribe(FLUX_DEV_IMAGE_TO_IMAGE, input).await
    }

    /// Enqueues `input` for `model`, polls until done and returns the output.
    #[instrument(skip(self, input))]
    pub async fn subscribe<I: Serialize + ?Sized>(
        &self,
        model: &str,
        input: &I,
    ) -> Result<GenerationResult, GalleryError> {
        let submit_url = join_path(&self.queue_url, model)?;
        let response = self
            .http
            .post(submit_url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(input)
            .send()
            .await
            .map_err(|err| gateway_transport_error("submit", &err))?;
        let submitted: QueueSubmitResponse = read_json(response).await?;
        info!("Queued {} request {}", model, submitted.request_id);

        let (status_url, response_url) = self.request_urls(model, &submitted)?;
        self.wait_for_completion(&status_url).await?;

        let response = self
            .http
            .get(response_url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(|err| gateway_transport_error("result", &err))?;
        let result: GenerationResult = read_json(response).await?;
        info!(
            "Request {} completed with {} image(s)",
            submitted.request_id,
            result.images.len()
        );
        Ok(result)
    }

    /// Status and response URLs, derived when the service omits them.
    fn request_urls(
        &self,
        model: &str,
        submitted: &QueueSubmitResponse,
    ) -> Result<(Url, Url), GalleryError> {
        // Requests live under the app id, the first two path segments.
        let app_id = model.split('/').take(2).collect::<Vec<_>>().join("/");
        let base = format!("{}/requests/{}", app_id, submitted.request_id);

        let response_url = match &submitted.response_url {
            Some(url) => Url::parse(url)?,
            None => join_path(&self.queue_url, &base)?,
        };
        let mut status_url = match &submitted.status_url {
            Some(url) => Url::parse(url)?,
            None => join_path(&self.queue_url, &format!("{base}/status"))?,
        };
        status_url.query_pairs_mut().append_pair("logs", "1");
        Ok((status_url, response_url))
    }

    async fn wait_for_completion(&self, status_url: &Url) -> Result<(), GalleryError> {
        let mut logs_seen = 0;
        loop {
            let response = self
                .http
                .get(status_url.clone())
                .header(reqwest::header::AUTHORIZATION, self.authorization())
                .send()
                .await
                .map_err(|err| gateway_transport_error("status", &err))?;
            match read_json::<QueueStatus>(response).await? {
                QueueStatus::InQueue { queue_position } => {
                    debug!("In queue, position {:?}", queue_position);
                }
                QueueStatus::InProgress { logs } => {
                    logs_seen = emit_logs(logs.as_deref().unwrap_or_default(), logs_seen);
                }
                QueueStatus::Completed { logs, error } => {
                    emit_logs(logs.as_deref().unwrap_or_default(), logs_seen);
                    if let Some(error) = error {
                        return Err(GalleryError::Gateway {
                            status: None,
                            message: error,
                            detail: None,
                        });
                    }
                    return Ok(());
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Uploads `bytes` to fal storage and returns the public file URL.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
    ) -> Result<String, GalleryError> {
        let initiate_url = join_path(&self.rest_url, "storage/upload/initiate")?;
        let response = self
            .http
            .post(initiate_url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&json!({"file_name": file_name, "content_type": content_type}))
            .send()
            .await
            .map_err(|err| GalleryError::Network(format!("Upload initiate failed: {err}")))?;
        let initiated: UploadInitiateResponse = read_json(response).await?;

        let response = self
            .http
            .put(&initiated.upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| GalleryError::Network(format!("Upload failed: {err}")))?;
        if !response.status().is_success() {
            return Err(GalleryError::Network(format!(
                "Upload failed with status {}",
                response.status()
            )));
        }
        debug!("Uploaded {} to {}", file_name, initiated.file_url);
        Ok(initiated.file_url)
    }
}

/// Logs the lines past `seen`, returning the new count.
fn emit_logs(logs: &[QueueLog], seen: usize) -> usize {
    for log in logs.iter().skip(seen) {
        info!("fal: {}", log.message);
    }
    logs.len().max(seen)
}

fn join_path(base: &Url, path: &str) -> Result<Url, GalleryError> {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    Ok(url)
}

fn gateway_transport_error(stage: &str, err: &reqwest::Error) -> GalleryError {
    GalleryError::Gateway {
        status: None,
        message: format!("Request to generation service ({stage}) failed: {err}"),
        detail: None,
    }
}

/// Decodes a successful JSON body, or turns an error status into a
/// [`GalleryError::Gateway`] carrying the upstream `detail`.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, GalleryError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| gateway_transport_error("body", &err))?;
    if !status.is_success() {
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();
        let detail = body.as_ref().and_then(|body| body.get("detail")).cloned();
        let message = match &detail {
            Some(Value::String(detail)) => detail.clone(),
            _ => status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string(),
        };
        return Err(GalleryError::Gateway {
            status: Some(status.as_u16()),
            message,
            detail,
        });
    }
    serde_json::from_slice(&bytes).map_err(|err| GalleryError::Gateway {
        status: Some(status.as_u16()),
        message: format!(
            "Unexpected response from generation service: {err}: {}",
            String::from_utf8_lossy(&bytes)
        ),
        detail: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::generation::{FLUX_SCHNELL, GenerateImageRequest};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn test_client(server: &MockServer) -> FalClient {
        let base = Url::parse(&server.uri()).expect("mock uri");
        FalClient::new(
            reqwest::Client::new(),
            &FalConfig {
                credentials: "test-key".to_string(),
                queue_url: base.clone(),
                rest_url: base,
                poll_interval: Duration::from_millis(1),
            },
        )
    }

    /// Mounts a submit, an immediately completed status and a result.
    pub(crate) async fn mount_completed_job(
        server: &MockServer,
        model: &str,
        expected_input: Value,
        result: Value,
    ) {
        let app_id = model.split('/').take(2).collect::<Vec<_>>().join("/");
        Mock::given(method("POST"))
            .and(path(format!("/{model}")))
            .and(header("authorization", "Key test-key"))
            .and(body_json(expected_input))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "request_id": "req-1",
                "status_url": format!("{}/{app_id}/requests/req-1/status", server.uri()),
                "response_url": format!("{}/{app_id}/requests/req-1", server.uri()),
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{app_id}/requests/req-1/status")))
            .and(query_param("logs", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "COMPLETED"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{app_id}/requests/req-1")))
            .respond_with(ResponseTemplate::new(200).set_body_json(result))
            .mount(server)
            .await;
    }

    fn schnell_input() -> ModelInput {
        let request: GenerateImageRequest = serde_json::from_value(json!({
            "model": FLUX_SCHNELL,
            "prompt": "a red fox",
            "image_size": "512x512",
            "num_inference_steps": "4",
            "image_count": "2"
        }))
        .expect("request");
        ModelInput::try_from(&request).expect("input")
    }

    #[tokio::test]
    async fn submit_waits_for_completion_and_returns_images() {
        let server = MockServer::start().await;
        let input = schnell_input();
        mount_completed_job(
            &server,
            FLUX_SCHNELL,
            input.payload().expect("payload"),
            json!({
                "images": [
                    {"url": "https://cdn.example/a.jpg", "width": 512, "height": 512, "content_type": "image/jpeg"},
                    {"url": "https://cdn.example/b.jpg"}
                ],
                "seed": 99,
                "has_nsfw_concepts": [false, false]
            }),
        )
        .await;

        let result = test_client(&server).submit(&input).await.expect("result");
        assert_eq!(result.seed, Some(99));
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.images[1].url, "https://cdn.example/b.jpg");
        assert_eq!(result.images[0].width, Some(512));
    }

    #[tokio::test]
    async fn polls_through_queue_and_progress_and_derives_urls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/flux/dev"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"request_id": "abc"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/flux/requests/abc/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "IN_QUEUE",
                "queue_position": 3
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/flux/requests/abc/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "IN_PROGRESS",
                "logs": [{"message": "step 1/28"}]
            })))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/flux/requests/abc/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "logs": [{"message": "step 1/28"}, {"message": "done"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/flux/requests/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [{"url": "https://cdn.example/c.jpg"}],
                "seed": 7
            })))
            .mount(&server)
            .await;

        let result = test_client(&server)
            .subscribe("fal-ai/flux/dev", &json!({"prompt": "p"}))
            .await
            .expect("result");
        assert_eq!(result.images[0].url, "https://cdn.example/c.jpg");
    }

    #[tokio::test]
    async fn rejected_jobs_carry_upstream_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/flux/schnell"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "detail": [{"loc": ["body", "image_size"], "msg": "invalid size", "type": "value_error"}]
            })))
            .mount(&server)
            .await;

        let err = test_client(&server)
            .submit(&schnell_input())
            .await
            .expect_err("should fail");
        match err {
            GalleryError::Gateway { status, detail, .. } => {
                assert_eq!(status, Some(422));
                assert_eq!(detail.expect("detail")[0]["msg"], json!("invalid size"));
            }
            other => panic!("expected a gateway error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_with_error_is_a_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/flux-pro"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "x"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fal-ai/flux-pro/requests/x/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "COMPLETED",
                "error": "quota exceeded"
            })))
            .mount(&server)
            .await;

        let err = test_client(&server)
            .subscribe("fal-ai/flux-pro", &json!({}))
            .await
            .expect_err("should fail");
        assert!(matches!(err, GalleryError::Gateway { message, .. } if message == "quota exceeded"));
    }

    #[tokio::test]
    async fn upload_initiates_then_puts_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/upload/initiate"))
            .and(header("authorization", "Key test-key"))
            .and(body_json(json!({"file_name": "cat.png", "content_type": "image/png"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "upload_url": format!("{}/upload/slot-1", server.uri()),
                "file_url": "https://files.example/cat.png"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/slot-1"))
            .and(header("content-type", "image/png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = test_client(&server)
            .upload(b"png bytes".to_vec(), "cat.png", "image/png")
            .await
            .expect("upload");
        assert_eq!(url, "https://files.example/cat.png");
    }

    #[tokio::test]
    async fn failed_upload_is_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/upload/initiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "upload_url": format!("{}/upload/slot-2", server.uri()),
                "file_url": "https://files.example/x"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/slot-2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = test_client(&server)
            .upload(vec![1, 2, 3], "x", "application/octet-stream")
            .await
            .expect_err("should fail");
        assert!(matches!(err, GalleryError::Network(_)));
    }

    #[test]
    fn joins_paths_onto_bases_with_prefixes() {
        let base = Url::parse("https://queue.example/v1/").expect("url");
        assert_eq!(
            join_path(&base, "fal-ai/flux/dev").expect("join").as_str(),
            "https://queue.example/v1/fal-ai/flux/dev"
        );
        let base = Url::parse("https://queue.fal.run").expect("url");
        assert_eq!(
            join_path(&base, "/fal-ai/flux-pro").expect("join").as_str(),
            "https://queue.fal.run/fal-ai/flux-pro"
        );
    }
}
