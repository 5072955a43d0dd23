//! Asynchronous image-generation backend.
//!
//! Resolves the output size, builds the submission payload, and hands the
//! exchange to a [`JobPoller`]. The size decision happens once per call,
//! before any request is issued.

use super::job::{HttpJobApi, JobApi, JobPoller, PollPolicy};
use super::sizing::{DimensionProbe, HttpProbe, SizingPolicy};
use super::{
    merge_extra, require_credential, Backend, BackendKind, GenerationRequest, GenerationResult,
};
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Base URL used when neither the backend nor the request names one.
pub const DEFAULT_IMAGE_ENDPOINT: &str = "http://localhost:8080";

/// Backend for submit-and-poll image generation services.
#[derive(Clone)]
pub struct ImageBackend {
    endpoint: String,
    sizing: SizingPolicy,
    poll: PollPolicy,
    api: Arc<dyn JobApi>,
    probe: Arc<dyn DimensionProbe>,
}

impl ImageBackend {
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_IMAGE_ENDPOINT.to_string(),
            sizing: SizingPolicy::default(),
            poll: PollPolicy::default(),
            api: Arc::new(HttpJobApi),
            probe: Arc::new(HttpProbe),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_sizing(mut self, sizing: SizingPolicy) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Swap the submit/poll transport (tests, alternative wire formats).
    pub fn with_job_api(mut self, api: Arc<dyn JobApi>) -> Self {
        self.api = api;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DimensionProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    pub fn sizing(&self) -> SizingPolicy {
        self.sizing
    }

    fn build_body(request: &GenerationRequest, (width, height): (u32, u32)) -> Value {
        let mut body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "size": format!("{}x{}", width, height),
            "width": width,
            "height": height,
        });
        if !request.images.is_empty() {
            body["image_urls"] = json!(request.images);
        }
        if let Some(ref format) = request.options.output_format {
            body["output_format"] = json!(format);
        }
        merge_extra(&mut body, request.options.extra.as_ref());
        body
    }
}

impl Default for ImageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ImageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBackend")
            .field("endpoint", &self.endpoint)
            .field("sizing", &self.sizing)
            .field("poll", &self.poll)
            .finish()
    }
}

#[async_trait]
impl Backend for ImageBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Image
    }

    fn name(&self) -> &'static str {
        "image"
    }

    #[tracing::instrument(skip_all, fields(model = %request.model))]
    async fn generate(
        &self,
        client: &Client,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        let key = require_credential(self.name(), request)?;
        let endpoint = request.base_url(&self.endpoint);

        let size = self
            .sizing
            .resolve(request.options.size, &request.images, client, self.probe.as_ref())
            .await;
        tracing::debug!(width = size.0, height = size.1, "Resolved image output size");

        let body = Self::build_body(request, size);
        let (url, payload) = JobPoller::new(self.api.as_ref(), self.poll)
            .run(client, &endpoint, key, &body)
            .await?;

        Ok(GenerationResult::Image { url, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::job::ImageJob;
    use crate::backend::{GenerationOptions, ImageSize};
    use crate::PipelineError;
    use std::sync::Mutex;

    /// Records the submitted body and completes on the first poll.
    #[derive(Default)]
    struct InstantApi {
        submitted: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl JobApi for InstantApi {
        async fn submit(
            &self,
            _client: &Client,
            endpoint: &str,
            _credential: &str,
            body: &Value,
        ) -> Result<String> {
            self.submitted
                .lock()
                .unwrap()
                .push((endpoint.to_string(), body.clone()));
            Ok("job-9".into())
        }

        async fn status(&self, _client: &Client, job: &ImageJob) -> Result<Value> {
            Ok(json!({"status": "completed", "output": [format!("https://cdn/{}.png", job.id)]}))
        }
    }

    struct FixedProbe((u32, u32));

    #[async_trait]
    impl DimensionProbe for FixedProbe {
        async fn dimensions(&self, _: &Client, _: &str) -> Option<(u32, u32)> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn test_generate_submits_and_returns_artifact() {
        let api = Arc::new(InstantApi::default());
        let backend = ImageBackend::new()
            .with_endpoint("https://img.test/v1")
            .with_job_api(api.clone())
            .with_probe(Arc::new(FixedProbe((500, 500))));

        let request = GenerationRequest::new("flux-pro", "a lighthouse at dusk")
            .with_credential("key")
            .with_images(vec!["https://in/src.png".into()])
            .with_options(GenerationOptions {
                size: Some(ImageSize::Original),
                output_format: Some("webp".into()),
                ..Default::default()
            });

        let result = backend.generate(&Client::new(), &request).await.unwrap();
        match result {
            GenerationResult::Image { url, payload } => {
                assert_eq!(url, "https://cdn/job-9.png");
                assert_eq!(payload["status"], "completed");
            }
            other => panic!("expected image result, got {:?}", other),
        }

        let submitted = api.submitted.lock().unwrap();
        let (endpoint, body) = &submitted[0];
        assert_eq!(endpoint, "https://img.test");
        assert_eq!(body["model"], "flux-pro");
        assert_eq!(body["image_urls"][0], "https://in/src.png");
        assert_eq!(body["output_format"], "webp");
        let w = body["width"].as_u64().unwrap();
        let h = body["height"].as_u64().unwrap();
        assert!(w * h >= 921_600);
    }

    #[tokio::test]
    async fn test_no_images_uses_default_size() {
        let api = Arc::new(InstantApi::default());
        let backend = ImageBackend::new().with_job_api(api.clone());
        let request = GenerationRequest::new("flux-pro", "a cat")
            .with_credential("key")
            .with_options(GenerationOptions {
                size: Some(ImageSize::Original),
                ..Default::default()
            });

        backend.generate(&Client::new(), &request).await.unwrap();
        let submitted = api.submitted.lock().unwrap();
        assert_eq!(submitted[0].1["size"], "1024x1024");
        assert!(submitted[0].1.get("image_urls").is_none());
    }

    #[tokio::test]
    async fn test_image_backend_requires_credential() {
        let api = Arc::new(InstantApi::default());
        let backend = ImageBackend::new().with_job_api(api.clone());
        let err = backend
            .generate(&Client::new(), &GenerationRequest::new("flux-pro", "a cat"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AuthMissing { .. }));
        assert!(api.submitted.lock().unwrap().is_empty());
    }
}
