//! Backend trait and normalized request/result types.
//!
//! The [`Backend`] trait abstracts over generation services, translating a
//! normalized [`GenerationRequest`] into a provider-specific HTTP exchange and
//! back into a [`GenerationResult`]. Backends are looked up by discriminator in
//! a [`BackendRegistry`].
//!
//! ## Architecture
//!
//! ```text
//! Pipeline ──► GenerationRequest ──► BackendRegistry::resolve(name)
//!                                           │
//!                             ┌─────────────┴─────────────┐
//!                   ChatCompletionBackend             ImageBackend
//!                   /v1/chat/completions              size probe ──► JobPoller
//!                   SSE streaming                     submit + poll
//! ```

pub mod chat;
pub mod image;
pub mod job;
pub mod mock;
pub mod sizing;

pub use chat::ChatCompletionBackend;
pub use image::ImageBackend;
pub use job::{HttpJobApi, ImageJob, JobApi, JobPoller, JobState, JobStatus, PollPolicy};
pub use mock::MockBackend;
pub use sizing::{DimensionProbe, HttpProbe, ImageSize, SizingPolicy};

use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Discriminator used when a pipeline does not name a backend.
pub const DEFAULT_TEXT_BACKEND: &str = "openai";
/// Registry name of the async image backend.
pub const DEFAULT_IMAGE_BACKEND: &str = "image";

/// The two families of generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Chat-completion style text generation.
    Text,
    /// Asynchronous image generation (submit + poll).
    Image,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Text => f.write_str("text"),
            BackendKind::Image => f.write_str("image"),
        }
    }
}

/// Per-call tuning knobs. Backends ignore what does not apply to them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Requested output size for image backends.
    pub size: Option<ImageSize>,
    /// Requested output format for image backends (e.g. `"png"`).
    pub output_format: Option<String>,
    /// Provider-specific fields merged verbatim into the request body.
    pub extra: Option<Value>,
}

/// A normalized generation request. Immutable for the duration of a call.
#[derive(Clone)]
pub struct GenerationRequest {
    /// Model identifier (e.g. `"gpt-4o"`).
    pub model: String,
    /// API key, sent as a bearer token.
    pub credential: Option<String>,
    /// Base URL override for this call.
    pub endpoint: Option<String>,
    /// Fully resolved prompt text.
    pub prompt: String,
    /// Attached images, as `http(s)` URLs or `data:` URIs.
    pub images: Vec<String>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            credential: None,
            endpoint: None,
            prompt: prompt.into(),
            images: Vec::new(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve the base URL: the per-call override, else `default`.
    pub fn base_url(&self, default: &str) -> String {
        normalize_base_url(self.endpoint.as_deref().unwrap_or(default))
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("model", &self.model)
            .field("credential", &self.credential.as_deref().map(redact))
            .field("endpoint", &self.endpoint)
            .field("prompt_len", &self.prompt.len())
            .field("images", &self.images.len())
            .field("options", &self.options)
            .finish()
    }
}

fn redact(key: &str) -> String {
    match key.get(..6) {
        Some(prefix) if key.len() > 6 => format!("{}***", prefix),
        _ => "***".to_string(),
    }
}

/// Output of a single backend call, owned by the caller that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationResult {
    Text {
        text: String,
        reasoning: Option<String>,
    },
    Image {
        /// Resolved artifact URL.
        url: String,
        /// Raw terminal status payload from the provider.
        payload: Value,
    },
}

impl GenerationResult {
    pub fn kind(&self) -> BackendKind {
        match self {
            GenerationResult::Text { .. } => BackendKind::Text,
            GenerationResult::Image { .. } => BackendKind::Image,
        }
    }

    /// Text recorded as the step's response.
    ///
    /// Image results render as a small HTML preview document embedding the
    /// artifact, so they flow through artifact extraction like any other page.
    pub fn response_text(&self) -> String {
        match self {
            GenerationResult::Text { text, .. } => text.clone(),
            GenerationResult::Image { url, .. } => preview_html(url),
        }
    }

    pub fn reasoning(&self) -> Option<&str> {
        match self {
            GenerationResult::Text { reasoning, .. } => reasoning.as_deref(),
            GenerationResult::Image { .. } => None,
        }
    }
}

/// Build the preview page for an image artifact.
pub fn preview_html(url: &str) -> String {
    let src = url
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;");
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Generated image</title>\n\
         </head>\n<body style=\"margin:0;display:flex;justify-content:center;background:#111\">\n\
         <img src=\"{}\" alt=\"Generated image\" style=\"max-width:100%;height:auto\">\n</body>\n</html>",
        src
    )
}

/// An incremental piece of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFragment {
    /// Visible response text.
    Content(String),
    /// Reasoning/thinking text, when the provider streams it separately.
    Reasoning(String),
}

/// Callback receiving fragments as they arrive.
pub type FragmentSink<'a> = &'a (dyn Fn(StreamFragment) + Send + Sync);

/// Abstraction over generation services.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which family this backend belongs to (part of the throttle key).
    fn kind(&self) -> BackendKind;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;

    /// Execute a buffered call.
    async fn generate(&self, client: &Client, request: &GenerationRequest)
        -> Result<GenerationResult>;

    /// Execute a call, reporting fragments as they arrive.
    ///
    /// Backends without incremental output fall back to [`Backend::generate`].
    async fn generate_streaming(
        &self,
        client: &Client,
        request: &GenerationRequest,
        on_fragment: FragmentSink<'_>,
    ) -> Result<GenerationResult> {
        let _ = on_fragment;
        self.generate(client, request).await
    }
}

/// Named backends, selected per request by discriminator.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock chat-completion and image backends.
    pub fn with_defaults(chat: ChatCompletionBackend, image: ImageBackend) -> Self {
        Self::new()
            .register(DEFAULT_TEXT_BACKEND, Arc::new(chat))
            .register(DEFAULT_IMAGE_BACKEND, Arc::new(image))
    }

    /// Add or replace a backend (builder style).
    pub fn register(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.insert(name, backend);
        self
    }

    /// Add or replace a backend (mutation style).
    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(name.into(), backend);
    }

    /// Look up a backend by discriminator.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnsupportedBackend(name.to_string()))
    }

    /// Registered discriminators, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Return the credential, or `AuthMissing` if it is absent or blank.
pub(crate) fn require_credential<'a>(
    backend: &str,
    request: &'a GenerationRequest,
) -> Result<&'a str> {
    match request.credential.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(PipelineError::AuthMissing {
            backend: backend.to_string(),
        }),
    }
}

/// Turn a non-success response into `RemoteRejected`, keeping any `Retry-After` hint.
pub(crate) async fn reject(resp: reqwest::Response) -> PipelineError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    PipelineError::RemoteRejected {
        status,
        body,
        retry_after,
    }
}

/// Parse a `Retry-After` header value given in seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Merge the object in `extra` into `body`, overwriting existing keys.
pub(crate) fn merge_extra(body: &mut Value, extra: Option<&Value>) {
    if let (Some(target), Some(Value::Object(fields))) = (body.as_object_mut(), extra) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
}

/// Strip known provider path suffixes from a base URL.
/// This prevents double-pathing when backends append their own paths.
/// e.g., "https://api.openai.com/v1" -> "https://api.openai.com"
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    for suffix in [
        "/v1/chat/completions",
        "/v1/images/generations",
        "/v1/chat",
        "/v1",
    ] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
