//! Execution context shared across pipeline runs.
//!
//! [`ExecCtx`] carries the HTTP client, the backend registry, the admission
//! controller and the context-chaining convention. Construct it once and
//! share it (usually behind an `Arc`) across every concurrent run, so that
//! all runs are throttled by the same controller.

use crate::admission::{AdmissionController, AdmissionPolicy, RetryPolicy};
use crate::backend::{BackendRegistry, ChatCompletionBackend, ImageBackend};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::pipeline::ContextChaining;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Shared execution context for pipeline runs.
///
/// # Example
///
/// ```
/// use agent_pipeline::ExecCtx;
/// use std::time::Duration;
///
/// let ctx = ExecCtx::builder()
///     .timeout(Duration::from_secs(120))
///     .build()
///     .unwrap();
/// assert_eq!(ctx.backends.names(), vec!["image", "openai"]);
/// ```
pub struct ExecCtx {
    /// HTTP client (cheap to clone -- uses `Arc` internally).
    pub client: Client,
    /// Backends selectable by discriminator.
    pub backends: BackendRegistry,
    /// Per-key throttle and retry state, shared by every run using this context.
    pub admission: Arc<AdmissionController>,
    /// How prior step output is fed to later steps.
    pub chaining: ContextChaining,
}

impl ExecCtx {
    /// Create a new builder.
    pub fn builder() -> ExecCtxBuilder {
        ExecCtxBuilder::default()
    }

    /// Build a context from loaded configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut chat = ChatCompletionBackend::new();
        if let Some(ref endpoint) = config.text.endpoint {
            chat = chat.with_endpoint(endpoint);
        }

        let mut image = ImageBackend::new()
            .with_sizing(config.image.sizing())
            .with_poll_policy(config.image.poll_policy());
        if let Some(ref endpoint) = config.image.endpoint {
            image = image.with_endpoint(endpoint);
        }

        Self::builder()
            .timeout(Duration::from_millis(config.http.timeout_ms))
            .backends(BackendRegistry::with_defaults(chat, image))
            .admission_policy(config.admission.policy())
            .retry_policy(config.retry.policy())
            .chaining(config.pipeline.chaining)
            .build()
    }
}

impl std::fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCtx")
            .field("backends", &self.backends)
            .field("admission", self.admission.policy())
            .field("retry", self.admission.retry_policy())
            .field("chaining", &self.chaining)
            .finish()
    }
}

/// Builder for [`ExecCtx`].
#[derive(Default)]
pub struct ExecCtxBuilder {
    client: Option<Client>,
    timeout: Option<Duration>,
    backends: Option<BackendRegistry>,
    admission: Option<Arc<AdmissionController>>,
    admission_policy: AdmissionPolicy,
    retry_policy: RetryPolicy,
    chaining: ContextChaining,
}

impl ExecCtxBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the request timeout. Default: 300 seconds.
    ///
    /// Ignored when a custom `Client` is supplied via [`client`](Self::client).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the backend registry. Default: `"openai"` chat completions and
    /// `"image"` async image generation.
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    /// Share an existing controller (and its throttle state) with this context.
    ///
    /// Takes precedence over [`admission_policy`](Self::admission_policy) and
    /// [`retry_policy`](Self::retry_policy).
    pub fn admission(mut self, controller: Arc<AdmissionController>) -> Self {
        self.admission = Some(controller);
        self
    }

    pub fn admission_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.admission_policy = policy;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn chaining(mut self, chaining: ContextChaining) -> Self {
        self.chaining = chaining;
        self
    }

    /// Build the execution context.
    pub fn build(self) -> Result<ExecCtx> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout.unwrap_or(Duration::from_secs(300)))
                .build()?,
        };
        let backends = self.backends.unwrap_or_else(|| {
            BackendRegistry::with_defaults(ChatCompletionBackend::new(), ImageBackend::new())
        });
        let admission = self.admission.unwrap_or_else(|| {
            Arc::new(AdmissionController::new(
                self.admission_policy,
                self.retry_policy,
            ))
        });

        Ok(ExecCtx {
            client,
            backends,
            admission,
            chaining: self.chaining,
        })
    }
}
