use std::time::Duration;
use thiserror::Error;

/// Coarse classification of backend failures.
///
/// Every [`PipelineError`] raised by an adapter or the image job poller maps
/// onto one of these via [`PipelineError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// No usable credential was supplied.
    AuthMissing,
    /// The request never produced a usable HTTP response.
    TransportError,
    /// The provider answered, but refused or failed the work.
    RemoteRejected,
    /// The backend discriminator did not name a registered backend.
    UnsupportedBackend,
}

impl BackendErrorKind {
    /// Stable snake_case label used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendErrorKind::AuthMissing => "auth_missing",
            BackendErrorKind::TransportError => "transport_error",
            BackendErrorKind::RemoteRejected => "remote_rejected",
            BackendErrorKind::UnsupportedBackend => "unsupported_backend",
        }
    }
}

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The backend requires a credential and none (or an empty one) was given.
    #[error("Backend '{backend}' requires a credential but none was provided")]
    AuthMissing { backend: String },

    /// The backend discriminator is not registered.
    #[error("Unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    RemoteRejected {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// An image job reached the `failed` terminal state.
    #[error("Image job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: String },

    /// An image job did not reach a terminal state within the poll timeout.
    #[error("Image job {job_id} still pending after {waited:?}")]
    PollTimeout { job_id: String, waited: Duration },

    /// A pipeline step failed irrecoverably; the run stops here.
    #[error("Step {step} failed: {cause}")]
    StepFailed {
        /// 1-based step number.
        step: usize,
        cause: Box<PipelineError>,
    },

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration sources could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Map this error onto the backend taxonomy, if it belongs to it.
    ///
    /// `StepFailed` reports the kind of its cause.
    pub fn kind(&self) -> Option<BackendErrorKind> {
        match self {
            PipelineError::AuthMissing { .. } => Some(BackendErrorKind::AuthMissing),
            PipelineError::UnsupportedBackend(_) => Some(BackendErrorKind::UnsupportedBackend),
            PipelineError::Transport(_) => Some(BackendErrorKind::TransportError),
            PipelineError::RemoteRejected { .. }
            | PipelineError::JobFailed { .. }
            | PipelineError::PollTimeout { .. } => Some(BackendErrorKind::RemoteRejected),
            PipelineError::StepFailed { cause, .. } => cause.kind(),
            _ => None,
        }
    }

    /// Whether the admission controller may retry after this error.
    ///
    /// A failed or timed-out image job is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::AuthMissing { .. }
                | PipelineError::UnsupportedBackend(_)
                | PipelineError::JobFailed { .. }
                | PipelineError::PollTimeout { .. }
                | PipelineError::InvalidConfig(_)
                | PipelineError::Config(_)
                | PipelineError::StepFailed { .. }
        )
    }

    /// The failing step number, for `StepFailed`.
    pub fn step(&self) -> Option<usize> {
        match self {
            PipelineError::StepFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub(crate) fn step_failed(step: usize, cause: PipelineError) -> Self {
        PipelineError::StepFailed {
            step,
            cause: Box::new(cause),
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
