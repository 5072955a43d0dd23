//! Mock backend for testing without a live provider.
//!
//! [`MockBackend`] replays scripted replies in order and records every
//! request it receives, so downstream consumers can assert on resolved
//! prompts as well as outputs.
//!
//! # Example
//!
//! ```
//! use agent_pipeline::backend::MockBackend;
//!
//! let mock = MockBackend::new(vec!["Hello, world!".to_string()]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;

use super::{
    Backend, BackendKind, FragmentSink, GenerationRequest, GenerationResult, StreamFragment,
};
use crate::error::Result;
use crate::PipelineError;

/// One scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Succeed with this text.
    Text(String),
    /// Succeed with an image artifact at this URL.
    Image(String),
    /// Fail with `RemoteRejected { status, body }`.
    Reject { status: u16, body: String },
    /// Fail with `AuthMissing`.
    AuthMissing,
}

impl From<&str> for MockReply {
    fn from(text: &str) -> Self {
        MockReply::Text(text.to_string())
    }
}

/// A test backend that returns scripted replies in order.
///
/// Once the script is exhausted the last reply repeats. For streaming, text
/// replies are emitted as a single content fragment.
#[derive(Debug)]
pub struct MockBackend {
    kind: BackendKind,
    replies: Vec<MockReply>,
    index: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockBackend {
    /// Create a text mock with the given canned responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(responses.into_iter().map(MockReply::Text).collect())
    }

    /// Create a text mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::scripted(vec![MockReply::Text(response.into())])
    }

    /// Create a mock from an explicit script.
    ///
    /// An empty script behaves like a single empty text reply.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        let kind = if replies.iter().any(|r| matches!(r, MockReply::Image(_))) {
            BackendKind::Image
        } else {
            BackendKind::Text
        };
        Self {
            kind,
            replies,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail `failures` times with HTTP 503, then return `response` forever.
    pub fn flaky(failures: usize, response: impl Into<String>) -> Self {
        let mut replies = vec![
            MockReply::Reject {
                status: 503,
                body: "temporarily unavailable".to_string(),
            };
            failures
        ];
        replies.push(MockReply::Text(response.into()));
        Self::scripted(replies)
    }

    /// Image mock that always completes with `url`.
    pub fn image(url: impl Into<String>) -> Self {
        Self::scripted(vec![MockReply::Image(url.into())])
    }

    /// Override the reported backend kind.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Copies of every request received, in arrival order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Prompts of every request received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.prompt.clone()).collect()
    }

    fn next_reply(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        self.requests.lock().push(request.clone());
        let idx = self.index.fetch_add(1, Ordering::Relaxed);
        let reply = self
            .replies
            .get(idx)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_else(|| MockReply::Text(String::new()));

        match reply {
            MockReply::Text(text) => Ok(GenerationResult::Text {
                text,
                reasoning: None,
            }),
            MockReply::Image(url) => Ok(GenerationResult::Image {
                payload: json!({"status": "completed", "output": [url.clone()]}),
                url,
            }),
            MockReply::Reject { status, body } => Err(PipelineError::RemoteRejected {
                status,
                body,
                retry_after: None,
            }),
            MockReply::AuthMissing => Err(PipelineError::AuthMissing {
                backend: self.name().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(
        &self,
        _client: &Client,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        self.next_reply(request)
    }

    async fn generate_streaming(
        &self,
        _client: &Client,
        request: &GenerationRequest,
        on_fragment: FragmentSink<'_>,
    ) -> Result<GenerationResult> {
        let result = self.next_reply(request)?;
        if let GenerationResult::Text { ref text, .. } = result {
            if !text.is_empty() {
                on_fragment(StreamFragment::Content(text.clone()));
            }
        }
        Ok(result)
    }
}
