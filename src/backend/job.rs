//! Submit-and-poll protocol for asynchronous image generation.
//!
//! ```text
//! Submitted ──► Polling ──┬──► Completed(url)
//!                 ▲   │   └──► Failed(detail)
//!                 └───┘ pending / processing / anything else
//! ```
//!
//! Non-success HTTP responses at submit or poll time are fatal here; retries
//! belong to the admission controller one layer up.

use super::reject;
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// A submitted job. Discarded once it reaches a terminal state.
#[derive(Clone)]
pub struct ImageJob {
    pub id: String,
    /// Normalized base URL the job was submitted to.
    pub endpoint: String,
    pub credential: String,
}

impl fmt::Debug for ImageJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageJob")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of an image job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Submitted,
    Polling { polls: u32 },
    Completed { url: String },
    Failed { detail: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

/// Status reported by one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Terminal success, with the first artifact URL if one was present.
    Completed { url: Option<String> },
    /// Terminal failure with the provider's detail.
    Failed { detail: String },
    /// Anything else (`pending`, `processing`, `queued`, ...).
    InProgress { status: String },
}

impl JobStatus {
    /// Interpret a provider status payload.
    pub fn from_payload(payload: &Value) -> Self {
        let status = payload["status"]
            .as_str()
            .or_else(|| payload["data"]["status"].as_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match status.as_str() {
            "completed" | "succeeded" | "success" => JobStatus::Completed {
                url: first_artifact_url(payload),
            },
            "failed" | "error" | "cancelled" | "canceled" => JobStatus::Failed {
                detail: error_detail(payload),
            },
            _ => JobStatus::InProgress { status },
        }
    }
}

/// The first output URL, accepting the common payload shapes:
/// `output: ["url"]`, `output: [{"url"}]`, `images: [{"url"}]`, `data: [{"url"}]`.
fn first_artifact_url(payload: &Value) -> Option<String> {
    ["output", "images", "data", "outputs"]
        .iter()
        .filter_map(|key| payload[*key].get(0))
        .find_map(|item| {
            item.as_str()
                .or_else(|| item["url"].as_str())
                .map(str::to_string)
        })
}

fn error_detail(payload: &Value) -> String {
    let err = &payload["error"];
    err.as_str()
        .or_else(|| err["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if err.is_null() {
                "no error detail provided".to_string()
            } else {
                err.to_string()
            }
        })
}

/// Transport for the submit/poll exchange.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a generation payload, returning the provider's job id.
    async fn submit(
        &self,
        client: &Client,
        endpoint: &str,
        credential: &str,
        body: &Value,
    ) -> Result<String>;

    /// Fetch the current status payload for `job`.
    async fn status(&self, client: &Client, job: &ImageJob) -> Result<Value>;
}

/// `POST {base}/v1/images/generations` then `GET {base}/v1/images/generations/{id}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpJobApi;

#[async_trait]
impl JobApi for HttpJobApi {
    async fn submit(
        &self,
        client: &Client,
        endpoint: &str,
        credential: &str,
        body: &Value,
    ) -> Result<String> {
        let url = format!("{}/v1/images/generations", endpoint);
        let resp = client
            .post(&url)
            .bearer_auth(credential)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(reject(resp).await);
        }

        let payload: Value = resp.json().await?;
        ["id", "task_id", "job_id"]
            .iter()
            .find_map(|k| payload[*k].as_str().or_else(|| payload["data"][*k].as_str()))
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::Other(format!("Image submission returned no job id: {}", payload))
            })
    }

    async fn status(&self, client: &Client, job: &ImageJob) -> Result<Value> {
        let url = format!("{}/v1/images/generations/{}", job.endpoint, job.id);
        let resp = client
            .get(&url)
            .bearer_auth(&job.credential)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(reject(resp).await);
        }
        Ok(resp.json().await?)
    }
}

/// How often and how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between status requests. Default: 100 ms.
    pub interval: Duration,
    /// Give up after this long. `None` waits indefinitely. Default: 10 minutes.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Drives one job from submission to a terminal state.
pub struct JobPoller<'a> {
    api: &'a dyn JobApi,
    policy: PollPolicy,
}

impl<'a> JobPoller<'a> {
    pub fn new(api: &'a dyn JobApi, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    /// Submit `body` and poll until the job completes or fails.
    ///
    /// Returns the artifact URL and the raw terminal payload.
    #[tracing::instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn run(
        &self,
        client: &Client,
        endpoint: &str,
        credential: &str,
        body: &Value,
    ) -> Result<(String, Value)> {
        let id = self.api.submit(client, endpoint, credential, body).await?;
        let job = ImageJob {
            id,
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
        };
        tracing::info!(job_id = %job.id, "Image job submitted");
        self.poll(client, &job).await
    }

    /// Poll an already-submitted job.
    pub async fn poll(&self, client: &Client, job: &ImageJob) -> Result<(String, Value)> {
        let started = Instant::now();
        let mut state = JobState::Submitted;

        loop {
            let payload = self.api.status(client, job).await?;
            match JobStatus::from_payload(&payload) {
                JobStatus::Completed { url: Some(url) } => {
                    state = JobState::Completed { url: url.clone() };
                    tracing::info!(job_id = %job.id, ?state, "Image job completed");
                    return Ok((url, payload));
                }
                JobStatus::Completed { url: None } => {
                    return Err(PipelineError::JobFailed {
                        job_id: job.id.clone(),
                        detail: "job completed without an output URL".to_string(),
                    });
                }
                JobStatus::Failed { detail } => {
                    state = JobState::Failed {
                        detail: detail.clone(),
                    };
                    tracing::warn!(job_id = %job.id, ?state, "Image job failed");
                    return Err(PipelineError::JobFailed {
                        job_id: job.id.clone(),
                        detail,
                    });
                }
                JobStatus::InProgress { status } => {
                    let polls = match state {
                        JobState::Polling { polls } => polls + 1,
                        _ => 1,
                    };
                    state = JobState::Polling { polls };
                    tracing::trace!(job_id = %job.id, %status, polls, "Image job still running");
                }
            }

            if let Some(limit) = self.policy.timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(PipelineError::PollTimeout {
                        job_id: job.id.clone(),
                        waited,
                    });
                }
            }
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}
