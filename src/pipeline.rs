use crate::{
    admission::ThrottleKey,
    backend::{GenerationOptions, GenerationRequest, StreamFragment, DEFAULT_TEXT_BACKEND},
    error::Result,
    events::{emit, Event, EventHandler},
    exec_ctx::ExecCtx,
    types::{PipelineOutcome, PipelineStep, StepOutcome},
    PipelineError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How earlier step output is presented to later steps.
///
/// Every later step sees prior output either way; the conventions differ only
/// in layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextChaining {
    /// Append a transcript of every prior step's output:
    /// `{prompt}\n\n<Context>\n[Step 1]\n{output}\n[Step 2]\n{output}\n</Context>`.
    #[default]
    Transcript,
    /// Prepend the previous step's output:
    /// `<Context>\n{previous}\n</Context>\n\n{prompt}`.
    Prefix,
}

impl ContextChaining {
    /// Combine a rendered prompt with the outcomes recorded so far.
    pub fn apply(&self, prompt: &str, prior: &[StepOutcome]) -> String {
        let Some(last) = prior.last() else {
            return prompt.to_string();
        };
        match self {
            ContextChaining::Transcript => {
                let mut out = format!("{}\n\n<Context>\n", prompt);
                for outcome in prior {
                    out.push_str(&format!(
                        "[Step {}]\n{}\n",
                        outcome.step_number, outcome.response
                    ));
                }
                out.push_str("</Context>");
                out
            }
            ContextChaining::Prefix => {
                format!("<Context>\n{}\n</Context>\n\n{}", last.response, prompt)
            }
        }
    }
}

fn default_backend() -> String {
    DEFAULT_TEXT_BACKEND.to_string()
}

/// A pipeline run request: an ordered list of prompt steps plus the
/// defaults and caller inputs they are resolved against.
///
/// Steps run strictly in order; the run stops at the first step that fails
/// after admission-level retries.
#[derive(Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub steps: Vec<PipelineStep>,

    /// Text substituted for `{USER_REQUEST}` in every step.
    #[serde(default)]
    pub user_request: String,

    /// Model used by steps without their own.
    #[serde(default)]
    pub default_model: String,

    /// Backend discriminator used by steps without their own. Default: `"openai"`.
    #[serde(default = "default_backend")]
    pub default_backend: String,

    #[serde(default, skip_serializing)]
    pub credential: Option<String>,

    /// Base URL override applied to every step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Images attached to every step.
    #[serde(default)]
    pub images: Vec<String>,

    #[serde(default)]
    pub options: GenerationOptions,

    /// Whether the caller wants the streaming transport.
    #[serde(default)]
    pub stream: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.len())
            .field("default_model", &self.default_model)
            .field("default_backend", &self.default_backend)
            .field("has_credential", &self.credential.is_some())
            .field("endpoint", &self.endpoint)
            .field("images", &self.images.len())
            .field("stream", &self.stream)
            .finish()
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder(default_model: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(default_model)
    }

    /// Reject requests that cannot run at all.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Pipeline must have at least one step".to_string(),
            ));
        }
        if let Some(pos) = self
            .steps
            .iter()
            .position(|s| s.model.is_none() && self.default_model.trim().is_empty())
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Step {} has no model and the pipeline has no default model",
                pos + 1
            )));
        }
        Ok(())
    }

    /// Execute the pipeline with buffered backend calls.
    pub async fn execute(&self, ctx: &ExecCtx) -> Result<PipelineOutcome> {
        self.run(ctx, None).await
    }

    /// Execute the pipeline, reporting lifecycle events and streamed
    /// fragments to `handler`.
    pub async fn execute_with_events(
        &self,
        ctx: &ExecCtx,
        handler: &dyn EventHandler,
    ) -> Result<PipelineOutcome> {
        self.run(ctx, Some(handler)).await
    }

    #[tracing::instrument(skip_all, fields(steps = self.steps.len(), default_model = %self.default_model))]
    async fn run(
        &self,
        ctx: &ExecCtx,
        handler: Option<&dyn EventHandler>,
    ) -> Result<PipelineOutcome> {
        self.validate()?;

        let total = self.steps.len();
        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(total);

        for (idx, step) in self.steps.iter().enumerate() {
            let number = idx + 1;
            let outcome = self
                .run_step(ctx, handler, number, step, &outcomes)
                .await
                .map_err(|e| {
                    tracing::error!(step = number, error = %e, "Pipeline step failed");
                    PipelineError::step_failed(number, e)
                })?;

            tracing::info!(step = number, total, chars = outcome.char_count, "Step complete");
            emit(
                handler,
                Event::StepComplete {
                    outcome: outcome.clone(),
                },
            );
            outcomes.push(outcome);
        }

        let final_output = outcomes
            .last()
            .map(|o| o.response.clone())
            .unwrap_or_default();

        Ok(PipelineOutcome {
            steps: outcomes,
            final_output,
        })
    }

    /// Resolve, dispatch, and record a single step.
    async fn run_step(
        &self,
        ctx: &ExecCtx,
        handler: Option<&dyn EventHandler>,
        number: usize,
        step: &PipelineStep,
        prior: &[StepOutcome],
    ) -> Result<StepOutcome> {
        let model = step.model.as_deref().unwrap_or(&self.default_model);
        let backend_name = step.backend.as_deref().unwrap_or(&self.default_backend);
        let backend = ctx.backends.resolve(backend_name)?;

        let prompt = ctx.chaining.apply(&step.render(&self.user_request), prior);
        let request = GenerationRequest {
            model: model.to_string(),
            credential: self.credential.clone(),
            endpoint: self.endpoint.clone(),
            prompt,
            images: self.images.clone(),
            options: self.options.clone(),
        };

        tracing::debug!(step = number, model, backend = backend_name, "Dispatching step");
        emit(
            handler,
            Event::StepStart {
                step: number,
                total: self.steps.len(),
                model: model.to_string(),
                backend: backend_name.to_string(),
                kind: backend.kind(),
            },
        );

        let on_fragment = |fragment: StreamFragment| {
            emit(handler, Event::Fragment { step: number, fragment });
        };
        let on_retry = |attempt: u32, delay: Duration, err: &PipelineError| {
            emit(
                handler,
                Event::TransportRetry {
                    step: number,
                    attempt,
                    delay,
                    reason: err.to_string(),
                },
            );
        };

        let key = ThrottleKey::new(backend.kind(), model);
        let result = ctx
            .admission
            .run(
                &key,
                |_attempt| {
                    let backend = &backend;
                    let request = &request;
                    let on_fragment = &on_fragment;
                    async move {
                        if handler.is_some_and(|h| h.wants_fragments()) {
                            backend
                                .generate_streaming(&ctx.client, request, on_fragment)
                                .await
                        } else {
                            backend.generate(&ctx.client, request).await
                        }
                    }
                },
                Some(&on_retry),
            )
            .await?;

        let response = result.response_text();
        Ok(StepOutcome {
            step_number: number,
            prompt_template: step.content.clone(),
            char_count: response.chars().count(),
            reasoning: result.reasoning().map(str::to_string),
            resolved_prompt: request.prompt,
            response,
            model: model.to_string(),
        })
    }
}

/// Builder for creating pipelines.
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            pipeline: Pipeline {
                steps: Vec::new(),
                user_request: String::new(),
                default_model: default_model.into(),
                default_backend: default_backend(),
                credential: None,
                endpoint: None,
                images: Vec::new(),
                options: GenerationOptions::default(),
                stream: false,
            },
        }
    }

    /// Add a step to the pipeline.
    pub fn step(mut self, step: PipelineStep) -> Self {
        self.pipeline.steps.push(step);
        self
    }

    /// Add a step from a bare template.
    pub fn prompt(self, content: impl Into<String>) -> Self {
        self.step(PipelineStep::new(content))
    }

    pub fn user_request(mut self, request: impl Into<String>) -> Self {
        self.pipeline.user_request = request.into();
        self
    }

    pub fn default_backend(mut self, backend: impl Into<String>) -> Self {
        self.pipeline.default_backend = backend.into();
        self
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.pipeline.credential = Some(credential.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.pipeline.endpoint = Some(endpoint.into());
        self
    }

    pub fn images(mut self, images: Vec<String>) -> Self {
        self.pipeline.images = images;
        self
    }

    pub fn options(mut self, options: GenerationOptions) -> Self {
        self.pipeline.options = options;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.pipeline.stream = stream;
        self
    }

    /// Build the pipeline, validating configuration.
    pub fn build(self) -> Result<Pipeline> {
        self.pipeline.validate()?;
        Ok(self.pipeline)
    }
}
