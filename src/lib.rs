//! # Agent Pipeline
//!
//! Multi-step prompt pipelines over pluggable generation backends.
//!
//! A caller submits a natural-language request and an ordered list of prompt
//! steps. Each step is resolved against a text (chat-completion) or image
//! (submit + poll) backend, prior output is chained in as context, and
//! progress is streamed back as it happens.
//!
//! ## Core Concepts
//!
//! - **[`Pipeline`]**: the run request; executes its steps strictly in order.
//! - **[`ExecCtx`]**: shared HTTP client, [`BackendRegistry`], and
//!   [`AdmissionController`]. Build one and share it across runs.
//! - **[`Backend`]**: object-safe trait implemented by
//!   [`ChatCompletionBackend`], [`ImageBackend`], and [`MockBackend`].
//! - **[`AdmissionController`]**: per backend/model spacing, soft concurrency
//!   cap, and retry with exponential backoff.
//! - **[`stream`]**: the `progress` / `step_complete` / `error` / `complete`
//!   event protocol, with SSE and buffered transports.
//! - **[`extract_artifact`]**: recovers an HTML document from the final output.
//!
//! ## Quick Start
//!
//! ```no_run
//! use agent_pipeline::{ExecCtx, GatewayConfig, Pipeline, PipelineStep};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::load(None)?;
//!     agent_pipeline::logging::init_logging(&config.logging)?;
//!     let ctx = Arc::new(ExecCtx::from_config(&config)?);
//!
//!     let pipeline = Pipeline::builder("gpt-4o")
//!         .prompt("Plan a single-page site for: {USER_REQUEST}")
//!         .prompt("Write the complete HTML document for the plan.")
//!         .step(
//!             PipelineStep::new("A hero image for: {USER_REQUEST}")
//!                 .with_backend("image")
//!                 .with_model("flux-pro"),
//!         )
//!         .user_request("a bakery in Lisbon")
//!         .credential(std::env::var("API_KEY")?)
//!         .build()?;
//!
//!     let outcome = pipeline.execute(&ctx).await?;
//!     println!("{}", outcome.final_output);
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```no_run
//! use agent_pipeline::stream::{execute_streaming, into_sse};
//! use agent_pipeline::{ExecCtx, Pipeline};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn demo(ctx: Arc<ExecCtx>, pipeline: Pipeline) {
//! let mut frames = Box::pin(into_sse(execute_streaming(ctx, pipeline)));
//! while let Some(frame) = frames.next().await {
//!     print!("{}", frame); // data: {"type":"progress",...}\n\n
//! }
//! # }
//! ```

pub mod admission;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod extract;
pub mod logging;
pub mod parsing;
pub mod pipeline;
pub mod sse;
pub mod stream;
pub mod types;

pub use admission::{
    AdmissionController, AdmissionPermit, AdmissionPolicy, JitterStrategy, RetryPolicy,
    ThrottleKey,
};
pub use backend::{
    Backend, BackendKind, BackendRegistry, ChatCompletionBackend, GenerationOptions,
    GenerationRequest, GenerationResult, ImageBackend, ImageSize, MockBackend, StreamFragment,
};
pub use config::GatewayConfig;
pub use error::{BackendErrorKind, PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use extract::{extract_artifact, Extraction};
pub use pipeline::{ContextChaining, Pipeline, PipelineBuilder};
pub use stream::{EventEmitter, EventStream, PipelineResponse, StreamEvent};
pub use types::{PipelineOutcome, PipelineStep, StepOutcome};
