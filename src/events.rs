//! Event system for pipeline lifecycle and streaming hooks.
//!
//! Provides an optional, non-intrusive way to observe pipeline execution.
//! The executor emits events when a step starts, as fragments arrive, when
//! a transport retry is scheduled, and when a step completes. Implement
//! [`EventHandler`] to receive them for logging, progress tracking, or
//! streaming transports (see [`crate::stream`]).

use crate::backend::{BackendKind, StreamFragment};
use crate::types::StepOutcome;
use std::time::Duration;

/// Events emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A step has been resolved and is about to be dispatched.
    StepStart {
        /// 1-based step number.
        step: usize,
        /// Total number of steps in the run.
        total: usize,
        /// Effective model for this step.
        model: String,
        /// Effective backend discriminator for this step.
        backend: String,
        kind: BackendKind,
    },
    /// An incremental fragment was received from a streaming backend.
    Fragment {
        step: usize,
        fragment: StreamFragment,
    },
    /// A transport-level retry is about to happen.
    TransportRetry {
        step: usize,
        /// The retry number (1-indexed).
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
        /// Error description that triggered the retry.
        reason: String,
    },
    /// A step's full response has been assembled.
    StepComplete { outcome: StepOutcome },
}

/// Handler for pipeline lifecycle events.
///
/// This is entirely optional; [`Pipeline::execute`](crate::Pipeline::execute)
/// runs without one.
///
/// # Example
///
/// ```
/// use agent_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StepStart { step, total, .. } => println!("[{}/{}]", step, total),
///             Event::StepComplete { outcome } => println!("{} chars", outcome.char_count),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);

    /// Whether backends should be called in streaming mode so that
    /// [`Event::Fragment`]s are produced. Default: `true`.
    fn wants_fragments(&self) -> bool {
        true
    }
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: Option<&dyn EventHandler>, event: Event) {
    if let Some(h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use agent_pipeline::backend::StreamFragment;
/// use agent_pipeline::events::{Event, FnEventHandler};
///
/// let handler = FnEventHandler(|event: Event| {
///     if let Event::Fragment { fragment: StreamFragment::Content(text), .. } = event {
///         print!("{}", text);
///     }
/// });
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
