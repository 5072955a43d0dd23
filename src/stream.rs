//! Streaming event protocol and transports for pipeline runs.
//!
//! A run is turned into an ordered sequence of [`StreamEvent`]s:
//!
//! ```text
//! progress(1) .. progress(1, delta)* .. step_complete(1)
//! progress(2) .. progress(2, delta)* .. step_complete(2)
//! ...
//! complete | error          (exactly one, always last)
//! ```
//!
//! Events travel over an unbounded channel from the task executing the run to
//! the transport. [`into_sse`] frames them as `data: <json>\n\n`;
//! [`execute_buffered`] collects everything into a single [`PipelineResponse`].
//!
//! The consumer may go away at any time. Emitting into, or closing, a channel
//! whose receiver is gone is a silent no-op; the run itself keeps going until
//! it finishes.

use crate::backend::StreamFragment;
use crate::events::{Event, EventHandler};
use crate::exec_ctx::ExecCtx;
use crate::extract::extract_artifact;
use crate::pipeline::Pipeline;
use crate::sse::encode_data;
use crate::types::StepOutcome;
use crate::PipelineError;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire events delivered to streaming consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        /// 1-based step number.
        step: usize,
        total_steps: usize,
        description: String,
        /// Characters of response text received so far for this step.
        char_count: usize,
        /// The fragment that triggered this update, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    StepComplete {
        step: usize,
        outcome: StepOutcome,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
        /// Backend error classification (`auth_missing`, `remote_rejected`, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    Complete {
        steps: Vec<StepOutcome>,
        final_output: String,
        /// The final output after artifact extraction.
        artifact: String,
        /// Whether extraction changed the final output.
        extracted: bool,
    },
}

impl StreamEvent {
    /// `error` and `complete` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Complete { .. })
    }

    pub fn from_error(err: &PipelineError) -> Self {
        StreamEvent::Error {
            message: err.to_string(),
            step: err.step(),
            kind: err.kind().map(|k| k.as_str().to_string()),
        }
    }
}

/// Receiving half handed to the transport.
pub type EventStream = UnboundedReceiver<StreamEvent>;

/// Sending half shared by everything producing events for one run.
///
/// Cloning is cheap; all clones share one channel, so closing through any
/// clone closes it for all.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: Arc<Mutex<Option<UnboundedSender<StreamEvent>>>>,
}

impl EventEmitter {
    /// Create a connected emitter/stream pair.
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Enqueue `event`. Returns whether it was accepted; a closed channel
    /// drops it silently.
    pub fn emit(&self, event: StreamEvent) -> bool {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        if tx.unbounded_send(event).is_err() {
            tracing::debug!("Event consumer disconnected, dropping further events");
            *guard = None;
            return false;
        }
        true
    }

    /// Close the channel. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(tx) = self.tx.lock().take() {
            tx.close_channel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Translates executor [`Event`]s into wire [`StreamEvent`]s.
struct ProgressForwarder {
    emitter: EventEmitter,
    total_steps: usize,
    /// Characters received so far for the current step.
    received: Mutex<usize>,
}

impl ProgressForwarder {
    fn new(emitter: EventEmitter, total_steps: usize) -> Self {
        Self {
            emitter,
            total_steps,
            received: Mutex::new(0),
        }
    }

    fn progress(&self, step: usize, description: String, delta: Option<String>) {
        let char_count = {
            let mut received = self.received.lock();
            if let Some(ref text) = delta {
                *received += text.chars().count();
            }
            *received
        };
        self.emitter.emit(StreamEvent::Progress {
            step,
            total_steps: self.total_steps,
            description,
            char_count,
            delta,
        });
    }
}

impl EventHandler for ProgressForwarder {
    fn on_event(&self, event: Event) {
        match event {
            Event::StepStart {
                step,
                total,
                model,
                backend,
                ..
            } => {
                *self.received.lock() = 0;
                self.progress(
                    step,
                    format!("Step {}/{}: generating with {} ({})", step, total, model, backend),
                    None,
                );
            }
            Event::Fragment {
                step,
                fragment: StreamFragment::Content(text),
            } => {
                self.progress(
                    step,
                    format!("Step {}/{}: receiving", step, self.total_steps),
                    Some(text),
                );
            }
            // Reasoning is delivered with the step outcome, not as progress.
            Event::Fragment { .. } => {}
            Event::TransportRetry {
                step,
                attempt,
                delay,
                reason,
            } => {
                // A retried attempt starts its response over.
                *self.received.lock() = 0;
                self.progress(
                    step,
                    format!(
                        "Step {}/{}: retry {} in {}ms ({})",
                        step,
                        self.total_steps,
                        attempt,
                        delay.as_millis(),
                        reason
                    ),
                    None,
                );
            }
            Event::StepComplete { outcome } => {
                self.emitter.emit(StreamEvent::StepComplete {
                    step: outcome.step_number,
                    outcome,
                });
            }
        }
    }
}

/// Run `pipeline` to completion, forwarding its events and exactly one
/// terminal event to `emitter`, then close it.
pub async fn run_with_emitter(ctx: &ExecCtx, pipeline: &Pipeline, emitter: &EventEmitter) {
    let forwarder = ProgressForwarder::new(emitter.clone(), pipeline.steps.len());
    let terminal = match pipeline.execute_with_events(ctx, &forwarder).await {
        Ok(outcome) => {
            let extraction = extract_artifact(&outcome.final_output);
            StreamEvent::Complete {
                steps: outcome.steps,
                final_output: outcome.final_output,
                artifact: extraction.text,
                extracted: extraction.extracted,
            }
        }
        Err(e) => StreamEvent::from_error(&e),
    };
    emitter.emit(terminal);
    emitter.close();
}

/// Start `pipeline` on a background task and return its event stream.
///
/// Dropping the stream does not cancel the run.
pub fn execute_streaming(ctx: Arc<ExecCtx>, pipeline: Pipeline) -> EventStream {
    let (emitter, stream) = EventEmitter::channel();
    tokio::spawn(async move {
        run_with_emitter(&ctx, &pipeline, &emitter).await;
    });
    stream
}

/// Frame events as server-sent events: `data: <json>\n\n`.
pub fn into_sse(events: EventStream) -> impl Stream<Item = String> + Send {
    events.filter_map(|event| {
        let frame = match encode_data(&event) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode stream event");
                None
            }
        };
        futures::future::ready(frame)
    })
}

/// Single-response result for the buffered transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub success: bool,
    /// Completed steps; on failure, those before the failing step.
    pub steps: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default)]
    pub extracted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
}

/// Collects completed steps without requesting streamed fragments.
#[derive(Default)]
struct OutcomeCollector {
    steps: Mutex<Vec<StepOutcome>>,
}

impl EventHandler for OutcomeCollector {
    fn on_event(&self, event: Event) {
        if let Event::StepComplete { outcome } = event {
            self.steps.lock().push(outcome);
        }
    }

    fn wants_fragments(&self) -> bool {
        false
    }
}

/// Run `pipeline` with buffered backend calls and return one response.
pub async fn execute_buffered(ctx: &ExecCtx, pipeline: &Pipeline) -> PipelineResponse {
    let collector = OutcomeCollector::default();
    match pipeline.execute_with_events(ctx, &collector).await {
        Ok(outcome) => {
            let extraction = extract_artifact(&outcome.final_output);
            PipelineResponse {
                success: true,
                steps: outcome.steps,
                final_output: Some(outcome.final_output),
                artifact: Some(extraction.text),
                extracted: extraction.extracted,
                error: None,
                failed_step: None,
            }
        }
        Err(e) => PipelineResponse {
            success: false,
            steps: collector.steps.into_inner(),
            final_output: None,
            artifact: None,
            extracted: false,
            error: Some(e.to_string()),
            failed_step: e.step(),
        },
    }
}

/// Either transport, chosen by [`Pipeline::stream`].
pub enum PipelineReply {
    Stream(EventStream),
    Buffered(PipelineResponse),
}

/// Serve a run request with the transport it asked for.
pub async fn respond(ctx: Arc<ExecCtx>, pipeline: Pipeline) -> PipelineReply {
    if pipeline.stream {
        PipelineReply::Stream(execute_streaming(ctx, pipeline))
    } else {
        PipelineReply::Buffered(execute_buffered(&ctx, &pipeline).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockReply;
    use crate::backend::{BackendRegistry, MockBackend};
    use std::time::Duration;

    fn ctx(mock: &Arc<MockBackend>) -> Arc<ExecCtx> {
        Arc::new(
            ExecCtx::builder()
                .backends(BackendRegistry::new().register("mock", mock.clone()))
                .build()
                .unwrap(),
        )
    }

    fn two_steps() -> Pipeline {
        Pipeline::builder("m")
            .default_backend("mock")
            .prompt("draft {USER_REQUEST}")
            .prompt("polish")
            .user_request("a page")
            .build()
            .unwrap()
    }

    #[test]
    fn test_emit_after_consumer_gone_is_silent() {
        let (emitter, stream) = EventEmitter::channel();
        assert!(!emitter.is_closed());
        drop(stream);

        let event = StreamEvent::Error {
            message: "late".into(),
            step: None,
            kind: None,
        };
        assert!(!emitter.emit(event.clone()));
        assert!(!emitter.emit(event));
        emitter.close();
        emitter.close();
        assert!(emitter.is_closed());
    }

    #[test]
    fn test_emit_after_close_is_silent() {
        let (emitter, _stream) = EventEmitter::channel();
        let clone = emitter.clone();
        emitter.close();
        assert!(clone.is_closed());
        assert!(!clone.emit(StreamEvent::Error {
            message: "x".into(),
            step: None,
            kind: None
        }));
    }

    #[test]
    fn test_wire_shape() {
        let progress = StreamEvent::Progress {
            step: 1,
            total_steps: 2,
            description: "Step 1/2".into(),
            char_count: 0,
            delta: None,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["total_steps"], 2);
        assert!(json.get("delta").is_none());

        let err = StreamEvent::from_error(&PipelineError::step_failed(
            3,
            PipelineError::UnsupportedBackend("fax".into()),
        ));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["step"], 3);
        assert_eq!(json["kind"], "unsupported_backend");
        assert!(err.is_terminal());
        assert!(!progress.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_run_event_order() {
        let mock = Arc::new(MockBackend::new(vec!["AB".into(), "```html\n<p>x</p>\n```".into()]));
        let events: Vec<StreamEvent> = execute_streaming(ctx(&mock), two_steps()).collect().await;

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                StreamEvent::Progress { delta: None, .. } => "start",
                StreamEvent::Progress { delta: Some(_), .. } => "delta",
                StreamEvent::StepComplete { .. } => "step_complete",
                StreamEvent::Error { .. } => "error",
                StreamEvent::Complete { .. } => "complete",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["start", "delta", "step_complete", "start", "delta", "step_complete", "complete"]
        );

        match &events[1] {
            StreamEvent::Progress {
                step, char_count, ..
            } => {
                assert_eq!(*step, 1);
                assert_eq!(*char_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        match events.last().unwrap() {
            StreamEvent::Complete {
                steps,
                final_output,
                artifact,
                extracted,
            } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(final_output, "```html\n<p>x</p>\n```");
                assert_eq!(artifact, "<p>x</p>");
                assert!(*extracted);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_failure_ends_with_single_error() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Text("A".into()),
            MockReply::Reject {
                status: 502,
                body: "bad gateway".into(),
            },
        ]));
        let events: Vec<StreamEvent> = execute_streaming(ctx(&mock), two_steps()).collect().await;

        let terminal: Vec<&StreamEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(events.last().unwrap().is_terminal());
        match events.last().unwrap() {
            StreamEvent::Error { step, kind, message } => {
                assert_eq!(*step, Some(2));
                assert_eq!(kind.as_deref(), Some("remote_rejected"));
                assert!(message.contains("bad gateway"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let completed = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::StepComplete { .. }))
            .count();
        assert_eq!(completed, 1);

        let retries = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Progress { description, .. } if description.contains("retry")))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_continues_after_consumer_disconnects() {
        let mock = Arc::new(MockBackend::new(vec!["A".into(), "B".into()]));
        let stream = execute_streaming(ctx(&mock), two_steps());
        drop(stream);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sse_framing() {
        let mock = Arc::new(MockBackend::fixed("done"));
        let frames: Vec<String> = into_sse(execute_streaming(ctx(&mock), two_steps()))
            .collect()
            .await;

        assert!(frames.len() >= 3);
        for frame in &frames {
            assert!(frame.starts_with("data: "), "{:?}", frame);
            assert!(frame.ends_with("\n\n"));
        }
        assert!(frames.last().unwrap().contains("\"type\":\"complete\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_success() {
        let mock = Arc::new(MockBackend::new(vec![
            "outline".into(),
            "Here:\n<!DOCTYPE html><html><body>ok</body></html>\nDone.".into(),
        ]));
        let response = execute_buffered(&ctx(&mock), &two_steps()).await;

        assert!(response.success);
        assert_eq!(response.steps.len(), 2);
        assert_eq!(
            response.artifact.as_deref(),
            Some("<!DOCTYPE html><html><body>ok</body></html>")
        );
        assert!(response.extracted);
        assert!(response.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_failure_keeps_completed_steps() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockReply::Text("A".into()),
            MockReply::AuthMissing,
        ]));
        let response = execute_buffered(&ctx(&mock), &two_steps()).await;

        assert!(!response.success);
        assert_eq!(response.steps.len(), 1);
        assert_eq!(response.failed_step, Some(2));
        assert!(response.final_output.is_none());
        assert!(response.error.unwrap().starts_with("Step 2 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_honours_stream_flag() {
        let mock = Arc::new(MockBackend::fixed("x"));
        let mut pipeline = two_steps();

        match respond(ctx(&mock), pipeline.clone()).await {
            PipelineReply::Buffered(response) => assert!(response.success),
            PipelineReply::Stream(_) => panic!("expected buffered reply"),
        }

        pipeline.stream = true;
        match respond(ctx(&mock), pipeline).await {
            PipelineReply::Stream(stream) => {
                let events: Vec<StreamEvent> = stream.collect().await;
                assert!(matches!(events.last(), Some(StreamEvent::Complete { .. })));
            }
            PipelineReply::Buffered(_) => panic!("expected stream"),
        }
    }
}
