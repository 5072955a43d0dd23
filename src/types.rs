use serde::{Deserialize, Serialize};

/// Placeholder replaced with the caller's request text in every step template.
pub const USER_REQUEST_PLACEHOLDER: &str = "{USER_REQUEST}";

/// One prompt in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Prompt template; may contain `{USER_REQUEST}`.
    pub content: String,

    /// Model for this step only. Falls back to the pipeline default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Backend discriminator for this step only. Falls back to the pipeline default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl PipelineStep {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            backend: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// The template with every `{USER_REQUEST}` replaced.
    pub fn render(&self, user_request: &str) -> String {
        self.content.replace(USER_REQUEST_PLACEHOLDER, user_request)
    }
}

/// Record of one completed step. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// 1-based step number.
    pub step_number: usize,

    /// The step template as supplied.
    pub prompt_template: String,

    /// The prompt actually sent, including chained context.
    pub resolved_prompt: String,

    /// Response text (the HTML preview document for image steps).
    pub response: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Characters in `response`.
    pub char_count: usize,

    /// Model that produced the response.
    pub model: String,
}

/// Result of a fully successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// One entry per step, in step order.
    pub steps: Vec<StepOutcome>,

    /// The last step's response text.
    pub final_output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_every_placeholder() {
        let step = PipelineStep::new("{USER_REQUEST} / again: {USER_REQUEST}");
        assert_eq!(step.render("X"), "X / again: X");
        assert_eq!(PipelineStep::new("no placeholder").render("X"), "no placeholder");
    }

    #[test]
    fn test_step_deserializes_with_optional_overrides() {
        let step: PipelineStep = serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(step, PipelineStep::new("hi"));

        let step: PipelineStep =
            serde_json::from_str(r#"{"content": "draw", "model": "flux", "backend": "image"}"#)
                .unwrap();
        assert_eq!(step.model.as_deref(), Some("flux"));
        assert_eq!(step.backend.as_deref(), Some("image"));
    }

    #[test]
    fn test_outcome_omits_missing_reasoning() {
        let outcome = StepOutcome {
            step_number: 1,
            prompt_template: "t".into(),
            resolved_prompt: "t".into(),
            response: "r".into(),
            reasoning: None,
            char_count: 1,
            model: "m".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("reasoning").is_none());
        assert_eq!(json["step_number"], 1);
    }
}
