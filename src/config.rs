//! Gateway configuration.
//!
//! Loaded from an optional TOML file and `AGENT_PIPELINE__*` environment
//! variables (environment wins). Every field has a default, so an empty
//! source yields the stock limits:
//!
//! ```toml
//! [admission]
//! min_spacing_ms = 1000
//! max_concurrent = 3
//! saturation_wait_ms = 2000
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! multiplier = 2.0
//! jitter = "none"
//!
//! [image]
//! poll_interval_ms = 100
//! poll_timeout_ms = 600000   # 0 = wait indefinitely
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```
//!
//! Nested keys map to environment variables with `__` separators, e.g.
//! `AGENT_PIPELINE__ADMISSION__MAX_CONCURRENT=5`.

use crate::admission::{AdmissionPolicy, JitterStrategy, RetryPolicy};
use crate::backend::{PollPolicy, SizingPolicy};
use crate::error::Result;
use crate::logging::LoggingConfig;
use crate::pipeline::ContextChaining;
use crate::PipelineError;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "AGENT_PIPELINE";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub text: TextConfig,
    pub image: ImageConfig,
    pub http: HttpConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub min_spacing_ms: u64,
    pub max_concurrent: usize,
    pub saturation_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 1000,
            max_concurrent: 3,
            saturation_wait_ms: 2000,
        }
    }
}

impl AdmissionConfig {
    pub fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            min_spacing: Duration::from_millis(self.min_spacing_ms),
            max_concurrent: self.max_concurrent,
            saturation_wait: Duration::from_millis(self.saturation_wait_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: JitterStrategy,
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: JitterStrategy::None,
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            respect_retry_after: self.respect_retry_after,
        }
    }
}

/// Chat-completion backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    /// Default base URL; requests may override it.
    pub endpoint: Option<String>,
}

/// Image backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub endpoint: Option<String>,
    pub poll_interval_ms: u64,
    /// `0` disables the timeout.
    pub poll_timeout_ms: u64,
    pub min_pixels: u64,
    pub default_width: u32,
    pub default_height: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        let sizing = SizingPolicy::default();
        Self {
            endpoint: None,
            poll_interval_ms: 100,
            poll_timeout_ms: 600_000,
            min_pixels: sizing.min_pixels,
            default_width: sizing.default_width,
            default_height: sizing.default_height,
        }
    }
}

impl ImageConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: (self.poll_timeout_ms > 0).then(|| Duration::from_millis(self.poll_timeout_ms)),
        }
    }

    pub fn sizing(&self) -> SizingPolicy {
        SizingPolicy {
            min_pixels: self.min_pixels,
            default_width: self.default_width,
            default_height: self.default_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request timeout for the shared HTTP client.
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_ms: 300_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chaining: ContextChaining,
}

impl GatewayConfig {
    /// Load from `path` (if given) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(?path, "Loaded gateway configuration");
        Ok(config)
    }

    /// Parse a TOML document (no environment overrides).
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the admission controller or poller misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.admission.max_concurrent == 0 {
            return Err(PipelineError::InvalidConfig(
                "admission.max_concurrent must be at least 1".into(),
            ));
        }
        if self.image.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "image.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    #[test]
    fn test_defaults_match_stock_limits() {
        let config = GatewayConfig::default();
        assert_eq!(config.admission.policy(), AdmissionPolicy::default());
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.image.poll_policy(), PollPolicy::default());
        assert_eq!(config.image.sizing(), SizingPolicy::default());
        assert_eq!(config.pipeline.chaining, ContextChaining::Transcript);
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [admission]
            max_concurrent = 5

            [retry]
            jitter = "full"

            [image]
            endpoint = "https://img.internal"
            poll_timeout_ms = 0

            [pipeline]
            chaining = "prefix"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.admission.max_concurrent, 5);
        assert_eq!(config.admission.min_spacing_ms, 1000);
        assert_eq!(config.retry.jitter, JitterStrategy::Full);
        assert_eq!(config.image.endpoint.as_deref(), Some("https://img.internal"));
        assert_eq!(config.image.poll_policy().timeout, None);
        assert_eq!(config.pipeline.chaining, ContextChaining::Prefix);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GatewayConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));

        let err = GatewayConfig::from_toml_str("[admission]\nmax_concurrent = 0\n").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = GatewayConfig::from_toml_str("[admission\nmax_concurrent = ").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "agent-pipeline-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[retry]\nmax_attempts = 5\ninitial_delay_ms = 250\n").unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(
            config.retry.policy().delay_for_attempt(1),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        let path = std::env::temp_dir().join("agent-pipeline-does-not-exist.toml");
        assert!(matches!(
            GatewayConfig::load(Some(&path)),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = std::env::temp_dir().join(format!(
            "agent-pipeline-env-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[admission]\nmax_concurrent = 5\nmin_spacing_ms = 250\n").unwrap();
        std::env::set_var("AGENT_PIPELINE__ADMISSION__MAX_CONCURRENT", "7");

        let loaded = GatewayConfig::load(Some(&path));
        std::env::remove_var("AGENT_PIPELINE__ADMISSION__MAX_CONCURRENT");
        std::fs::remove_file(&path).ok();

        let config = loaded.unwrap();
        assert_eq!(config.admission.max_concurrent, 7);
        assert_eq!(config.admission.min_spacing_ms, 250);
    }
}
