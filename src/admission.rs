//! Per-backend admission control with retry and exponential backoff.
//!
//! [`AdmissionController`] keeps, for every [`ThrottleKey`], a count of calls
//! in flight and the time the next dispatch may happen. A call:
//!
//! 1. waits [`AdmissionPolicy::saturation_wait`] if the key is already at its
//!    concurrency cap (a soft cap: the call proceeds afterwards regardless),
//! 2. reserves a dispatch slot at least [`AdmissionPolicy::min_spacing`] after
//!    the previous one and sleeps until it,
//! 3. runs the operation, retrying transient failures per [`RetryPolicy`].
//!
//! Every attempt reserves its own slot, so retries respect spacing too. The
//! in-flight count is released exactly once when the [`AdmissionPermit`] drops.

use crate::backend::BackendKind;
use crate::error::Result;
use crate::PipelineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Identity that concurrency and spacing are tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub kind: BackendKind,
    pub model: String,
}

impl ThrottleKey {
    pub fn new(kind: BackendKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.model)
    }
}

/// Spacing and concurrency limits applied per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Minimum time between two dispatches for one key. Default: 1 second.
    pub min_spacing: Duration,
    /// In-flight calls at which new callers back off. Default: 3.
    pub max_concurrent: usize,
    /// Backoff applied to a caller arriving at a saturated key. Default: 2 seconds.
    pub saturation_wait: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(1),
            max_concurrent: 3,
            saturation_wait: Duration::from_secs(2),
        }
    }
}

/// Jitter strategy applied to backoff delays.
///
/// # Example
///
/// ```
/// use agent_pipeline::admission::JitterStrategy;
///
/// let jitter = JitterStrategy::Full;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter. Delay is exactly the calculated value.
    #[default]
    None,

    /// Full jitter: random value in `[0, calculated_delay]`.
    Full,

    /// Equal jitter: `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

/// Retry configuration for a single admitted call.
///
/// # Example
///
/// ```
/// use agent_pipeline::admission::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
///
/// assert_eq!(RetryPolicy::none().max_attempts, 1);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Default: 3.
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry. Default: 2.0.
    pub multiplier: f64,

    /// Upper bound on any single delay. Default: 60 seconds.
    pub max_delay: Duration,

    /// Default: [`JitterStrategy::None`].
    pub jitter: JitterStrategy,

    /// Wait at least as long as a provider `Retry-After` hint. Default: `true`.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::None,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate the delay before retry N (0-indexed).
    ///
    /// The base delay is `initial_delay * multiplier^retry`, capped at
    /// `max_delay`. Jitter is then applied according to the configured strategy.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }

    /// Delay before retry N after `err`, honouring any `Retry-After` hint.
    pub fn delay_after(&self, err: &PipelineError, retry: u32) -> Duration {
        let computed = self.delay_for_attempt(retry);
        match err {
            PipelineError::RemoteRejected {
                retry_after: Some(hint),
                ..
            } if self.respect_retry_after => computed.max(*hint).min(self.max_delay),
            _ => computed,
        }
    }
}

/// Observer invoked before each retry with the retry number (1-based), the
/// delay about to be slept, and the error that triggered it.
pub type RetryCallback<'a> = &'a (dyn Fn(u32, Duration, &PipelineError) + Send + Sync);

#[derive(Debug, Default)]
struct KeyState {
    active: usize,
    /// Most recently reserved dispatch slot.
    last_dispatch: Option<Instant>,
}

/// Bounds concurrency and dispatch rate per [`ThrottleKey`].
///
/// Owned explicitly and shared by reference (usually inside an
/// [`ExecCtx`](crate::ExecCtx)); key state is created lazily and lives as
/// long as the controller.
#[derive(Debug, Default)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
    retry: RetryPolicy,
    keys: Mutex<HashMap<ThrottleKey, KeyState>>,
}

impl AdmissionController {
    pub fn new(policy: AdmissionPolicy, retry: RetryPolicy) -> Self {
        Self {
            policy,
            retry,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Calls currently holding a permit for `key`.
    pub fn active(&self, key: &ThrottleKey) -> usize {
        self.keys.lock().get(key).map_or(0, |s| s.active)
    }

    /// Admit one call for `key` and wait for its first dispatch slot.
    pub async fn acquire(&self, key: &ThrottleKey) -> AdmissionPermit<'_> {
        let permit = self.admit(key).await;
        self.pace(key).await;
        permit
    }

    /// Soft-cap check and counter increment.
    async fn admit(&self, key: &ThrottleKey) -> AdmissionPermit<'_> {
        let in_flight = self.active(key);
        if in_flight >= self.policy.max_concurrent {
            tracing::debug!(
                %key,
                in_flight,
                wait_ms = self.policy.saturation_wait.as_millis() as u64,
                "Throttle key saturated, backing off"
            );
            tokio::time::sleep(self.policy.saturation_wait).await;
        }

        self.keys.lock().entry(key.clone()).or_default().active += 1;
        AdmissionPermit {
            controller: self,
            key: key.clone(),
        }
    }

    /// Reserve the next dispatch slot for `key` and sleep until it.
    async fn pace(&self, key: &ThrottleKey) {
        let now = Instant::now();
        let slot = {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.clone()).or_default();
            let slot = match state.last_dispatch {
                Some(last) => (last + self.policy.min_spacing).max(now),
                None => now,
            };
            state.last_dispatch = Some(slot);
            slot
        };

        if slot > now {
            tracing::trace!(%key, wait_ms = (slot - now).as_millis() as u64, "Spacing dispatch");
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Run `op` under admission control, retrying transient failures.
    ///
    /// `op` receives the 1-based attempt number. Errors for which
    /// [`PipelineError::is_retryable`] is false are returned immediately;
    /// the final attempt's error is returned unmodified.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn run<T, F, Fut>(
        &self,
        key: &ThrottleKey,
        mut op: F,
        on_retry: Option<RetryCallback<'_>>,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(key).await;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= max_attempts || !err.is_retryable() {
                if attempt > 1 {
                    tracing::warn!(attempt, error = %err, "Giving up after retries");
                }
                return Err(err);
            }

            let delay = self.retry.delay_after(&err, attempt - 1);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            if let Some(cb) = on_retry {
                cb(attempt, delay, &err);
            }

            tokio::time::sleep(delay).await;
            self.pace(key).await;
            attempt += 1;
        }
    }
}

/// One admitted call. Releases its slot in the in-flight count on drop.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    controller: &'a AdmissionController,
    key: ThrottleKey,
}

impl AdmissionPermit<'_> {
    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.controller.keys.lock().get_mut(&self.key) {
            state.active = state.active.saturating_sub(1);
        }
    }
}
