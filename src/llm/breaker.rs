//! Circuit breaker decorator for an `LlmProvider`.
//!
//! After `failure_threshold` consecutive failures the circuit opens and calls
//! fail fast with `LlmError::CircuitOpen` until `recovery_timeout` elapses.
//! The first call after that is the only trial allowed through: success
//! closes the circuit, failure re-opens it. A call abandoned before it
//! finishes (a caller-side timeout drops the future) counts as a failure.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Wraps a provider and stops calling it while it keeps failing.
pub struct CircuitBreaker {
    inner: Arc<dyn LlmProvider>,
    config: BreakerConfig,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(inner: Arc<dyn LlmProvider>, config: BreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, for health reporting.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is plain counters; a poisoned lock still holds usable data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a call may proceed. Moves Open -> HalfOpen once the
    /// recovery window has passed; while HalfOpen the trial call is in
    /// flight and everything else is turned away.
    fn admit(&self) -> Result<(), LlmError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(LlmError::CircuitOpen {
                provider: self.inner.model_name().to_string(),
                retry_in: Duration::ZERO,
            }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(model = self.inner.model_name(), "Circuit half-open, allowing trial call");
                    Ok(())
                } else {
                    Err(LlmError::CircuitOpen {
                        provider: self.inner.model_name().to_string(),
                        retry_in: self.config.recovery_timeout - elapsed,
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed || inner.consecutive_failures > 0 {
            info!(model = self.inner.model_name(), "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                model = self.inner.model_name(),
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
        }
    }
}

/// Settles one admitted call. Dropped unsettled, it records a failure.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            settled: false,
        }
    }

    fn settle(mut self, ok: bool) {
        self.settled = true;
        if ok {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                model = self.breaker.inner.model_name(),
                "LLM call abandoned before completing"
            );
            self.breaker.record_failure();
        }
    }
}

#[async_trait]
impl LlmProvider for CircuitBreaker {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.admit()?;
        let guard = CallGuard::new(self);
        let result = self.inner.complete(request).await;
        guard.settle(result.is_ok());
        result
    }
}
