use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use getset::Getters;
use tokio::{task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use crate::{config::ResilienceConfig, WebVmError, WebVmResult};

use super::{BreakerState, CircuitBreaker, RetryPolicy};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Describes one call routed through an [`ErrorHandler`].
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct OperationContext {
    /// The name of the operation, used in logs and errors.
    #[builder(setter(into))]
    operation: String,

    /// The circuit breaker key. Defaults to the operation name.
    #[builder(default, setter(into, strip_option))]
    key: Option<String>,

    /// Whether failed attempts are retried.
    #[builder(default = false)]
    retry: bool,

    /// Overrides the configured per-attempt timeout.
    #[builder(default, setter(strip_option))]
    timeout: Option<Duration>,
}

/// Retry, circuit breaking, timeouts and admission control around fallible async operations.
///
/// [`execute`](ErrorHandler::execute) applies, in order: the concurrency ceiling, the per-key
/// circuit breaker, the retry loop with a timeout on every attempt, and breaker bookkeeping.
pub struct ErrorHandler {
    config: ResilienceConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct InFlight {
    operation: String,
    started_at: Instant,
    flagged: bool,
}

/// What a maintenance sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// In-flight operations newly flagged as running past their timeout.
    pub flagged: usize,

    /// In-flight entries evicted for exceeding the stale threshold.
    pub evicted: usize,

    /// Idle closed breakers whose counters were zeroed.
    pub breakers_reset: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OperationContext {
    /// Shorthand for a context with no retries.
    pub fn new(operation: impl Into<String>) -> Self {
        Self::builder().operation(operation).build()
    }

    /// Returns the breaker key, falling back to the operation name.
    pub fn breaker_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.operation)
    }
}

impl ErrorHandler {
    /// Creates a handler.
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Runs `operation` under the handler's policies.
    ///
    /// `operation` is invoked once per attempt. Rate limiting and open breakers reject the call
    /// without invoking it. Failures of invoked attempts are wrapped in
    /// [`WebVmError::Operation`].
    pub async fn execute<T, F, Fut>(
        &self,
        context: &OperationContext,
        mut operation: F,
    ) -> WebVmResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WebVmResult<T>>,
    {
        let key = context.breaker_key().to_string();
        let id = self.admit(context)?;
        scopeguard::defer! {
            lock(&self.in_flight).remove(&id);
        }

        let Some(trial) = self.acquire_breaker(&key) else {
            tracing::debug!(operation = %context.operation, key = %key, "rejected by open circuit breaker");
            return Err(WebVmError::CircuitOpen(key));
        };

        // Releases a half-open trial if this call is dropped before its outcome is recorded.
        let trial_key = key.clone();
        let trial = scopeguard::guard(trial, move |trial| {
            if trial {
                tracing::debug!(key = %trial_key, "half-open trial abandoned");
                self.with_breaker(&trial_key, |breaker, _, now| breaker.abandon_trial(now));
            }
        });

        let policy = if context.retry {
            RetryPolicy::from(self.config.get_retry())
        } else {
            RetryPolicy::none()
        };
        let timeout = context
            .timeout
            .unwrap_or(*self.config.get_operation_timeout());

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let error = match tokio::time::timeout(timeout, operation()).await {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(e)) => e,
                Err(_) => WebVmError::Timeout {
                    operation: context.operation.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                },
            };

            if attempt >= policy.max_attempts() || !error.is_retryable() {
                break Err(error);
            }

            let delay = policy.delay(attempt);
            tracing::warn!(
                operation = %context.operation,
                attempt,
                error = %error,
                "retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
        };
        scopeguard::ScopeGuard::into_inner(trial);

        match result {
            Ok(value) => {
                self.with_breaker(&key, |breaker, _, now| breaker.record_success(now));
                Ok(value)
            }
            Err(source) => {
                let opened = self.with_breaker(&key, |breaker, config, now| {
                    breaker.record_failure(config, now)
                });
                if opened {
                    tracing::warn!(key = %key, "circuit breaker opened");
                }

                Err(WebVmError::Operation {
                    operation: context.operation.clone(),
                    key,
                    attempts: attempt,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Returns the number of tracked in-flight operations.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Returns the state of the breaker for `key`, if one exists.
    pub fn breaker_state(&self, key: &str) -> Option<BreakerState> {
        lock(&self.breakers).get(key).map(CircuitBreaker::state)
    }

    /// Returns the failures counted by the breaker for `key`.
    pub fn breaker_failures(&self, key: &str) -> usize {
        lock(&self.breakers)
            .get(key)
            .map(CircuitBreaker::failure_count)
            .unwrap_or(0)
    }

    /// Discards the breaker for `key`.
    pub fn reset_breaker(&self, key: &str) {
        lock(&self.breakers).remove(key);
    }

    /// Flags operations running past their timeout, evicts stale in-flight entries and zeroes the
    /// counters of idle closed breakers.
    ///
    /// Flagged operations are not cancelled.
    pub fn sweep_stale(&self) -> SweepReport {
        let now = Instant::now();
        let timeout = *self.config.get_operation_timeout();
        let stale = *self.config.get_stale_threshold();
        let mut report = SweepReport::default();

        lock(&self.in_flight).retain(|id, entry| {
            let age = now.saturating_duration_since(entry.started_at);
            if age > stale {
                tracing::warn!(id, operation = %entry.operation, "evicting stale operation after {age:?}");
                report.evicted += 1;
                return false;
            }

            if age > timeout && !entry.flagged {
                tracing::warn!(id, operation = %entry.operation, "operation running for {age:?}");
                entry.flagged = true;
                report.flagged += 1;
            }
            true
        });

        let breaker_config = self.config.get_breaker();
        for breaker in lock(&self.breakers).values_mut() {
            if breaker.is_idle(breaker_config, now)
                && (breaker.failure_count() > 0 || breaker.success_count() > 0)
            {
                breaker.reset_counters();
                report.breakers_reset += 1;
            }
        }

        report
    }

    /// Runs [`sweep_stale`](ErrorHandler::sweep_stale) every `maintenance_interval`.
    ///
    /// The task holds a weak reference and exits once the handler is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::downgrade(self);
        let period = *self.config.get_maintenance_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(handler) = handler.upgrade() else {
                    break;
                };

                let report = handler.sweep_stale();
                if report != SweepReport::default() {
                    tracing::debug!(?report, "resilience maintenance sweep");
                }
            }
        })
    }

    fn admit(&self, context: &OperationContext) -> WebVmResult<u64> {
        let limit = *self.config.get_max_concurrent_operations();
        let mut in_flight = lock(&self.in_flight);
        if in_flight.len() >= limit {
            tracing::warn!(operation = %context.operation, "rate limited");
            return Err(WebVmError::RateLimited {
                in_flight: in_flight.len(),
                limit,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(
            id,
            InFlight {
                operation: context.operation.clone(),
                started_at: Instant::now(),
                flagged: false,
            },
        );
        Ok(id)
    }

    /// Returns `None` if the breaker rejects the call, otherwise whether the call is the
    /// half-open trial.
    fn acquire_breaker(&self, key: &str) -> Option<bool> {
        self.with_breaker(key, |breaker, config, now| {
            breaker
                .try_acquire(config, now)
                .then(|| breaker.state() == BreakerState::HalfOpen)
        })
    }

    fn with_breaker<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut CircuitBreaker, &crate::config::BreakerConfig, Instant) -> R,
    ) -> R {
        let now = Instant::now();
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(now));
        f(breaker, self.config.get_breaker(), now)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
