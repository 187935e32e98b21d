use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RetrySection;

use super::context::{AttemptOutcome, WorkflowContext};
use super::error::{FailureClass, WorkflowError, WorkflowResult};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    growth_factor: f64,
    delay_cap: Duration,
    jitter: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl BackoffPolicy {
    pub fn new(config: RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            growth_factor: if config.growth_factor >= 1.0 {
                config.growth_factor
            } else {
                1.0
            },
            delay_cap: Duration::from_millis(config.delay_cap_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retrying after the n-th failed attempt (1-based):
    /// min(cap, base * factor^(n-1)).
    pub fn delay_for_failure(&self, failure: usize) -> Duration {
        let exponent = failure.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.growth_factor.powi(exponent);
        let uncapped = Duration::from_millis(millis.round() as u64);
        uncapped.min(self.delay_cap)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }

    /// Runs one unit of work (a navigation step, or a full per-year download
    /// sequence) with bounded retries. Every attempt, success or failure,
    /// appends one record to the context's log and the tracing sink.
    ///
    /// Transient failures back off and retry up to `max_attempts`; permanent
    /// and fatal failures abort immediately.
    pub async fn run<F, Fut, T>(
        &self,
        ctx: &mut WorkflowContext,
        step: &str,
        mut operation: F,
    ) -> WorkflowResult<RetryOutcome<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(result) => {
                    ctx.record_attempt(step, AttemptOutcome::Ok);
                    info!(
                        identifier = %ctx.identifier(),
                        year = ctx.current_year(),
                        step,
                        attempt,
                        "step succeeded"
                    );
                    return Ok(RetryOutcome { result, attempts: attempt });
                }
                Err(error) => {
                    ctx.record_attempt(
                        step,
                        AttemptOutcome::Failed {
                            detail: error.to_string(),
                        },
                    );
                    warn!(
                        identifier = %ctx.identifier(),
                        year = ctx.current_year(),
                        step,
                        attempt,
                        class = ?error.class(),
                        error = %error,
                        "step attempt failed"
                    );
                    match error.class() {
                        FailureClass::Permanent | FailureClass::Fatal => return Err(error),
                        FailureClass::Transient => {}
                    }
                    if attempt >= self.max_attempts {
                        return Err(WorkflowError::RetriesExhausted {
                            step: step.to_string(),
                            attempts: attempt,
                        });
                    }
                    let delay = self.jittered(self.delay_for_failure(attempt));
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}
