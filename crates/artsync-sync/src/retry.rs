use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use artsync_core::{BatchResult, RecordReference};
use futures::FutureExt;
use tracing::warn;

use crate::batch::BatchProcessor;
use crate::error::BatchError;

/// Whole-batch retry bound. A zero `base_delay` retries immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay after the failed attempt `attempt_index` (0-based), capped.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `processor` over `refs` until one invocation succeeds or `max_attempts` invocations
/// have failed. A panic inside the processor counts as a failed attempt.
pub async fn process_with_retry(
    processor: &dyn BatchProcessor,
    refs: &[RecordReference],
    policy: &RetryPolicy,
    batch_id: usize,
) -> Result<BatchResult, BatchError> {
    let attempts = policy.max_attempts.max(1);
    let mut last = BatchError::Invocation("no attempt made".into());

    for attempt in 0..attempts {
        let outcome = AssertUnwindSafe(processor.process_batch(refs))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(err)) => last = err,
            Err(payload) => last = BatchError::Panicked(panic_message(payload.as_ref())),
        }

        warn!(batch_id, attempt = attempt + 1, max_attempts = attempts, error = %last, "batch attempt failed");
        if attempt + 1 < attempts {
            let delay = policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(BatchError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    })
}
