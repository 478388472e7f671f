use std::thread;
use tracing::warn;

use crate::backend::{BackendError, BackendResult};
use crate::settings::CallPolicy;

/// Calls `call` until it succeeds, fails fatally, or the retry budget is
/// spent. The delay doubles after every retried failure.
pub fn with_retry<T>(
    policy: &CallPolicy,
    op: &str,
    mut call: impl FnMut() -> BackendResult<T>,
) -> BackendResult<T> {
    let mut attempt: u32 = 0;
    let mut delay = policy.backoff();
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                warn!(op, attempt, retries = policy.retries, error = %err, "backend call failed; retrying");
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}
