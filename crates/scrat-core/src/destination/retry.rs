use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;

/// Retry a destination operation on transient errors with exponential
/// backoff plus jitter. Non-transient errors propagate unretried.
pub fn with_retry<T>(
    retry: &RetryConfig,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = retry.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            let base = delay_ms.max(1);
            let jitter = rand::random::<u64>() % base;
            std::thread::sleep(Duration::from_millis(base + jitter));
            delay_ms = base.saturating_mul(2).min(retry.retry_max_delay_ms.max(1));
        }

        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    retry.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.expect("retry loop exited without error"))
}
