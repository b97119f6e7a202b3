use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::HostingError;

/// Substrings that classify a hosting error as worth retrying, per §4.2:
/// rate limit, HTTP 5xx, connection refused, or the launcher failing to
/// exec the CLI. Anything else (notably HTTP 4xx) propagates immediately.
fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["rate limit", "connection refused", "exec"]
        .iter()
        .any(|s| lower.contains(s))
        || lower.contains("http 5")
        || lower.contains("error 5")
        || (lower.contains("5") && lower.contains("server error"))
}

/// Exponential backoff with jitter, up to `max_attempts` total tries.
/// Bounded per-call retry, not a tripping circuit breaker: every call
/// starts fresh, there is no shared open/half-open state across calls.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut f: F) -> Result<T, HostingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HostingError>>,
{
    let mut attempt = 0;
    let mut last_message = String::new();
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_message = e.to_string();
                if attempt >= max_attempts || !is_retryable(&last_message) {
                    return Err(e);
                }
                let backoff_ms = 2u64.pow(attempt - 1) * 200;
                let jitter_ms: u64 = rand::thread_rng().gen_range(0..=backoff_ms / 2);
                let delay = Duration::from_millis(backoff_ms + jitter_ms);
                warn!(attempt, error = %last_message, delay_ms = delay.as_millis() as u64, "retrying hosting call");
                tokio::time::sleep(delay).await;
            }
        }
    }
    #[allow(unreachable_code)]
    Err(HostingError::RetriesExhausted(max_attempts, last_message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, HostingError> = retry_with_backoff(3, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_error_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, HostingError> = retry_with_backoff(3, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HostingError::RetriesExhausted(0, "rate limit exceeded".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, HostingError> = retry_with_backoff(3, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(HostingError::RetriesExhausted(0, "HTTP 404 Not Found".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, HostingError> = retry_with_backoff(3, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(HostingError::RetriesExhausted(0, "connection refused".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
