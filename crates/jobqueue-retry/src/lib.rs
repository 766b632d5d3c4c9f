//! Bounded exponential-backoff retry primitive.
//!
//! This crate wraps an arbitrary async operation with a bounded number of
//! retries, exponential backoff plus additive jitter, and a pluggable
//! retryability predicate. It owns no domain types — callers classify their
//! own errors by implementing [`ClassifiableError`], and the queue core
//! plugs this primitive in at two call sites: retrying a failed handler
//! invocation, and (indirectly) retrying a single failed webhook POST.
//!
//! # Delay formula
//!
//! For retry attempt `n` (0-indexed):
//!
//! ```text
//! delay = min(base_delay_ms * 2^n + uniform_random(0, base_delay_ms), max_delay_ms)
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// Default maximum number of retry attempts after the initial call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
/// Default cap on any single delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5000;

/// Error substrings that indicate a transient network failure.
///
/// Matched case-insensitively against the error's message.
pub const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "etimedout",
    "eai_again",
    "und_err",
    "fetch failed",
    "network",
];

/// Capability an error type must provide so the default classifier can judge
/// whether it is worth retrying.
///
/// Implementers only need to report the handful of signals the classifier
/// cares about; everything else about the error stays opaque to this crate.
pub trait ClassifiableError {
    /// True if this error carries the SSRF-blocked marker (`code == "ssrf_blocked"`
    /// in the source system, or an equivalent structured tag). SSRF-blocked
    /// errors are never retryable: the URL itself is hostile, not transient.
    fn is_ssrf_blocked(&self) -> bool {
        false
    }

    /// True if this error represents an explicit cancellation or timeout.
    /// These are never retried by the default classifier, though the queue's
    /// execution protocol still counts them as an attempt.
    fn is_cancellation_or_timeout(&self) -> bool {
        false
    }

    /// An explicit HTTP-style status code, if this error carries one.
    fn status(&self) -> Option<u16> {
        None
    }

    /// A human-readable message, scanned for network-error substrings.
    fn message(&self) -> Cow<'_, str>;
}

/// The default retryability classifier described in the base specification.
///
/// Order of evaluation:
/// 1. SSRF-blocked or cancellation/timeout → not retryable.
/// 2. Message matches a network error pattern → retryable.
/// 3. Status in `[500, 600)` → retryable.
/// 4. Status in `[400, 500)` → not retryable.
/// 5. Otherwise (unknown error shape) → retryable.
pub fn default_is_retryable<E: ClassifiableError + ?Sized>(err: &E) -> bool {
    if err.is_ssrf_blocked() || err.is_cancellation_or_timeout() {
        return false;
    }

    let message = err.message();
    let lower = message.to_ascii_lowercase();
    if NETWORK_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        return true;
    }

    match err.status() {
        Some(status) if (500..600).contains(&status) => true,
        Some(status) if (400..500).contains(&status) => false,
        _ => true,
    }
}

/// Options controlling a single [`retry`] invocation.
#[derive(Clone)]
pub struct RetryOptions<E> {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for the backoff formula.
    pub base_delay_ms: u64,
    /// Hard cap on any single computed delay.
    pub max_delay_ms: u64,
    /// Predicate deciding whether a given error is worth retrying.
    pub retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> RetryOptions<E> {
    /// Build options using the default classifier for an error type that
    /// implements [`ClassifiableError`].
    pub fn with_default_classifier() -> Self
    where
        E: ClassifiableError + 'static,
    {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            retry_on: Arc::new(default_is_retryable),
        }
    }

    /// Build options with a custom retryability predicate.
    pub fn with_classifier(retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            retry_on,
        }
    }

    /// Override `max_retries`.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override `base_delay_ms`.
    pub fn base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Override `max_delay_ms`.
    pub fn max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// Compute the backoff delay for retry attempt `n` (0-indexed).
///
/// `delay = min(base * 2^n + uniform_random[0, base), max)`.
pub fn compute_delay(n: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exp = base_delay_ms.saturating_mul(1u64 << n.min(63));
    let jitter = if base_delay_ms == 0 {
        0
    } else {
        fastrand::u64(0..base_delay_ms)
    };
    exp.saturating_add(jitter).min(max_delay_ms)
}

/// Run `op`, retrying on failure per `opts` with exponential backoff and jitter.
///
/// Re-throws immediately (no sleep) when the classifier rejects the error.
/// Re-throws the last error once `max_retries` attempts have been exhausted.
pub async fn retry<F, Fut, T, E>(opts: &RetryOptions<E>, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= opts.max_retries || !(opts.retry_on)(&err) {
                    return Err(err);
                }
                let delay = compute_delay(attempt, opts.base_delay_ms, opts.max_delay_ms);
                debug!(attempt, delay_ms = delay, "retrying after failure");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct TestError {
        ssrf_blocked: bool,
        cancellation_or_timeout: bool,
        status: Option<u16>,
        message: String,
    }

    impl TestError {
        fn msg(message: &str) -> Self {
            Self {
                ssrf_blocked: false,
                cancellation_or_timeout: false,
                status: None,
                message: message.to_string(),
            }
        }

        fn status(status: u16) -> Self {
            Self {
                ssrf_blocked: false,
                cancellation_or_timeout: false,
                status: Some(status),
                message: String::new(),
            }
        }
    }

    impl ClassifiableError for TestError {
        fn is_ssrf_blocked(&self) -> bool {
            self.ssrf_blocked
        }

        fn is_cancellation_or_timeout(&self) -> bool {
            self.cancellation_or_timeout
        }

        fn status(&self) -> Option<u16> {
            self.status
        }

        fn message(&self) -> Cow<'_, str> {
            Cow::Borrowed(&self.message)
        }
    }

    #[test]
    fn ssrf_blocked_is_never_retryable() {
        let err = TestError {
            ssrf_blocked: true,
            ..TestError::msg("")
        };
        assert!(!default_is_retryable(&err));
    }

    #[test]
    fn cancellation_is_never_retryable() {
        let err = TestError {
            cancellation_or_timeout: true,
            ..TestError::msg("")
        };
        assert!(!default_is_retryable(&err));
    }

    #[test]
    fn network_patterns_are_retryable_case_insensitively() {
        for pattern in NETWORK_ERROR_PATTERNS {
            let err = TestError::msg(&format!("boom: {}", pattern.to_ascii_uppercase()));
            assert!(default_is_retryable(&err), "pattern {pattern} should retry");
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(default_is_retryable(&TestError::status(500)));
        assert!(default_is_retryable(&TestError::status(599)));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!default_is_retryable(&TestError::status(400)));
        assert!(!default_is_retryable(&TestError::status(499)));
    }

    #[test]
    fn unknown_errors_default_to_retryable() {
        assert!(default_is_retryable(&TestError::msg("something odd")));
    }

    #[test]
    fn four_xx_with_network_pattern_still_retries() {
        let err = TestError {
            status: Some(404),
            ..TestError::msg("fetch failed")
        };
        assert!(default_is_retryable(&err));
    }

    #[test]
    fn compute_delay_respects_bounds() {
        for n in 0..10 {
            let delay = compute_delay(n, 200, 5000);
            let exp = 200u64.saturating_mul(1 << n);
            assert!(
                (exp..exp + 200).contains(&delay) || delay == 5000,
                "n={n} delay={delay} exp={exp}"
            );
        }
    }

    #[test]
    fn compute_delay_caps_at_max() {
        let delay = compute_delay(20, 200, 5000);
        assert_eq!(delay, 5000);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let opts = RetryOptions::<TestError>::with_default_classifier()
            .max_retries(3)
            .base_delay_ms(1)
            .max_delay_ms(5);

        let result = retry(&opts, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError::msg("ECONNRESET"))
                } else {
                    Ok::<_, TestError>("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let opts = RetryOptions::<TestError>::with_default_classifier()
            .max_retries(2)
            .base_delay_ms(1)
            .max_delay_ms(2);

        let result = retry(&opts, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::msg("network blip")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_non_retryable() {
        let attempts = AtomicU32::new(0);
        let opts = RetryOptions::<TestError>::with_default_classifier()
            .max_retries(5)
            .base_delay_ms(1)
            .max_delay_ms(2);

        let result = retry(&opts, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(TestError {
                    ssrf_blocked: true,
                    ..TestError::msg("blocked")
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
