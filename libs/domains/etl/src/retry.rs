use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule for reaching the database
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    pub fn with_max_delay(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let mut delay = self.initial_delay_ms;
        for _ in 1..attempt {
            delay = ((delay as f64 * self.backoff_multiplier) as u64).min(self.max_delay_ms);
        }
        delay.min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
/// The last error is returned.
pub async fn retry<F, Fut, T, E>(what: &str, policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(what, retries = attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt > policy.max_retries {
                    warn!(what, attempts = attempt, error = %e, "Giving up");
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                let delay = if policy.use_jitter {
                    apply_jitter(delay)
                } else {
                    delay
                };
                debug!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
    }
}

/// Between half and all of `delay`
fn apply_jitter(delay: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;
    (delay as f64 * factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy::new().with_initial_delay(100).with_max_delay(300);
        assert_eq!(policy.delay_for(1), 100);
        assert_eq!(policy.delay_for(2), 200);
        assert_eq!(policy.delay_for(3), 300);
        assert_eq!(policy.delay_for(6), 300);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..20 {
            let d = apply_jitter(1000);
            assert!((500..=1000).contains(&d));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new().without_jitter();
        let result: Result<u32, String> = retry("connect", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("refused".to_string()) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new().with_max_retries(2).without_jitter();
        let result: Result<(), String> = retry("connect", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", n)) }
        })
        .await;
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
