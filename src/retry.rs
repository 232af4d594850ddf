//! Exponential backoff with jitter for transient upstream failures.
//!
//! `delay = min(base * exp^attempt, max) * (0.5 + random())`, matching the
//! formula this system's retry semantics were distilled from.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = 0.5 + rand::thread_rng().r#gen::<f64>();
        Duration::from_secs_f64(capped * jitter)
    }

    /// Run `f` up to `max_retries + 1` times, retrying only on
    /// `AppError::is_retryable()` errors with backoff between attempts.
    pub async fn run<T, F, Fut>(&self, mut f: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let result = policy.run(|| async { Ok::<_, AppError>(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable() {
        let policy = RetryPolicy::default();
        let result = policy
            .run(|| async { Err::<i32, _>(AppError::BadRequest("nope".into())) })
            .await;
        assert!(result.is_err());
    }
}
