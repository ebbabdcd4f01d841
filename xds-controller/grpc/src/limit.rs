use parking_lot::Mutex;
use tokio::time::{self, Duration, Instant};

/// Limits the rate at which new streams are accepted.
///
/// Permits are issued at a fixed rate with a burst of one. A caller that would have to wait longer
/// than [`MAX_WAIT`] is rejected immediately rather than queued.
#[derive(Debug)]
pub struct RequestLimiter {
    bucket: Option<Mutex<Bucket>>,
}

/// The longest a new stream waits for a permit.
pub const MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("request rate limit exceeded: would wait {0:?}")]
pub struct RateLimitError(Duration);

#[derive(Debug)]
struct Bucket {
    interval: Duration,
    next: Instant,
}

impl RequestLimiter {
    /// Creates a limiter permitting `qps` requests per second. A rate of zero disables limiting.
    pub fn new(qps: f64) -> Self {
        if !qps.is_finite() || qps <= 0.0 {
            return Self::disabled();
        }
        Self {
            bucket: Some(Mutex::new(Bucket {
                interval: Duration::from_secs_f64(1.0 / qps),
                next: Instant::now(),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { bucket: None }
    }

    /// Waits for a permit.
    pub async fn wait(&self) -> Result<(), RateLimitError> {
        let Some(bucket) = self.bucket.as_ref() else {
            return Ok(());
        };

        let at = {
            let mut bucket = bucket.lock();
            let now = Instant::now();
            let at = bucket.next.max(now);
            let wait = at - now;
            if wait > MAX_WAIT {
                return Err(RateLimitError(wait));
            }
            bucket.next = at + bucket.interval;
            at
        };
        time::sleep_until(at).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paces_requests() {
        let limiter = RequestLimiter::new(2.0);
        let start = Instant::now();

        limiter.wait().await.expect("first permit is immediate");
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        limiter.wait().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_long_waits() {
        let limiter = RequestLimiter::new(0.5);
        limiter.wait().await.unwrap();

        // The next permit is two seconds away.
        assert!(limiter.wait().await.is_err());

        time::advance(Duration::from_millis(1500)).await;
        let start = Instant::now();
        limiter.wait().await.expect("permit is within the maximum wait");
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn zero_disables() {
        let limiter = RequestLimiter::new(0.0);
        for _ in 0..100 {
            limiter.wait().await.unwrap();
        }
    }
}
