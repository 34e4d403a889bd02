use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Per-credential pacing: at most `max_requests_per_min` calls a minute plus a
/// fixed pause after every spacing wait.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    extra_delay: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn per_minute(max_requests_per_min: u32, extra_delay: Duration) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(max_requests_per_min)),
            extra_delay,
            last_call: None,
        }
    }

    fn interval_ms(max_requests_per_min: u32) -> u64 {
        let safe_rpm = max_requests_per_min.max(1);
        (60_000_f64 / safe_rpm as f64).ceil() as u64
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&mut self) {
        if let Some(prev) = self.last_call {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        if !self.extra_delay.is_zero() {
            sleep(self.extra_delay).await;
        }
        self.last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_interval_from_requests_per_minute() {
        assert_eq!(
            RateLimiter::per_minute(60, Duration::ZERO).min_interval(),
            Duration::from_secs(1)
        );
        assert_eq!(
            RateLimiter::per_minute(7, Duration::ZERO).min_interval(),
            Duration::from_millis(8_572)
        );
        assert_eq!(
            RateLimiter::per_minute(0, Duration::ZERO).min_interval(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_calls() {
        let mut limiter = RateLimiter::per_minute(60, Duration::from_millis(150));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        // first call only pays the extra delay, later ones wait out the interval too
        assert!(start.elapsed() >= Duration::from_millis(2_150));
        assert!(start.elapsed() < Duration::from_millis(2_600));
    }
}
