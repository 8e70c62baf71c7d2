//! Delay policies applied while the engine is in the delayed condition.
//!
//! A policy maps "how far past the soft threshold" plus the size of the group
//! about to be written to a single delay. The leader waits that long once per
//! group; a wake from the controller cuts the wait short.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

/// Inputs for one delay decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DelayContext {
    /// Units above the soft threshold, at least 1 when delayed.
    pub excess: u64,
    /// Encoded bytes of the group the leader is about to form.
    pub group_bytes: usize,
}

/// A pluggable delay policy.
pub trait DelayPolicy: Send + Sync {
    fn delay(&self, ctx: &DelayContext) -> Duration;
}

/// Delay grows linearly with the excess, capped at `max`.
#[derive(Clone, Debug)]
pub struct LinearDelay {
    pub step: Duration,
    pub max: Duration,
}

impl Default for LinearDelay {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(1),
            max: Duration::from_millis(100),
        }
    }
}

impl DelayPolicy for LinearDelay {
    fn delay(&self, ctx: &DelayContext) -> Duration {
        let excess = u32::try_from(ctx.excess.max(1)).unwrap_or(u32::MAX);
        self.step.saturating_mul(excess).min(self.max)
    }
}

/// Token bucket over group bytes.
///
/// Writes are paced to `bytes_per_sec / excess`. A group larger than the
/// current credit waits for the deficit to refill; credit never exceeds one
/// second of the base rate.
#[derive(Debug)]
pub struct RateLimitedDelay {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    credit: f64,
    refilled_at: Instant,
}

impl RateLimitedDelay {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            bucket: Mutex::new(Bucket {
                credit: 0.0,
                refilled_at: Instant::now(),
            }),
        }
    }
}

impl DelayPolicy for RateLimitedDelay {
    fn delay(&self, ctx: &DelayContext) -> Duration {
        let rate = self.bytes_per_sec as f64 / ctx.excess.max(1) as f64;
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.credit = (bucket.credit + elapsed * rate).min(self.bytes_per_sec as f64);
        bucket.refilled_at = now;

        bucket.credit -= ctx.group_bytes as f64;
        if bucket.credit >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.credit / rate)
        }
    }
}

/// Never delays. Delayed writes proceed immediately.
#[derive(Clone, Debug, Default)]
pub struct NoDelay;

impl DelayPolicy for NoDelay {
    fn delay(&self, _ctx: &DelayContext) -> Duration {
        Duration::ZERO
    }
}

pub fn default_policy() -> Arc<dyn DelayPolicy> {
    Arc::new(LinearDelay::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_delay_scales_and_caps() {
        let policy = LinearDelay {
            step: Duration::from_millis(2),
            max: Duration::from_millis(5),
        };
        let ctx = |excess| DelayContext {
            excess,
            group_bytes: 0,
        };
        assert_eq!(policy.delay(&ctx(0)), Duration::from_millis(2));
        assert_eq!(policy.delay(&ctx(2)), Duration::from_millis(4));
        assert_eq!(policy.delay(&ctx(10)), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_delay_charges_deficit() {
        let policy = RateLimitedDelay::new(1000);
        let delay = policy.delay(&DelayContext {
            excess: 1,
            group_bytes: 500,
        });
        assert_eq!(delay, Duration::from_millis(500));

        // Doubling the excess halves the rate.
        let delay = policy.delay(&DelayContext {
            excess: 2,
            group_bytes: 0,
        });
        assert_eq!(delay, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        let delay = policy.delay(&DelayContext {
            excess: 1,
            group_bytes: 100,
        });
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn no_delay_is_zero() {
        assert_eq!(
            NoDelay.delay(&DelayContext {
                excess: 7,
                group_bytes: 1 << 20
            }),
            Duration::ZERO
        );
    }
}
