use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::config::RateLimitConfig;

/// 时间源，测试中可替换
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 单个客户端的令牌桶
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    rate_per_ms: f64,
}

/// 基于 token bucket 的按客户端限流器
///
/// 容量等于每秒请求数，按经过的时间连续补充。
/// 客户端第一次出现时创建满桶，且这次请求不消耗令牌。
pub struct RateLimiter<C: Clock = SystemClock> {
    requests_per_second: u32,
    enabled: bool,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    clock: C,
}

impl RateLimiter<SystemClock> {
    pub fn new(requests_per_second: u32, enabled: bool) -> Self {
        Self::with_clock(requests_per_second, enabled, SystemClock)
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.enabled)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(requests_per_second: u32, enabled: bool, clock: C) -> Self {
        Self {
            requests_per_second,
            enabled,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// 检查标识（通常是来源 IP）的请求是否放行
    pub fn allow(&self, identifier: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let capacity = f64::from(self.requests_per_second);
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(bucket) = buckets.get_mut(identifier) else {
            buckets.insert(
                identifier.to_string(),
                TokenBucket {
                    tokens: capacity,
                    last_refill: now,
                    rate_per_ms: capacity / 1000.0,
                },
            );
            return true;
        };

        // 按经过的毫秒数补充 token，最多积攒一秒的量
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_ms * bucket.rate_per_ms).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 当前跟踪的客户端数量
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    struct MockClock {
        current: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                current: Arc::new(Mutex::new(Instant::now())),
            }
        }

        fn advance(&self, duration: Duration) {
            *self.current.lock().unwrap() += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current.lock().unwrap()
        }
    }

    #[test]
    fn test_first_call_is_free_then_burst_of_capacity() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(5, true, clock);

        // 首次出现：创建满桶，不扣减
        assert!(limiter.allow("10.0.0.1"));

        // 同一时刻还能连续通过 capacity 次
        for i in 0..5 {
            assert!(limiter.allow("10.0.0.1"), "burst call {} should pass", i);
        }
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[test]
    fn test_continuous_refill() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(10, true, clock.clone());

        assert!(limiter.allow("a"));
        for _ in 0..10 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));

        // 10 rps => 每 100ms 补充一个 token
        clock.advance(Duration::from_millis(50));
        assert!(!limiter.allow("a"));
        clock.advance(Duration::from_millis(60));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(3, true, clock.clone());

        assert!(limiter.allow("a"));
        clock.advance(Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_buckets_are_isolated() {
        let clock = MockClock::new();
        let limiter = RateLimiter::with_clock(1, true, clock);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        assert!(limiter.allow("b"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_disabled_limiter_keeps_no_state() {
        let limiter = RateLimiter::new(1, false);

        for _ in 0..100 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.is_enabled());
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
