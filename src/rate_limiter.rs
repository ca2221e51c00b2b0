/// 注册限流模块
///
/// 使用 token bucket 算法限制隧道注册速率，超出的注册以
/// RATE_LIMITED 拒绝
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 限流配置
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// 每秒允许的注册数
    pub requests_per_second: u32,
    /// 突发容量
    pub burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            burst_size: 40,
        }
    }
}

/// 限流器包装器
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    /// 创建新的限流器
    pub fn new(config: RateLimiterConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second.max(1)).expect("nonzero rate"),
        )
        .allow_burst(NonZeroU32::new(config.burst_size.max(1)).expect("nonzero burst"));

        let limiter = Arc::new(GovernorLimiter::direct(quota));

        Self {
            inner: limiter,
            config,
        }
    }

    /// 创建默认配置的限流器
    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// 尝试获取一个令牌（非阻塞）
    /// 返回 Ok(()) 如果允许请求，否则返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self) -> Result<(), Duration> {
        match self.inner.check() {
            Ok(_) => Ok(()),
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                Err(wait_time)
            }
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let config = RateLimiterConfig {
            requests_per_second: 10,
            burst_size: 20,
        };
        let limiter = RateLimiter::new(config);
        assert_eq!(limiter.config().requests_per_second, 10);
        assert_eq!(limiter.config().burst_size, 20);
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            requests_per_second: 1,
            burst_size: 5,
        });

        // 突发容量内立即通过
        for _ in 0..5 {
            assert!(limiter.check().is_ok());
        }
        // 超出后被拒绝并给出等待时间
        let wait = limiter.check().unwrap_err();
        assert!(wait > Duration::ZERO);
    }
}
