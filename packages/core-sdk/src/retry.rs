use std::time::Duration;

use crate::error::QueryError;

/**
 * \brief 限流重试策略：仅针对 HTTP 429，指数退避。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /** \brief 最大尝试次数（含首次） */
    pub max_attempts: u32,
    /** \brief 第一次重试前的等待时间 */
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/**
 * \brief 单次查询的状态机。初始为 `Attempting(1)`，终态为 `Success` / `Failed`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting(u32),
    RetryScheduled { attempt: u32, delay: Duration },
    Success,
    Failed,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /**
     * \brief 第 n 次重试（n 从 1 开始）前的等待：`base * 2^(n-1)`。
     */
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /**
     * \brief 第 `attempt` 次尝试失败后决定下一个状态。
     */
    pub fn decide(&self, attempt: u32, error: &QueryError) -> AttemptState {
        if error.is_rate_limited() && attempt < self.max_attempts.max(1) {
            AttemptState::RetryScheduled {
                attempt: attempt + 1,
                delay: self.delay_for_retry(attempt),
            }
        } else {
            AttemptState::Failed
        }
    }
}
