//! 重试策略
//!
//! 固定间隔退避：每次瞬时失败后等待相同时长再重试，直到用尽重试次数。
//! 重试以收件人为粒度独立计数，等待期间不阻塞其他收件人的发送。

use std::time::Duration;

use crate::config::ProcessorConfig;

// ---------------------------------------------------------------------------
// RetryPolicy 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 两次尝试之间的固定等待时间
    pub delay: Duration,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 3 次，每次间隔 5 秒
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::fixed(config.max_retries, config.retry_delay())
    }

    /// 计算第 N 次重试前的等待时间（attempt 从 0 开始）
    ///
    /// 固定退避，与 attempt 无关；保留参数便于日志记录与将来切换策略。
    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// 是否应继续重试
    ///
    /// attempt 表示已经重试过的次数，当 attempt < max_retries 时返回 true。
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 单个操作最多会被执行的次数（首次 + 重试）
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
