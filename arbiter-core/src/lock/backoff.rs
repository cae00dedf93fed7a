//! 退避策略：整次获取失败后的重试间隔。

use std::time::Duration;

use crate::config::BackoffOptions;

impl BackoffOptions {
    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间
    ///
    /// `initial_delay × factor^(attempt-1)`，不超过 `max_delay`。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// 总尝试次数，至少为 1
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
