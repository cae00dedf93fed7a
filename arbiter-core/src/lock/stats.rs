//! 锁统计
//!
//! 所有计数都在锁的临界区内更新，无需原子操作；[`crate::Lock::stats`]
//! 返回一份拷贝。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 竞争级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionLevel {
    /// 无竞争：健康状态
    Healthy,
    /// 低竞争：需要关注
    Low,
    /// 中等竞争：需要优化
    Medium,
    /// 高竞争：需要立即处理
    High,
}

impl ContentionLevel {
    /// 从等待时间判断竞争级别
    pub fn from_wait_time(wait_time: Duration) -> Self {
        if wait_time < Duration::from_millis(10) {
            Self::Healthy
        } else if wait_time < Duration::from_millis(50) {
            Self::Low
        } else if wait_time < Duration::from_millis(100) {
            Self::Medium
        } else {
            Self::High
        }
    }
}

impl std::fmt::Display for ContentionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Low => write!(f, "low contention"),
            Self::Medium => write!(f, "medium contention"),
            Self::High => write!(f, "high contention"),
        }
    }
}

/// 锁统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockStats {
    /// 授予总次数（含立即授予，不含重入）
    pub total_acquisitions: u64,
    /// 重入次数
    pub reentrant_acquisitions: u64,
    /// 进入等待队列的次数
    pub queued: u64,
    /// 释放总次数（不含重入释放）
    pub total_releases: u64,
    pub timeout_count: u64,
    pub deadlock_count: u64,
    pub cancelled_count: u64,
    /// `run_exclusive` 回调失败次数
    pub execution_failures: u64,
    /// 释放时发现的记账不一致次数
    pub inconsistencies: u64,
    /// 当前排队数
    pub current_waiters: u32,
    /// 队列曾达到的最大长度
    pub peak_waiters: u32,
    pub total_wait_time: Duration,
    pub max_wait_time: Duration,
    pub total_hold_time: Duration,
    pub max_hold_time: Duration,
    pub last_wait_time: Option<Duration>,
}

impl LockStats {
    pub(crate) fn record_acquisition(&mut self, waited: Duration) {
        self.total_acquisitions += 1;
        self.total_wait_time += waited;
        self.max_wait_time = self.max_wait_time.max(waited);
        self.last_wait_time = Some(waited);
    }

    pub(crate) fn record_reentry(&mut self) {
        self.reentrant_acquisitions += 1;
    }

    pub(crate) fn record_release(&mut self, held: Duration) {
        self.total_releases += 1;
        self.total_hold_time += held;
        self.max_hold_time = self.max_hold_time.max(held);
    }

    /// 同步当前队列长度
    pub(crate) fn set_waiters(&mut self, waiters: usize) {
        let waiters = u32::try_from(waiters).unwrap_or(u32::MAX);
        self.current_waiters = waiters;
        self.peak_waiters = self.peak_waiters.max(waiters);
    }

    /// 获取平均等待时间
    pub fn avg_wait_time(&self) -> Duration {
        if self.total_acquisitions == 0 {
            return Duration::ZERO;
        }
        self.total_wait_time / self.total_acquisitions.min(u32::MAX as u64) as u32
    }

    /// 获取平均持有时间（只统计已释放的持有）
    pub fn avg_hold_time(&self) -> Duration {
        if self.total_releases == 0 {
            return Duration::ZERO;
        }
        self.total_hold_time / self.total_releases.min(u32::MAX as u64) as u32
    }

    /// 获取超时率
    pub fn timeout_rate(&self) -> f64 {
        let attempts = self.total_acquisitions + self.timeout_count;
        if attempts == 0 {
            return 0.0;
        }
        self.timeout_count as f64 / attempts as f64
    }

    /// 按平均等待时间评估竞争程度
    pub fn contention(&self) -> ContentionLevel {
        ContentionLevel::from_wait_time(self.avg_wait_time())
    }
}
