//! 诊断快照
//!
//! [`crate::Lock::dump`] 只读取状态，不触发调度、老化或事件；对同一把
//! 静止的锁重复调用得到相同结果。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SchedulingStrategy;
use crate::graph::{GraphSnapshot, LockId, OwnerId};
use crate::lock::stats::LockStats;
use crate::lock::RequestKind;

/// 锁状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub locked: bool,
    pub owner: Option<OwnerId>,
    pub reentrant_count: u32,
    pub reader_count: u32,
    pub writer_active: bool,
    pub writer: Option<OwnerId>,
    pub readers: BTreeMap<OwnerId, u32>,
}

/// 队列项快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntrySnapshot {
    pub seq: u64,
    pub owner: OwnerId,
    pub kind: RequestKind,
    pub priority: u32,
    pub effective_priority: f64,
    /// 入队时刻（相对锁创建时刻）
    pub enqueued_at: Duration,
    pub has_timeout: bool,
}

/// 整把锁的快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub id: LockId,
    pub name: String,
    pub strategy: SchedulingStrategy,
    pub state: StateSnapshot,
    /// 按服务顺序排列
    pub queue: Vec<QueueEntrySnapshot>,
    /// 与本锁相关的等待/持有边
    pub graph: GraphSnapshot,
    pub stats: LockStats,
}

impl LockSnapshot {
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        !self.state.locked && !self.state.writer_active && self.state.reader_count == 0
    }
}
