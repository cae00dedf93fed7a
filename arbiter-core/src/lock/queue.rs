//! # 等待队列
//!
//! 每把锁只有一个等待集合，形态由调度策略决定：
//! - FIFO / 轮转：按到达顺序的双端队列
//! - 优先级 / 加权：二叉堆
//!
//! 超时、取消、授予都从这唯一的集合中移除条目，不存在两份视图不一致的问题。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::config::SchedulingStrategy;
use crate::error::LockError;
use crate::graph::OwnerId;
use crate::lock::{LockGuard, RequestKind};
use crate::timer::TimerHandle;

/// 授予通道：调度器把守卫交给等待者
pub(crate) type GrantSender = oneshot::Sender<Result<LockGuard, LockError>>;
pub(crate) type GrantReceiver = oneshot::Receiver<Result<LockGuard, LockError>>;

/// 队列项
pub(crate) struct Waiter {
    /// 到达序号（在锁内单调递增）
    pub seq: u64,
    pub owner: OwnerId,
    pub kind: RequestKind,
    /// 基础优先级
    pub priority: u32,
    /// 老化后的有效优先级
    pub effective_priority: f64,
    /// 加权策略下的类型权重，其他策略为 1.0
    pub weight: f64,
    pub enqueued_at: Instant,
    pub notify: GrantSender,
    /// 丢弃即取消超时定时器
    pub timeout: Option<TimerHandle>,
}

impl Waiter {
    /// 排序分数
    pub fn score(&self) -> f64 {
        self.effective_priority * self.weight
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("seq", &self.seq)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("effective_priority", &self.effective_priority)
            .finish()
    }
}

/// 分数高者在前；分数相同时先到者在前
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score()
            .total_cmp(&other.score())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

/// 等待集合
pub(crate) enum PendingQueue {
    Ordered(VecDeque<Waiter>),
    Ranked(BinaryHeap<Waiter>),
}

impl PendingQueue {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        if strategy.is_ranked() {
            Self::Ranked(BinaryHeap::new())
        } else {
            Self::Ordered(VecDeque::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ordered(entries) => entries.len(),
            Self::Ranked(heap) => heap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, waiter: Waiter) {
        match self {
            Self::Ordered(entries) => entries.push_back(waiter),
            Self::Ranked(heap) => heap.push(waiter),
        }
    }

    /// 按序号移除
    ///
    /// 堆不支持定点删除，这里重建整个堆（O(n)）。
    pub fn remove(&mut self, seq: u64) -> Option<Waiter> {
        match self {
            Self::Ordered(entries) => {
                let pos = entries.iter().position(|w| w.seq == seq)?;
                entries.remove(pos)
            }
            Self::Ranked(heap) => {
                let mut items = std::mem::take(heap).into_vec();
                let removed = items
                    .iter()
                    .position(|w| w.seq == seq)
                    .map(|pos| items.swap_remove(pos));
                *heap = BinaryHeap::from(items);
                removed
            }
        }
    }

    /// 清空并返回所有条目（服务顺序）
    pub fn drain(&mut self) -> Vec<Waiter> {
        match self {
            Self::Ordered(entries) => entries.drain(..).collect(),
            Self::Ranked(heap) => std::mem::take(heap).into_sorted_vec().into_iter().rev().collect(),
        }
    }

    /// 按服务顺序列出条目
    pub fn in_service_order(&self) -> Vec<&Waiter> {
        match self {
            Self::Ordered(entries) => entries.iter().collect(),
            Self::Ranked(heap) => {
                let mut items: Vec<&Waiter> = heap.iter().collect();
                items.sort_by(|a, b| b.cmp(a));
                items
            }
        }
    }

    /// 修改每个条目后重建排序结构
    pub fn reprioritize(&mut self, mut update: impl FnMut(&mut Waiter)) {
        match self {
            Self::Ordered(entries) => entries.iter_mut().for_each(update),
            Self::Ranked(heap) => {
                let mut items = std::mem::take(heap).into_vec();
                items.iter_mut().for_each(&mut update);
                *heap = BinaryHeap::from(items);
            }
        }
    }

    /// 是否有排在 `(seq, priority)` 之前、优先级不低于它的写请求
    ///
    /// 线性扫描整个队列；队列较浅时可以接受。
    pub fn writer_ahead(&self, seq: u64, effective_priority: f64, weight: f64) -> bool {
        match self {
            Self::Ordered(entries) => entries.iter().any(|w| {
                w.kind.is_exclusive_like() && w.seq < seq && w.effective_priority >= effective_priority
            }),
            Self::Ranked(heap) => {
                let score = effective_priority * weight;
                heap.iter().any(|w| {
                    w.kind.is_exclusive_like()
                        && match w.score().total_cmp(&score) {
                            Ordering::Greater => true,
                            Ordering::Equal => w.seq < seq,
                            Ordering::Less => false,
                        }
                })
            }
        }
    }
}
