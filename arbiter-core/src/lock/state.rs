//! 锁状态机
//!
//! 互斥模式：`Unlocked ⇄ ExclusiveLocked(owner, count ≥ 1)`
//! 共享模式：`SharedIdle ⇄ SharedRead(readers ≥ 1)`，`SharedIdle ⇄ SharedWrite`
//!
//! 两种模式在任意时刻互斥。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::OwnerId;

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Read,
    Write,
    Exclusive,
}

impl RequestKind {
    /// 写锁与互斥锁都要求独占
    pub fn is_exclusive_like(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// 释放后的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Vacated {
    /// 重入计数减一，锁仍由同一 owner 持有
    Reentrant { depth: u32 },
    /// 仍有其他读者
    Shared { readers: u32 },
    /// 锁已空闲，需要调度下一个等待者
    Freed,
    /// 记账不一致（例如句柄已被超时竞争清理）
    Inconsistent,
}

#[derive(Debug, Default)]
pub(crate) struct LockState {
    /// 互斥模式是否上锁
    pub locked: bool,
    /// 互斥模式持有者
    pub owner: Option<OwnerId>,
    pub reentrant_count: u32,
    pub reader_count: u32,
    pub writer_active: bool,
    /// 写锁持有者
    pub writer: Option<OwnerId>,
    /// 每个读者持有的读锁数
    pub readers: HashMap<OwnerId, u32>,
}

impl LockState {
    /// 当前状态是否允许授予 `kind`（不考虑队列公平性）
    pub fn is_compatible(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Read => !self.locked && !self.writer_active,
            RequestKind::Write | RequestKind::Exclusive => self.is_idle(),
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.locked && !self.writer_active && self.reader_count == 0
    }

    /// 记录一次授予
    pub fn occupy(&mut self, kind: RequestKind, owner: OwnerId) {
        debug_assert!(self.is_compatible(kind));
        match kind {
            RequestKind::Exclusive => {
                self.locked = true;
                self.owner = Some(owner);
                self.reentrant_count = 1;
            }
            RequestKind::Write => {
                self.writer_active = true;
                self.writer = Some(owner);
            }
            RequestKind::Read => {
                self.reader_count += 1;
                *self.readers.entry(owner).or_insert(0) += 1;
            }
        }
        debug_assert!(self.invariants_hold());
    }

    /// 重入：同一 owner 再次获取互斥锁
    pub fn reenter(&mut self) -> u32 {
        self.reentrant_count += 1;
        self.reentrant_count
    }

    /// 记录一次释放
    pub fn vacate(&mut self, kind: RequestKind, owner: OwnerId) -> Vacated {
        match kind {
            RequestKind::Exclusive => {
                if !self.locked || self.owner != Some(owner) || self.reentrant_count == 0 {
                    return Vacated::Inconsistent;
                }
                self.reentrant_count -= 1;
                if self.reentrant_count > 0 {
                    return Vacated::Reentrant {
                        depth: self.reentrant_count,
                    };
                }
                self.locked = false;
                self.owner = None;
                Vacated::Freed
            }
            RequestKind::Write => {
                if !self.writer_active || self.writer != Some(owner) {
                    return Vacated::Inconsistent;
                }
                self.writer_active = false;
                self.writer = None;
                Vacated::Freed
            }
            RequestKind::Read => {
                let Some(count) = self.readers.get_mut(&owner) else {
                    return Vacated::Inconsistent;
                };
                *count -= 1;
                if *count == 0 {
                    self.readers.remove(&owner);
                }
                self.reader_count = self.reader_count.saturating_sub(1);
                if self.reader_count == 0 {
                    Vacated::Freed
                } else {
                    Vacated::Shared {
                        readers: self.reader_count,
                    }
                }
            }
        }
    }

    /// 把不一致的记账拉回一致状态
    ///
    /// 只修正自相矛盾的字段，不会剥夺一个记录完整的持有者。
    pub fn normalize(&mut self) {
        self.reader_count = self.readers.values().sum();
        if self.locked && (self.owner.is_none() || self.reentrant_count == 0) {
            self.locked = false;
            self.owner = None;
            self.reentrant_count = 0;
        }
        if !self.locked {
            self.owner = None;
            self.reentrant_count = 0;
        }
        if self.writer_active && self.writer.is_none() {
            self.writer_active = false;
        }
        if !self.writer_active {
            self.writer = None;
        }
        if self.writer_active && self.reader_count > 0 {
            // 读写同时存在无法判定谁合法，全部清空让调度重新开始
            self.writer_active = false;
            self.writer = None;
            self.readers.clear();
            self.reader_count = 0;
        }
        debug_assert!(self.invariants_hold());
    }

    pub fn invariants_hold(&self) -> bool {
        let shared_ok = !(self.reader_count > 0 && self.writer_active);
        let modes_ok = !(self.locked && (self.reader_count > 0 || self.writer_active));
        let count_ok = self.reader_count == self.readers.values().sum::<u32>();
        let owner_ok = self.locked == self.owner.is_some();
        shared_ok && modes_ok && count_ok && owner_ok
    }
}
