//! # 锁管理器
//!
//! 同一个管理器创建的锁共享一张等待图和一个定时器，跨锁的死锁因此可以
//! 被检测到；独立创建的 [`Lock`] 只能发现自身范围内的环。
//!
//! 管理器没有全局实例，由调用方显式创建并传递。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{ArbiterConfig, LockOptions};
use crate::error::ConfigError;
use crate::graph::{GraphSnapshot, WaitForGraph};
use crate::lock::Lock;
use crate::snapshot::LockSnapshot;
use crate::timer::{Timer, TokioTimer};

/// 锁管理器
pub struct LockManager {
    defaults: LockOptions,
    graph: Arc<WaitForGraph>,
    timer: Arc<dyn Timer>,
    locks: RwLock<BTreeMap<String, Lock>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(ArbiterConfig::default())
    }
}

impl LockManager {
    pub fn new(config: ArbiterConfig) -> Self {
        Self::with_timer(config, Arc::new(TokioTimer))
    }

    /// 使用自定义定时器（测试中通常是 [`crate::timer::ManualTimer`]）
    pub fn with_timer(config: ArbiterConfig, timer: Arc<dyn Timer>) -> Self {
        Self {
            defaults: config.lock,
            graph: Arc::new(WaitForGraph::new()),
            timer,
            locks: RwLock::new(BTreeMap::new()),
        }
    }

    /// 按默认层级（默认值 → 文件 → 环境变量）加载配置后创建
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(ArbiterConfig::load()?))
    }

    /// 默认锁选项
    pub fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    /// 获取或创建指定名字的锁（使用默认选项）
    pub fn create(&self, name: impl Into<String>) -> Lock {
        self.create_with(name, self.defaults.clone())
    }

    /// 获取或创建指定名字的锁
    ///
    /// 名字已存在时返回已有的锁，`options` 被忽略。
    pub fn create_with(&self, name: impl Into<String>, options: LockOptions) -> Lock {
        let name = name.into();
        if let Some(existing) = self.locks.read().get(&name) {
            return existing.clone();
        }

        let mut locks = self.locks.write();
        let lock = locks
            .entry(name.clone())
            .or_insert_with(|| {
                Lock::build(
                    Some(name.clone()),
                    options,
                    Arc::clone(&self.graph),
                    Arc::clone(&self.timer),
                )
            })
            .clone();
        debug!(name = %name, lock = %lock.id(), "Lock registered");
        lock
    }

    pub fn get(&self, name: &str) -> Option<Lock> {
        self.locks.read().get(name).cloned()
    }

    /// 从管理器中移除；锁在最后一个句柄和守卫释放后销毁
    pub fn remove(&self, name: &str) -> Option<Lock> {
        self.locks.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.locks.read().keys().cloned().collect()
    }

    /// 共享等待图的完整快照
    pub fn graph_snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// 按名字排序的所有锁快照
    pub fn dump_all(&self) -> Vec<LockSnapshot> {
        let locks: Vec<Lock> = self.locks.read().values().cloned().collect();
        locks.iter().map(Lock::dump).collect()
    }

    /// 关闭所有锁，返回被取消的排队请求总数
    pub fn shutdown(&self) -> usize {
        let locks: Vec<Lock> = self.locks.read().values().cloned().collect();
        let cancelled = locks.iter().map(Lock::shutdown).sum();
        info!(locks = locks.len(), cancelled, "Lock manager shut down");
        cancelled
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.names())
            .field("timer", &self.timer)
            .finish()
    }
}
