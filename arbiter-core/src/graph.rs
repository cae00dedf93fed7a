//! # 等待图（Wait-for Graph）
//!
//! 记录 "owner 等待 lock" 与 "owner 持有 lock" 两类关系，用于在请求排队前
//! 同步检测死锁环。
//!
//! 所有边都以整数 ID 存放在中心化的索引表里，不持有任何锁实例的引用。
//! 检测范围仅限共享同一个 `WaitForGraph` 的锁。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 锁的唯一标识符（在所属等待图内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(u64);

impl LockId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// 匿名 owner 的 ID 从高位区间分配，避免与调用方给出的 ID 冲突
const ANONYMOUS_BASE: u64 = 1 << 63;

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(ANONYMOUS_BASE);

/// 调用方提供的不透明 owner 标识
///
/// 只用于重入判断与死锁记账，锁不管理 owner 的生命周期。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(u64);

impl OwnerId {
    /// 使用调用方的 ID 创建 owner
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 分配一个进程内唯一的匿名 owner
    pub fn anonymous() -> Self {
        Self(NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 >= ANONYMOUS_BASE
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_anonymous() {
            write!(f, "anon#{}", self.0 - ANONYMOUS_BASE)
        } else {
            write!(f, "owner#{}", self.0)
        }
    }
}

/// 带计数的双向关系索引
///
/// 同一 owner 可能对同一把锁持有多个读锁，或有多个并发请求在等待，
/// 因此边带有重数，计数归零时才真正删除。
#[derive(Debug)]
struct Relation<A, B> {
    forward: HashMap<A, HashMap<B, usize>>,
    backward: HashMap<B, HashMap<A, usize>>,
}

impl<A, B> Default for Relation<A, B> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }
}

impl<A: Copy + Eq + Hash, B: Copy + Eq + Hash> Relation<A, B> {
    fn insert(&mut self, a: A, b: B) {
        *self.forward.entry(a).or_default().entry(b).or_insert(0) += 1;
        *self.backward.entry(b).or_default().entry(a).or_insert(0) += 1;
    }

    fn remove(&mut self, a: A, b: B) -> bool {
        let removed = Self::decrement(&mut self.forward, a, b);
        if removed {
            Self::decrement(&mut self.backward, b, a);
        }
        removed
    }

    fn decrement<K: Copy + Eq + Hash, V: Copy + Eq + Hash>(
        map: &mut HashMap<K, HashMap<V, usize>>,
        key: K,
        value: V,
    ) -> bool {
        let Some(inner) = map.get_mut(&key) else {
            return false;
        };
        let Some(count) = inner.get_mut(&value) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            inner.remove(&value);
            if inner.is_empty() {
                map.remove(&key);
            }
        }
        true
    }

    fn targets(&self, a: &A) -> impl Iterator<Item = B> + '_ {
        self.forward.get(a).into_iter().flat_map(|m| m.keys().copied())
    }

    fn sources(&self, b: &B) -> impl Iterator<Item = A> + '_ {
        self.backward.get(b).into_iter().flat_map(|m| m.keys().copied())
    }

    fn contains(&self, a: &A, b: &B) -> bool {
        self.forward.get(a).map_or(false, |m| m.contains_key(b))
    }

    fn remove_target(&mut self, b: B) {
        if let Some(sources) = self.backward.remove(&b) {
            for a in sources.keys() {
                if let Some(inner) = self.forward.get_mut(a) {
                    inner.remove(&b);
                    if inner.is_empty() {
                        self.forward.remove(a);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct GraphState {
    /// owner → 正在等待的锁（反向即 lock → 等待者）
    waits: Relation<OwnerId, LockId>,
    /// owner → 持有的锁（反向即 lock → 持有者）
    holds: Relation<OwnerId, LockId>,
}

/// 等待图快照（诊断用，键有序）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// lock → 等待该锁的 owner
    pub waiting: BTreeMap<LockId, Vec<OwnerId>>,
    /// owner → 持有的锁
    pub holding: BTreeMap<OwnerId, Vec<LockId>>,
}

/// 等待图
///
/// 由同一个 [`crate::LockManager`] 创建的锁共享一张图；独立创建的锁各自
/// 拥有私有的图。
#[derive(Debug)]
pub struct WaitForGraph {
    state: Mutex<GraphState>,
    next_lock: AtomicU64,
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GraphState::default()),
            next_lock: AtomicU64::new(1),
        }
    }

    /// 为新锁分配 ID
    pub fn register_lock(&self) -> LockId {
        LockId(self.next_lock.fetch_add(1, Ordering::Relaxed))
    }

    /// 记录等待边并立即检测死锁
    ///
    /// 若新边闭合了一个环，则回滚该边并返回环上的 owner 路径
    /// （以请求者开始、以请求者结束）。
    pub fn try_wait(&self, owner: OwnerId, lock: LockId) -> Result<(), Vec<OwnerId>> {
        let mut state = self.state.lock();
        state.waits.insert(owner, lock);

        if let Some(cycle) = find_cycle(&state, owner, lock) {
            state.waits.remove(owner, lock);
            return Err(cycle);
        }
        Ok(())
    }

    /// 撤销等待边（超时、取消）
    pub fn cancel_wait(&self, owner: OwnerId, lock: LockId) {
        self.state.lock().waits.remove(owner, lock);
    }

    /// 授予：等待边转为持有边
    pub fn grant(&self, owner: OwnerId, lock: LockId) {
        let mut state = self.state.lock();
        state.waits.remove(owner, lock);
        state.holds.insert(owner, lock);
    }

    /// 释放持有边，返回边是否存在
    pub fn release(&self, owner: OwnerId, lock: LockId) -> bool {
        self.state.lock().holds.remove(owner, lock)
    }

    pub fn holds(&self, owner: OwnerId, lock: LockId) -> bool {
        self.state.lock().holds.contains(&owner, &lock)
    }

    pub fn is_waiting(&self, owner: OwnerId, lock: LockId) -> bool {
        self.state.lock().waits.contains(&owner, &lock)
    }

    /// 清除某把锁相关的所有边（锁被销毁时调用）
    pub fn forget_lock(&self, lock: LockId) {
        let mut state = self.state.lock();
        state.waits.remove_target(lock);
        state.holds.remove_target(lock);
    }

    /// 完整快照
    pub fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.lock();
        let mut snapshot = GraphSnapshot::default();

        for (lock, waiters) in &state.waits.backward {
            let mut owners: Vec<_> = waiters.keys().copied().collect();
            owners.sort();
            snapshot.waiting.insert(*lock, owners);
        }
        for (owner, locks) in &state.holds.forward {
            let mut held: Vec<_> = locks.keys().copied().collect();
            held.sort();
            snapshot.holding.insert(*owner, held);
        }

        snapshot
    }

    /// 只包含与指定锁有关的边的快照
    pub fn snapshot_for(&self, lock: LockId) -> GraphSnapshot {
        let state = self.state.lock();
        let mut snapshot = GraphSnapshot::default();

        let mut waiters: Vec<_> = state.waits.sources(&lock).collect();
        if !waiters.is_empty() {
            waiters.sort();
            snapshot.waiting.insert(lock, waiters);
        }
        for holder in state.holds.sources(&lock) {
            snapshot.holding.insert(holder, vec![lock]);
        }

        snapshot
    }
}

/// 从请求者出发的深度优先搜索
///
/// 目标锁的持有者 → 这些持有者正在等待的锁 → 那些锁的持有者 → ……
/// 回到请求者即确认存在环。
fn find_cycle(state: &GraphState, requester: OwnerId, target: LockId) -> Option<Vec<OwnerId>> {
    let mut visited = HashSet::new();
    let mut path = vec![requester];

    for holder in state.holds.sources(&target) {
        if dfs(state, requester, holder, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs(
    state: &GraphState,
    requester: OwnerId,
    owner: OwnerId,
    visited: &mut HashSet<OwnerId>,
    path: &mut Vec<OwnerId>,
) -> bool {
    path.push(owner);
    if owner == requester {
        return true;
    }

    if visited.insert(owner) {
        for lock in state.waits.targets(&owner) {
            for holder in state.holds.sources(&lock) {
                if dfs(state, requester, holder, visited, path) {
                    return true;
                }
            }
        }
    }

    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_owner_cycle() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let b = graph.register_lock();
        let o1 = OwnerId::new(1);
        let o2 = OwnerId::new(2);

        graph.grant(o1, a);
        graph.grant(o2, b);

        // o1 等待 b：o2 未等待任何锁，无环
        assert!(graph.try_wait(o1, b).is_ok());

        // o2 等待 a：a 被 o1 持有，o1 等待 b，b 被 o2 持有 → 环
        let cycle = graph.try_wait(o2, a).unwrap_err();
        assert_eq!(cycle, vec![o2, o1, o2]);

        // 失败的等待边已回滚
        assert!(!graph.is_waiting(o2, a));
        assert!(graph.is_waiting(o1, b));
    }

    #[test]
    fn test_three_owner_cycle() {
        let graph = WaitForGraph::new();
        let locks: Vec<_> = (0..3).map(|_| graph.register_lock()).collect();
        let owners: Vec<_> = (1..=3).map(OwnerId::new).collect();

        for i in 0..3 {
            graph.grant(owners[i], locks[i]);
        }
        assert!(graph.try_wait(owners[0], locks[1]).is_ok());
        assert!(graph.try_wait(owners[1], locks[2]).is_ok());

        let cycle = graph.try_wait(owners[2], locks[0]).unwrap_err();
        assert_eq!(cycle.first(), Some(&owners[2]));
        assert_eq!(cycle.last(), Some(&owners[2]));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_wait_is_cycle() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let o1 = OwnerId::new(1);

        graph.grant(o1, a);
        assert_eq!(graph.try_wait(o1, a).unwrap_err(), vec![o1, o1]);
    }

    #[test]
    fn test_chain_without_cycle() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let b = graph.register_lock();
        let o1 = OwnerId::new(1);
        let o2 = OwnerId::new(2);
        let o3 = OwnerId::new(3);

        graph.grant(o1, a);
        graph.grant(o2, b);
        assert!(graph.try_wait(o2, a).is_ok());
        assert!(graph.try_wait(o3, b).is_ok());
        assert!(graph.try_wait(o3, a).is_ok());
    }

    #[test]
    fn test_hold_multiplicity() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let o1 = OwnerId::new(1);

        graph.grant(o1, a);
        graph.grant(o1, a);
        assert!(graph.release(o1, a));
        assert!(graph.holds(o1, a));
        assert!(graph.release(o1, a));
        assert!(!graph.holds(o1, a));
        assert!(!graph.release(o1, a));
    }

    #[test]
    fn test_grant_moves_wait_edge() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let o1 = OwnerId::new(1);

        graph.try_wait(o1, a).unwrap();
        graph.grant(o1, a);

        let snapshot = graph.snapshot();
        assert!(snapshot.waiting.is_empty());
        assert_eq!(snapshot.holding.get(&o1), Some(&vec![a]));
    }

    #[test]
    fn test_forget_lock() {
        let graph = WaitForGraph::new();
        let a = graph.register_lock();
        let b = graph.register_lock();
        let o1 = OwnerId::new(1);
        let o2 = OwnerId::new(2);

        graph.grant(o1, a);
        graph.grant(o1, b);
        graph.try_wait(o2, a).unwrap();
        graph.forget_lock(a);

        let snapshot = graph.snapshot();
        assert!(snapshot.waiting.is_empty());
        assert_eq!(snapshot.holding.get(&o1), Some(&vec![b]));
    }

    #[test]
    fn test_anonymous_owner_ids_are_distinct() {
        let first = OwnerId::anonymous();
        let second = OwnerId::anonymous();
        assert_ne!(first, second);
        assert!(first.is_anonymous());
        assert!(!OwnerId::new(42).is_anonymous());
        assert!(first.to_string().starts_with("anon#"));
    }
}
