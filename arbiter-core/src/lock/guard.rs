//! 锁守卫

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::graph::{LockId, OwnerId};
use crate::lock::{LockInner, RequestKind};

/// 锁守卫
///
/// 释放是幂等的：显式调用 [`LockGuard::release`] 之后，`Drop` 不再重复释放。
/// 守卫不借用锁，可以跨任务移动。
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    inner: Arc<LockInner>,
    kind: RequestKind,
    owner: OwnerId,
    acquired_at: Instant,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(inner: Arc<LockInner>, kind: RequestKind, owner: OwnerId, acquired_at: Instant) -> Self {
        Self {
            inner,
            kind,
            owner,
            acquired_at,
            released: false,
        }
    }

    /// 释放锁；重复调用无效果
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.inner.release(self.kind, self.owner, self.acquired_at);
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn lock_id(&self) -> LockId {
        self.inner.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.inner.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}
