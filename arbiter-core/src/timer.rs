//! # 定时器抽象
//!
//! 锁的获取超时、退避等待和优先级老化都通过 [`Timer`] 调度，
//! 生产环境使用 [`TokioTimer`]，测试可以换成虚拟时钟 [`ManualTimer`]。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// 到期回调
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// 定时器句柄
///
/// 丢弃句柄即取消尚未触发的回调；已触发的回调不受影响。
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// 显式取消
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// 可插拔定时器
pub trait Timer: Send + Sync + fmt::Debug + 'static {
    /// 当前时间
    fn now(&self) -> Instant;

    /// 在 `delay` 之后调用 `callback`
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// 等待 `delay`；丢弃返回的 future 会取消底层定时器
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = self.schedule(
            delay,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        Box::pin(async move {
            let _handle = handle;
            let _ = rx.await;
        })
    }
}

/// 基于 tokio 运行时的定时器
///
/// 使用 `tokio::time`，因此在 `tokio::time::pause()` 下同样可确定地推进。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle::new(move || task.abort())
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_id: u64,
    pending: BTreeMap<(Duration, u64), TimerCallback>,
}

/// 手动推进的虚拟时钟
///
/// 回调只在 [`ManualTimer::advance`] 中同步触发，触发时不持有内部锁，
/// 回调里可以继续调度新的定时器。
#[derive(Clone)]
pub struct ManualTimer {
    origin: Instant,
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    /// 推进虚拟时间，按到期顺序触发回调，返回触发数量
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().elapsed + by;
        let mut fired = 0;

        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state.pending.keys().next().copied();
                let key = match next {
                    Some(key) if key.0 <= target => key,
                    _ => {
                        state.elapsed = target;
                        break;
                    }
                };
                state.elapsed = state.elapsed.max(key.0);
                state.pending.remove(&key)
            };

            if let Some(callback) = due {
                callback();
                fired += 1;
            }
        }

        fired
    }

    /// 自创建以来经过的虚拟时间
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// 尚未触发的定时器数量
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimer")
            .field("elapsed", &state.elapsed)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = self.state.lock();
            let key = (state.elapsed + delay, state.next_id);
            state.next_id += 1;
            state.pending.insert(key, callback);
            key
        };

        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().pending.remove(&key);
            }
        })
    }
}
