//! # 生命周期事件
//!
//! 每把锁持有自己的监听器注册表，没有全局事件总线。
//!
//! 两种订阅方式：
//! - [`crate::Lock::subscribe`]：同步回调，在状态变更提交之后、锁的临界区之外调用
//! - [`crate::Lock::events`]：`tokio::sync::broadcast` 接收端，适合异步消费
//!
//! 回调 panic 会被捕获并记录，不会影响锁的推进。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::error;

use crate::error::LockErrorKind;
use crate::graph::{LockId, OwnerId};
use crate::lock::RequestKind;

/// 广播通道容量；慢消费者会收到 `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 锁事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LockEvent {
    Acquired {
        lock: LockId,
        owner: OwnerId,
        kind: RequestKind,
        waited: Duration,
    },
    Released {
        lock: LockId,
        owner: OwnerId,
        kind: RequestKind,
        held: Duration,
    },
    Timeout {
        lock: LockId,
        owner: OwnerId,
        kind: RequestKind,
        timeout: Duration,
    },
    Error {
        lock: LockId,
        owner: Option<OwnerId>,
        error: LockErrorKind,
        message: String,
    },
    ReentrantAcquired {
        lock: LockId,
        owner: OwnerId,
        depth: u32,
    },
    ReentrantReleased {
        lock: LockId,
        owner: OwnerId,
        depth: u32,
    },
}

impl LockEvent {
    /// 事件名（与序列化标签一致）
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquired { .. } => "acquired",
            Self::Released { .. } => "released",
            Self::Timeout { .. } => "timeout",
            Self::Error { .. } => "error",
            Self::ReentrantAcquired { .. } => "reentrant-acquired",
            Self::ReentrantReleased { .. } => "reentrant-released",
        }
    }

    pub fn lock(&self) -> LockId {
        match self {
            Self::Acquired { lock, .. }
            | Self::Released { lock, .. }
            | Self::Timeout { lock, .. }
            | Self::Error { lock, .. }
            | Self::ReentrantAcquired { lock, .. }
            | Self::ReentrantReleased { lock, .. } => *lock,
        }
    }
}

/// 事件回调
pub type Listener = Arc<dyn Fn(&LockEvent) + Send + Sync>;

/// 订阅句柄
///
/// 传给 [`crate::Lock::unsubscribe`] 以移除回调。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// 订阅唯一 ID
    pub id: u64,
}

/// 监听器注册表
pub(crate) struct Listeners {
    entries: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<LockEvent>,
}

impl Default for Listeners {
    fn default() -> Self {
        let (channel, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }
}

impl Listeners {
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));
        Subscription { id }
    }

    /// 返回订阅是否存在
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        entries.len() != before
    }

    pub fn receiver(&self) -> broadcast::Receiver<LockEvent> {
        self.channel.subscribe()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// 分发事件
    ///
    /// 先拷贝监听器列表再调用，回调里可以订阅或退订。
    pub fn emit(&self, event: &LockEvent) {
        let listeners: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(lock = %event.lock(), event = event.name(), "Lock event listener panicked");
            }
        }

        // 没有接收端时发送失败，忽略即可
        let _ = self.channel.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn released() -> LockEvent {
        LockEvent::Released {
            lock: LockId::from_raw(1),
            owner: OwnerId::new(7),
            kind: RequestKind::Exclusive,
            held: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_event_names_match_serde_tags() {
        let event = LockEvent::ReentrantAcquired {
            lock: LockId::from_raw(1),
            owner: OwnerId::new(2),
            depth: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(serde_json::to_value(released()).unwrap()["event"], "released");
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let listeners = Listeners::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let subscription = listeners.subscribe(Arc::new(move |event: &LockEvent| {
            sink.lock().push(event.name());
        }));

        listeners.emit(&released());
        assert!(listeners.unsubscribe(&subscription));
        assert!(!listeners.unsubscribe(&subscription));
        listeners.emit(&released());

        assert_eq!(*seen.lock(), vec!["released"]);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let listeners = Listeners::default();
        let count = Arc::new(AtomicU64::new(0));

        listeners.subscribe(Arc::new(|_: &LockEvent| panic!("listener failure")));
        let counter = Arc::clone(&count);
        listeners.subscribe(Arc::new(move |_: &LockEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let listeners = Listeners::default();
        let mut rx = listeners.receiver();
        listeners.emit(&released());
        assert_eq!(rx.recv().await.unwrap(), released());
    }
}
