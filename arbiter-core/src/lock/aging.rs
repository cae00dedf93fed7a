//! # 优先级老化
//!
//! 排队越久，有效优先级越高：
//!
//! `effective = base + min(factor × wait_secs^exponent, max_increment)`
//!
//! 后台任务按 `interval` 周期性刷新（通过锁自己的 [`Timer`] 计时），
//! 任务只持有锁的弱引用；
//! 锁被销毁或调用 `shutdown` 时任务随句柄一起终止。

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AgingOptions;
use crate::lock::LockInner;
use crate::timer::Timer;

/// 计算老化后的有效优先级
pub fn aged_priority(base: u32, waited: Duration, options: &AgingOptions) -> f64 {
    let base = f64::from(base);
    if !options.enabled {
        return base;
    }
    let boost = options.factor * waited.as_secs_f64().powf(options.exponent);
    if !boost.is_finite() {
        return base + options.max_increment;
    }
    base + boost.clamp(0.0, options.max_increment)
}

/// 老化后台任务句柄，丢弃即终止
#[derive(Debug)]
pub(crate) struct AgingTask {
    handle: JoinHandle<()>,
}

impl AgingTask {
    /// 启动老化任务；不在 tokio 运行时中时返回 `None`
    pub fn spawn(lock: Weak<LockInner>, timer: Arc<dyn Timer>, interval: Duration) -> Option<Self> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No tokio runtime; priority aging must be driven with refresh_priorities()");
                return None;
            }
        };

        let handle = runtime.spawn(async move {
            loop {
                timer.sleep(interval).await;
                let Some(inner) = lock.upgrade() else {
                    break;
                };
                inner.refresh_priorities();
            }
            debug!("Aging task exited");
        });

        Some(Self { handle })
    }
}

impl Drop for AgingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
