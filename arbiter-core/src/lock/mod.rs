//! # 锁核心
//!
//! 一把 [`Lock`] 同时支持互斥获取与读写获取，两种模式在任意时刻互斥。
//!
//! ## 并发模型
//!
//! - 每把锁的全部记账（状态、等待队列、统计）放在一个 `parking_lot::Mutex`
//!   里，临界区短且从不跨越 `.await`
//! - 加锁顺序固定为：锁状态 → 等待图，绝不反向
//! - 事件与授予结果在临界区内收集，离开临界区后再分发，监听器可以安全地
//!   回调进锁
//!
//! ## 获取流程
//!
//! ```text
//! acquire ─┬─ 重入快速路径 ──────────────────────────────▶ Guard
//!          ├─ 立即可授予 ─────────────────────────────────▶ Guard
//!          └─ 需要排队 ─ 记录等待边并检测环 ─┬─ 成环 ─────▶ Deadlock
//!                                            └─ 入队 + 定时器
//!                                                 ├─ 授予 ─▶ Guard
//!                                                 ├─ 超时 ─▶ AcquireTimeout
//!                                                 └─ 取消 ─▶ Cancelled
//! ```

pub mod aging;
mod backoff;
mod guard;
pub(crate) mod queue;
pub(crate) mod scheduler;
mod state;
pub mod stats;

pub use aging::aged_priority;
pub use guard::LockGuard;
pub use state::RequestKind;
pub use stats::{ContentionLevel, LockStats};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BackoffOptions, LockOptions, SchedulingStrategy, ValidateConfig};
use crate::error::{BoxError, LockError, Result};
use crate::events::{LockEvent, Listeners, Subscription};
use crate::graph::{LockId, OwnerId, WaitForGraph};
use crate::snapshot::{LockSnapshot, QueueEntrySnapshot, StateSnapshot};
use crate::timer::{Timer, TimerHandle, TokioTimer};

use aging::AgingTask;
use queue::{GrantReceiver, GrantSender, PendingQueue, Waiter};
use scheduler::Scheduler;
use state::{LockState, Vacated};

/// 单次获取的参数
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// 覆盖锁的默认超时；`Some(Duration::ZERO)` 表示不限时
    pub timeout: Option<Duration>,
    /// 持有者身份；为空时分配一个匿名身份
    pub owner: Option<OwnerId>,
    /// 基础优先级（越大越先）
    pub priority: u32,
    /// 外部取消信号
    pub cancel: Option<CancellationToken>,
    /// 覆盖锁的默认退避策略
    pub backoff: Option<BackoffOptions>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// 异步锁
///
/// 克隆得到的是同一把锁的另一个句柄。
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

pub(crate) struct LockInner {
    id: LockId,
    name: String,
    options: LockOptions,
    scheduler: Scheduler,
    graph: Arc<WaitForGraph>,
    timer: Arc<dyn Timer>,
    /// 创建时刻，快照里的时间都相对于它
    epoch: Instant,
    core: Mutex<LockCore>,
    listeners: Listeners,
    aging: Mutex<Option<AgingTask>>,
}

struct LockCore {
    state: LockState,
    queue: PendingQueue,
    next_seq: u64,
    stats: LockStats,
}

/// 临界区内收集、临界区外执行的副作用
#[derive(Default)]
struct Effects {
    events: Vec<LockEvent>,
    grants: Vec<(GrantSender, LockGuard)>,
    rejections: Vec<(GrantSender, LockError)>,
}

enum Admission {
    Granted(LockGuard),
    Queued { seq: u64, rx: GrantReceiver },
}

/// 等待中的请求；future 被丢弃时把条目移出队列
struct PendingWait<'a> {
    inner: &'a Arc<LockInner>,
    seq: u64,
    armed: bool,
}

impl PendingWait<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.armed && self.inner.abandon(self.seq) {
            debug!(lock = %self.inner.id, seq = self.seq, "Acquire future dropped while queued");
        }
    }
}

impl Lock {
    /// 创建独立的锁（私有等待图，tokio 定时器）
    pub fn new(options: LockOptions) -> Self {
        Self::build(None, options, Arc::new(WaitForGraph::new()), Arc::new(TokioTimer))
    }

    /// 使用自定义定时器创建独立的锁
    pub fn with_timer(options: LockOptions, timer: Arc<dyn Timer>) -> Self {
        Self::build(None, options, Arc::new(WaitForGraph::new()), timer)
    }

    pub(crate) fn build(
        name: Option<String>,
        options: LockOptions,
        graph: Arc<WaitForGraph>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let id = graph.register_lock();
        let name = name.unwrap_or_else(|| id.to_string());
        let strategy = options.strategy;
        if let Err(err) = options.validate() {
            warn!(lock = %id, name = %name, error = %err, "Lock created with invalid options");
        }

        let inner = Arc::new(LockInner {
            id,
            name,
            scheduler: Scheduler::new(strategy, options.fairness),
            graph,
            epoch: timer.now(),
            timer,
            core: Mutex::new(LockCore {
                state: LockState::default(),
                queue: PendingQueue::new(strategy),
                next_seq: 0,
                stats: LockStats::default(),
            }),
            listeners: Listeners::default(),
            aging: Mutex::new(None),
            options,
        });

        // 零间隔会让老化任务空转
        let aging = &inner.options.aging;
        if aging.enabled && strategy.is_ranked() && !aging.interval.is_zero() {
            let task = AgingTask::spawn(
                Arc::downgrade(&inner),
                Arc::clone(&inner.timer),
                inner.options.aging.interval,
            );
            *inner.aging.lock() = task;
        }

        debug!(lock = %inner.id, name = %inner.name, %strategy, "Lock created");
        Self { inner }
    }

    pub fn id(&self) -> LockId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &LockOptions {
        &self.inner.options
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.inner.options.strategy
    }

    /// 当前排队数
    pub fn queue_len(&self) -> usize {
        self.inner.core.lock().queue.len()
    }

    /// 互斥获取
    pub async fn acquire(&self, opts: AcquireOptions) -> Result<LockGuard> {
        self.acquire_as(RequestKind::Exclusive, opts).await
    }

    /// 使用默认参数互斥获取
    pub async fn lock(&self) -> Result<LockGuard> {
        self.acquire(AcquireOptions::default()).await
    }

    /// 共享读获取
    pub async fn read_lock(&self, opts: AcquireOptions) -> Result<LockGuard> {
        self.acquire_as(RequestKind::Read, opts).await
    }

    /// 共享写获取
    pub async fn write_lock(&self, opts: AcquireOptions) -> Result<LockGuard> {
        self.acquire_as(RequestKind::Write, opts).await
    }

    /// 非阻塞互斥获取
    ///
    /// 从不排队，也不做死锁检测；锁被占用（或有排队者）时返回 `None`。
    pub fn try_acquire(&self, owner: Option<OwnerId>) -> Option<LockGuard> {
        let owner = owner.unwrap_or_else(OwnerId::anonymous);
        let mut fx = Effects::default();
        let guard = {
            let mut core = self.inner.core.lock();
            self.inner
                .grant_now(&mut core, RequestKind::Exclusive, owner, 0, &mut fx)
        };
        self.inner.flush(fx);
        if guard.is_none() {
            trace!(lock = %self.inner.id, %owner, "try_acquire found the lock busy");
        }
        guard
    }

    /// 在锁内执行 `f`，无论成功、失败、panic 还是 future 被丢弃都会释放锁
    ///
    /// `f` 返回的 [`LockError`] 原样透传，其余错误包装为
    /// [`LockError::ExecutionFailed`]。
    pub async fn run_exclusive<F, Fut, T, E>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let opts = AcquireOptions {
            timeout,
            ..AcquireOptions::default()
        };
        self.run_exclusive_with(opts, f).await
    }

    /// [`Lock::run_exclusive`] 的完整参数版本
    pub async fn run_exclusive_with<F, Fut, T, E>(&self, opts: AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut guard = self.acquire(opts).await?;

        let outcome = AssertUnwindSafe(async move { f().await })
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(LockError::from_callback(self.inner.id, err.into())),
            Err(panic) => Err(LockError::ExecutionFailed {
                lock: self.inner.id,
                source: panic_message(panic).into(),
            }),
        };

        if let Err(err) = &result {
            self.inner.on_execution_failure(guard.owner(), err);
        }
        guard.release();
        result
    }

    /// 注册同步事件回调
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LockEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(Arc::new(listener))
    }

    /// 移除回调，返回订阅是否存在
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.listeners.unsubscribe(subscription)
    }

    /// 事件广播接收端
    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.listeners.receiver()
    }

    /// 只读诊断快照
    pub fn dump(&self) -> LockSnapshot {
        let inner = &self.inner;
        let core = inner.core.lock();

        let state = StateSnapshot {
            locked: core.state.locked,
            owner: core.state.owner,
            reentrant_count: core.state.reentrant_count,
            reader_count: core.state.reader_count,
            writer_active: core.state.writer_active,
            writer: core.state.writer,
            readers: core.state.readers.iter().map(|(owner, n)| (*owner, *n)).collect(),
        };
        let queue = core
            .queue
            .in_service_order()
            .into_iter()
            .map(|w| QueueEntrySnapshot {
                seq: w.seq,
                owner: w.owner,
                kind: w.kind,
                priority: w.priority,
                effective_priority: w.effective_priority,
                enqueued_at: w.enqueued_at.saturating_duration_since(inner.epoch),
                has_timeout: w.timeout.is_some(),
            })
            .collect();

        LockSnapshot {
            id: inner.id,
            name: inner.name.clone(),
            strategy: inner.options.strategy,
            state,
            queue,
            graph: inner.graph.snapshot_for(inner.id),
            stats: core.stats.clone(),
        }
    }

    pub fn stats(&self) -> LockStats {
        self.inner.core.lock().stats.clone()
    }

    /// 立即执行一轮优先级老化并重新调度
    pub fn refresh_priorities(&self) {
        self.inner.refresh_priorities();
    }

    /// 停止老化任务，并以 `Cancelled` 结束所有排队请求
    ///
    /// 已授予的守卫不受影响。返回被取消的请求数。
    pub fn shutdown(&self) -> usize {
        if self.inner.aging.lock().take().is_some() {
            debug!(lock = %self.inner.id, "Aging task stopped");
        }
        self.inner.fail_pending("lock shut down")
    }

    async fn acquire_as(&self, kind: RequestKind, opts: AcquireOptions) -> Result<LockGuard> {
        let owner = opts.owner.unwrap_or_else(OwnerId::anonymous);
        let policy = opts
            .backoff
            .clone()
            .unwrap_or_else(|| self.inner.options.backoff.clone());
        let max_attempts = policy.attempts();

        let mut attempt = 1;
        loop {
            let err = match self.attempt(kind, owner, &opts).await {
                Ok(guard) => return Ok(guard),
                Err(err) => err,
            };

            if !err.is_retryable() || max_attempts == 1 {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(
                    lock = %self.inner.id,
                    %owner,
                    %kind,
                    attempts = attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(LockError::AcquireFailed {
                    lock: self.inner.id,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = policy.delay_for(attempt);
            debug!(
                lock = %self.inner.id,
                %owner,
                attempt,
                ?delay,
                error = %err,
                "Acquire attempt failed; backing off"
            );
            self.backoff(delay, opts.cancel.as_ref(), owner).await?;
            attempt += 1;
        }
    }

    /// 可取消的退避等待
    async fn backoff(&self, delay: Duration, cancel: Option<&CancellationToken>, owner: OwnerId) -> Result<()> {
        let sleep = self.inner.timer.sleep(delay);
        match cancel {
            None => {
                sleep.await;
                Ok(())
            }
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(self.inner.cancelled(owner)),
                _ = sleep => Ok(()),
            },
        }
    }

    /// 单次获取尝试
    async fn attempt(&self, kind: RequestKind, owner: OwnerId, opts: &AcquireOptions) -> Result<LockGuard> {
        if opts.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(self.inner.cancelled(owner));
        }

        let timeout = opts
            .timeout
            .or(self.inner.options.default_timeout)
            .filter(|t| !t.is_zero());

        let (seq, mut rx) = match self.inner.admit(kind, owner, opts.priority, timeout)? {
            Admission::Granted(guard) => return Ok(guard),
            Admission::Queued { seq, rx } => (seq, rx),
        };
        let mut pending = PendingWait {
            inner: &self.inner,
            seq,
            armed: true,
        };

        let outcome = match &opts.cancel {
            None => Some((&mut rx).await),
            Some(token) => tokio::select! {
                biased;
                outcome = &mut rx => Some(outcome),
                _ = token.cancelled() => None,
            },
        };
        pending.disarm();

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                // 发送端在未发送的情况下被丢弃，只可能是锁已被回收
                warn!(lock = %self.inner.id, %owner, "Grant channel closed without a result");
                Err(self.inner.cancelled(owner))
            }
            None => {
                if !self.inner.abandon(seq) {
                    // 取消与授予竞争失败：收下守卫并立即释放
                    if let Ok(Ok(guard)) = rx.await {
                        debug!(lock = %self.inner.id, %owner, "Releasing grant that raced with cancellation");
                        drop(guard);
                    }
                }
                Err(self.inner.cancelled(owner))
            }
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.options.strategy)
            .finish()
    }
}

impl LockInner {
    fn weight(&self, kind: RequestKind) -> f64 {
        match self.options.strategy {
            SchedulingStrategy::Weighted => self.options.weights.weight(kind),
            _ => 1.0,
        }
    }

    fn guard(self: &Arc<Self>, kind: RequestKind, owner: OwnerId, at: Instant) -> LockGuard {
        LockGuard::new(Arc::clone(self), kind, owner, at)
    }

    /// 重入或立即授予；都不满足时返回 `None`，不修改任何状态
    fn grant_now(
        self: &Arc<Self>,
        core: &mut LockCore,
        kind: RequestKind,
        owner: OwnerId,
        priority: u32,
        fx: &mut Effects,
    ) -> Option<LockGuard> {
        let now = self.timer.now();

        if kind == RequestKind::Exclusive
            && self.options.reentrant
            && core.state.locked
            && core.state.owner == Some(owner)
        {
            let depth = core.state.reenter();
            core.stats.record_reentry();
            info!(lock = %self.id, %owner, depth, "Reentrant acquire");
            fx.events.push(LockEvent::ReentrantAcquired {
                lock: self.id,
                owner,
                depth,
            });
            return Some(self.guard(kind, owner, now));
        }

        let admitted = self.scheduler.admits_immediately(
            &core.queue,
            &core.state,
            kind,
            core.next_seq,
            f64::from(priority),
            self.weight(kind),
        );
        if !admitted {
            return None;
        }

        core.state.occupy(kind, owner);
        self.graph.grant(owner, self.id);
        core.stats.record_acquisition(Duration::ZERO);
        debug!(lock = %self.id, %owner, %kind, "Lock granted immediately");
        fx.events.push(LockEvent::Acquired {
            lock: self.id,
            owner,
            kind,
            waited: Duration::ZERO,
        });
        Some(self.guard(kind, owner, now))
    }

    fn admit(
        self: &Arc<Self>,
        kind: RequestKind,
        owner: OwnerId,
        priority: u32,
        timeout: Option<Duration>,
    ) -> Result<Admission> {
        let mut fx = Effects::default();
        let admission = {
            let mut core = self.core.lock();
            self.admit_locked(&mut core, kind, owner, priority, timeout, &mut fx)
        };
        self.flush(fx);
        admission
    }

    fn admit_locked(
        self: &Arc<Self>,
        core: &mut LockCore,
        kind: RequestKind,
        owner: OwnerId,
        priority: u32,
        timeout: Option<Duration>,
        fx: &mut Effects,
    ) -> Result<Admission> {
        if let Some(guard) = self.grant_now(core, kind, owner, priority, fx) {
            return Ok(Admission::Granted(guard));
        }

        // 即将排队：先记录等待边，成环则整条请求作废
        if let Err(cycle) = self.graph.try_wait(owner, self.id) {
            core.stats.deadlock_count += 1;
            let err = LockError::Deadlock {
                lock: self.id,
                owner,
            };
            error!(lock = %self.id, %owner, %kind, ?cycle, "Deadlock detected; request rejected");
            fx.events.push(error_event(self.id, Some(owner), &err));
            return Err(err);
        }

        let seq = core.next_seq;
        core.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        let timeout_handle = timeout.map(|t| self.arm_timeout(seq, t));

        core.queue.push(Waiter {
            seq,
            owner,
            kind,
            priority,
            effective_priority: f64::from(priority),
            weight: self.weight(kind),
            enqueued_at: self.timer.now(),
            notify: tx,
            timeout: timeout_handle,
        });
        core.stats.queued += 1;
        core.stats.set_waiters(core.queue.len());

        debug!(
            lock = %self.id,
            %owner,
            %kind,
            priority,
            seq,
            queue_len = core.queue.len(),
            ?timeout,
            "Request queued"
        );
        Ok(Admission::Queued { seq, rx })
    }

    fn arm_timeout(self: &Arc<Self>, seq: u64, timeout: Duration) -> TimerHandle {
        let lock = Arc::downgrade(self);
        self.timer.schedule(
            timeout,
            Box::new(move || {
                if let Some(inner) = lock.upgrade() {
                    inner.expire(seq, timeout);
                }
            }),
        )
    }

    /// 超时定时器到期
    fn expire(self: &Arc<Self>, seq: u64, timeout: Duration) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock();
            // 已被授予或移除
            let Some(waiter) = core.queue.remove(seq) else {
                return;
            };

            self.graph.cancel_wait(waiter.owner, self.id);
            core.stats.timeout_count += 1;
            let waited = self.timer.now().saturating_duration_since(waiter.enqueued_at);
            warn!(
                lock = %self.id,
                owner = %waiter.owner,
                kind = %waiter.kind,
                ?timeout,
                ?waited,
                "Lock acquisition timed out"
            );

            fx.events.push(LockEvent::Timeout {
                lock: self.id,
                owner: waiter.owner,
                kind: waiter.kind,
                timeout,
            });
            fx.rejections.push((
                waiter.notify,
                LockError::AcquireTimeout {
                    lock: self.id,
                    owner: waiter.owner,
                    kind: waiter.kind,
                    timeout,
                },
            ));

            self.schedule(&mut core, &mut fx);
        }
        self.flush(fx);
    }

    /// 把条目移出队列（取消或 future 被丢弃）；返回条目是否仍在队列中
    fn abandon(self: &Arc<Self>, seq: u64) -> bool {
        let mut fx = Effects::default();
        let removed = {
            let mut core = self.core.lock();
            match core.queue.remove(seq) {
                Some(waiter) => {
                    self.graph.cancel_wait(waiter.owner, self.id);
                    debug!(lock = %self.id, owner = %waiter.owner, seq, "Queued request withdrawn");
                    // 被移除的可能是阻塞着其他兼容请求的队首
                    self.schedule(&mut core, &mut fx);
                    true
                }
                None => false,
            }
        };
        self.flush(fx);
        removed
    }

    /// 记录一次取消并构造错误
    fn cancelled(&self, owner: OwnerId) -> LockError {
        let err = LockError::Cancelled {
            lock: self.id,
            owner,
        };
        self.core.lock().stats.cancelled_count += 1;
        debug!(lock = %self.id, %owner, "Acquisition cancelled");
        self.listeners.emit(&error_event(self.id, Some(owner), &err));
        err
    }

    /// 释放
    ///
    /// 最终释放在同一临界区内把锁直接交给调度器选出的下一个等待者。
    fn release(self: &Arc<Self>, kind: RequestKind, owner: OwnerId, acquired_at: Instant) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock();
            let held = self.timer.now().saturating_duration_since(acquired_at);

            match core.state.vacate(kind, owner) {
                Vacated::Reentrant { depth } => {
                    info!(lock = %self.id, %owner, depth, "Reentrant release");
                    fx.events.push(LockEvent::ReentrantReleased {
                        lock: self.id,
                        owner,
                        depth,
                    });
                }
                vacated => {
                    if vacated == Vacated::Inconsistent {
                        core.stats.inconsistencies += 1;
                        warn!(
                            lock = %self.id,
                            %owner,
                            %kind,
                            state = ?core.state,
                            "Release does not match lock state; normalizing"
                        );
                        core.state.normalize();
                    } else {
                        core.stats.record_release(held);
                        debug!(lock = %self.id, %owner, %kind, ?held, ?vacated, "Lock released");
                        fx.events.push(LockEvent::Released {
                            lock: self.id,
                            owner,
                            kind,
                            held,
                        });
                    }
                    self.graph.release(owner, self.id);

                    let before = core.stats.total_acquisitions;
                    self.schedule(&mut core, &mut fx);
                    let handed_off = core.stats.total_acquisitions - before;
                    if handed_off > 0 {
                        info!(lock = %self.id, from = %owner, granted = handed_off, "Lock handed off");
                    }
                }
            }
        }
        self.flush(fx);
    }

    /// 授予所有当前可授予的等待者
    fn schedule(self: &Arc<Self>, core: &mut LockCore, fx: &mut Effects) {
        let now = self.timer.now();
        while let Some(waiter) = self.scheduler.next(&mut core.queue, &core.state) {
            core.state.occupy(waiter.kind, waiter.owner);
            self.graph.grant(waiter.owner, self.id);

            let waited = now.saturating_duration_since(waiter.enqueued_at);
            core.stats.record_acquisition(waited);
            debug!(
                lock = %self.id,
                owner = %waiter.owner,
                kind = %waiter.kind,
                seq = waiter.seq,
                ?waited,
                "Lock granted to queued request"
            );

            fx.events.push(LockEvent::Acquired {
                lock: self.id,
                owner: waiter.owner,
                kind: waiter.kind,
                waited,
            });
            let guard = self.guard(waiter.kind, waiter.owner, now);
            fx.grants.push((waiter.notify, guard));
        }
        core.stats.set_waiters(core.queue.len());
    }

    /// 以 `Cancelled` 结束所有排队请求
    fn fail_pending(self: &Arc<Self>, reason: &str) -> usize {
        let mut fx = Effects::default();
        let failed = {
            let mut core = self.core.lock();
            let drained = core.queue.drain();
            let failed = drained.len();
            for waiter in drained {
                self.graph.cancel_wait(waiter.owner, self.id);
                let err = LockError::Cancelled {
                    lock: self.id,
                    owner: waiter.owner,
                };
                fx.events.push(error_event(self.id, Some(waiter.owner), &err));
                fx.rejections.push((waiter.notify, err));
            }
            core.stats.cancelled_count += failed as u64;
            core.stats.set_waiters(0);
            failed
        };
        if failed > 0 {
            warn!(lock = %self.id, failed, reason, "Failed all queued requests");
        }
        self.flush(fx);
        failed
    }

    fn on_execution_failure(self: &Arc<Self>, owner: OwnerId, err: &LockError) {
        self.core.lock().stats.execution_failures += 1;
        error!(lock = %self.id, %owner, error = %err, "Exclusive section failed");
        self.listeners.emit(&error_event(self.id, Some(owner), err));

        if self.options.cancel_on_error {
            self.fail_pending("exclusive section failed");
        }
    }

    fn refresh_priorities(self: &Arc<Self>) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock();
            if core.queue.is_empty() {
                return;
            }
            let now = self.timer.now();
            let aging = &self.options.aging;
            core.queue.reprioritize(|w| {
                let waited = now.saturating_duration_since(w.enqueued_at);
                w.effective_priority = aged_priority(w.priority, waited, aging);
            });
            trace!(lock = %self.id, queue_len = core.queue.len(), "Priorities refreshed");
            self.schedule(&mut core, &mut fx);
        }
        self.flush(fx);
    }

    /// 分发收集到的副作用（必须在临界区外调用）
    fn flush(&self, fx: Effects) {
        let Effects {
            events,
            grants,
            rejections,
        } = fx;

        for event in &events {
            self.listeners.emit(event);
        }
        for (tx, guard) in grants {
            if let Err(Ok(guard)) = tx.send(Ok(guard)) {
                // 等待者已离开，立刻归还
                debug!(lock = %self.id, owner = %guard.owner(), "Grant receiver gone; releasing");
                drop(guard);
            }
        }
        for (tx, err) in rejections {
            let _ = tx.send(Err(err));
        }
    }
}

impl Drop for LockInner {
    fn drop(&mut self) {
        self.graph.forget_lock(self.id);
        trace!(lock = %self.id, "Lock dropped");
    }
}

fn error_event(lock: LockId, owner: Option<OwnerId>, err: &LockError) -> LockEvent {
    LockEvent::Error {
        lock,
        owner,
        error: err.kind(),
        message: err.to_string(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("callback panicked: {msg}")
    } else {
        "callback panicked".to_string()
    }
}
