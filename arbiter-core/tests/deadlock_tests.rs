//! # 死锁检测集成测试

use std::sync::Arc;
use std::time::Duration;

use arbiter_core::{
    AcquireOptions, ArbiterConfig, LockErrorKind, LockManager, ManualTimer, OwnerId,
};
use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

fn as_owner(n: u64) -> AcquireOptions {
    AcquireOptions::new().with_owner(OwnerId::new(n))
}

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_two_owner_two_lock_deadlock_fails_fast() {
    init_test_logging();
    let manager = LockManager::with_timer(ArbiterConfig::default(), Arc::new(ManualTimer::new()));
    let l1 = manager.create("l1");
    let l2 = manager.create("l2");

    let a_holds_l1 = l1.try_acquire(Some(OwnerId::new(1))).unwrap();
    let _b_holds_l2 = l2.try_acquire(Some(OwnerId::new(2))).unwrap();

    // B 等待 L1
    let mut b_waits = tokio_test::task::spawn(l1.acquire(as_owner(2)));
    assert_pending!(b_waits.poll());

    // A 请求 L2 闭合环：立即失败，不排队
    let mut a_waits = tokio_test::task::spawn(l2.acquire(as_owner(1)));
    let err = assert_ready_err!(a_waits.poll());
    assert_eq!(err.kind(), LockErrorKind::Deadlock);
    assert_eq!(l2.queue_len(), 0);
    assert_eq!(l2.stats().deadlock_count, 1);

    // 图中只剩 B → L1 的等待边
    let graph = manager.graph_snapshot();
    assert_eq!(graph.waiting.get(&l1.id()), Some(&vec![OwnerId::new(2)]));
    assert!(graph.waiting.get(&l2.id()).is_none());

    // A 放手后 B 继续推进
    drop(a_holds_l1);
    let guard = assert_ready_ok!(b_waits.poll());
    assert_eq!(guard.owner(), OwnerId::new(2));
}

#[test]
fn test_three_owner_cycle() {
    let manager = LockManager::with_timer(ArbiterConfig::default(), Arc::new(ManualTimer::new()));
    let locks: Vec<_> = (0..3).map(|i| manager.create(format!("l{i}"))).collect();
    let _held: Vec<_> = (0..3)
        .map(|i| locks[i].try_acquire(Some(OwnerId::new(i as u64))).unwrap())
        .collect();

    // 0 → l1, 1 → l2
    let mut w0 = tokio_test::task::spawn(locks[1].acquire(as_owner(0)));
    let mut w1 = tokio_test::task::spawn(locks[2].acquire(as_owner(1)));
    assert_pending!(w0.poll());
    assert_pending!(w1.poll());

    // 2 → l0 闭合三元环
    let mut w2 = tokio_test::task::spawn(locks[0].acquire(as_owner(2)));
    assert_eq!(assert_ready_err!(w2.poll()).kind(), LockErrorKind::Deadlock);
}

#[test]
fn test_reader_writer_cycle_across_locks() {
    let manager = LockManager::with_timer(ArbiterConfig::default(), Arc::new(ManualTimer::new()));
    let l1 = manager.create("l1");
    let l2 = manager.create("l2");

    let mut r = tokio_test::task::spawn(l1.read_lock(as_owner(1)));
    let _read = assert_ready_ok!(r.poll());
    let mut w = tokio_test::task::spawn(l2.write_lock(as_owner(2)));
    let _write = assert_ready_ok!(w.poll());

    let mut blocked = tokio_test::task::spawn(l2.read_lock(as_owner(1)));
    assert_pending!(blocked.poll());

    let mut closing = tokio_test::task::spawn(l1.write_lock(as_owner(2)));
    assert_eq!(assert_ready_err!(closing.poll()).kind(), LockErrorKind::Deadlock);
}

#[test]
fn test_timeout_removes_wait_edge() {
    let timer = ManualTimer::new();
    let manager = LockManager::with_timer(ArbiterConfig::default(), Arc::new(timer.clone()));
    let l1 = manager.create("l1");
    let l2 = manager.create("l2");

    let _a = l1.try_acquire(Some(OwnerId::new(1))).unwrap();
    let _b = l2.try_acquire(Some(OwnerId::new(2))).unwrap();

    let mut b_waits = tokio_test::task::spawn(
        l1.acquire(as_owner(2).with_timeout(Duration::from_millis(5))),
    );
    assert_pending!(b_waits.poll());
    timer.advance(Duration::from_millis(5));
    assert_eq!(assert_ready_err!(b_waits.poll()).kind(), LockErrorKind::AcquireTimeout);

    // B 已不再等待，A 请求 L2 只是普通排队
    let mut a_waits = tokio_test::task::spawn(l2.acquire(as_owner(1)));
    assert_pending!(a_waits.poll());
    assert_eq!(l2.queue_len(), 1);
}

#[test]
fn test_separate_managers_do_not_share_graph() {
    let first = LockManager::with_timer(ArbiterConfig::default(), Arc::new(ManualTimer::new()));
    let second = LockManager::with_timer(ArbiterConfig::default(), Arc::new(ManualTimer::new()));
    let l1 = first.create("shared-name");
    let l2 = second.create("shared-name");

    let _a = l1.try_acquire(Some(OwnerId::new(1))).unwrap();
    let _b = l2.try_acquire(Some(OwnerId::new(2))).unwrap();

    let mut b_waits = tokio_test::task::spawn(l1.acquire(as_owner(2)));
    assert_pending!(b_waits.poll());
    // 不同图中看不到环，只能排队
    let mut a_waits = tokio_test::task::spawn(l2.acquire(as_owner(1)));
    assert_pending!(a_waits.poll());

    assert!(first.graph_snapshot().holding.get(&OwnerId::new(2)).is_none());
}
