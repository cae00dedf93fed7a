//! 调度器：释放时选出下一个（或下一批）被授予的等待者。

use std::collections::{BinaryHeap, VecDeque};

use crate::config::SchedulingStrategy;
use crate::lock::queue::{PendingQueue, Waiter};
use crate::lock::state::LockState;
use crate::lock::RequestKind;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Scheduler {
    pub strategy: SchedulingStrategy,
    pub fairness: bool,
}

impl Scheduler {
    pub fn new(strategy: SchedulingStrategy, fairness: bool) -> Self {
        Self { strategy, fairness }
    }

    /// 新请求能否不排队直接授予
    ///
    /// 写/互斥请求在队列非空时一律排队，避免插队；读请求在公平模式下
    /// 遇到优先级不低于自己的排队写者时排队。
    pub fn admits_immediately(
        &self,
        queue: &PendingQueue,
        state: &LockState,
        kind: RequestKind,
        next_seq: u64,
        priority: f64,
        weight: f64,
    ) -> bool {
        if !state.is_compatible(kind) {
            return false;
        }
        match kind {
            RequestKind::Read => !(self.fairness && queue.writer_ahead(next_seq, priority, weight)),
            RequestKind::Write | RequestKind::Exclusive => queue.is_empty(),
        }
    }

    /// 从队列中取出下一个可授予的等待者
    ///
    /// 调用方循环调用直到返回 `None`，一次释放即可放行多个兼容的读者。
    pub fn next(&self, queue: &mut PendingQueue, state: &LockState) -> Option<Waiter> {
        match (self.strategy, queue) {
            (SchedulingStrategy::Fifo, PendingQueue::Ordered(entries)) => {
                Self::next_fifo(entries, state)
            }
            (SchedulingStrategy::RoundRobin, PendingQueue::Ordered(entries)) => {
                self.next_round_robin(entries, state)
            }
            (_, PendingQueue::Ranked(heap)) => self.next_ranked(heap, state),
            // 策略与队列形态在构造时绑定，不会出现其余组合
            (_, PendingQueue::Ordered(entries)) => Self::next_fifo(entries, state),
        }
    }

    /// 只看队首；不兼容的队首原地阻塞，保证顺序
    fn next_fifo(entries: &mut VecDeque<Waiter>, state: &LockState) -> Option<Waiter> {
        let head = entries.front()?;
        if state.is_compatible(head.kind) {
            entries.pop_front()
        } else {
            None
        }
    }

    /// 弹出队首，不可授予则轮转到队尾；一整轮无可授予者即停止
    fn next_round_robin(&self, entries: &mut VecDeque<Waiter>, state: &LockState) -> Option<Waiter> {
        for _ in 0..entries.len() {
            let waiter = entries.pop_front()?;
            let blocked = !state.is_compatible(waiter.kind)
                || (self.fairness
                    && waiter.kind == RequestKind::Read
                    && entries.iter().any(|w| {
                        w.kind.is_exclusive_like()
                            && w.seq < waiter.seq
                            && w.effective_priority >= waiter.effective_priority
                    }));
            if !blocked {
                return Some(waiter);
            }
            entries.push_back(waiter);
        }
        None
    }

    /// 取排名最高的可授予条目；排在前面但不可授予的条目原样放回
    fn next_ranked(&self, heap: &mut BinaryHeap<Waiter>, state: &LockState) -> Option<Waiter> {
        let mut skipped = Vec::new();
        let mut chosen = None;

        while let Some(waiter) = heap.pop() {
            let writer_ahead = skipped.iter().any(|w: &Waiter| w.kind.is_exclusive_like());
            let blocked = !state.is_compatible(waiter.kind)
                || (self.fairness && waiter.kind == RequestKind::Read && writer_ahead);
            if blocked {
                skipped.push(waiter);
                continue;
            }
            chosen = Some(waiter);
            break;
        }

        heap.extend(skipped);
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OwnerId;
    use crate::lock::queue::tests::waiter;

    fn drain_grants(scheduler: &Scheduler, queue: &mut PendingQueue, state: &mut LockState) -> Vec<u64> {
        let mut granted = Vec::new();
        while let Some(w) = scheduler.next(queue, state) {
            state.occupy(w.kind, w.owner);
            granted.push(w.seq);
        }
        granted
    }

    #[test]
    fn test_fifo_grants_head_only() {
        let scheduler = Scheduler::new(SchedulingStrategy::Fifo, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::Fifo);
        queue.push(waiter(0, RequestKind::Exclusive, 0));
        queue.push(waiter(1, RequestKind::Exclusive, 0));

        let mut state = LockState::default();
        assert_eq!(drain_grants(&scheduler, &mut queue, &mut state), vec![0]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_batches_readers_until_writer() {
        let scheduler = Scheduler::new(SchedulingStrategy::Fifo, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::Fifo);
        queue.push(waiter(0, RequestKind::Read, 0));
        queue.push(waiter(1, RequestKind::Read, 0));
        queue.push(waiter(2, RequestKind::Write, 0));
        queue.push(waiter(3, RequestKind::Read, 0));

        let mut state = LockState::default();
        assert_eq!(drain_grants(&scheduler, &mut queue, &mut state), vec![0, 1]);
        assert_eq!(state.reader_count, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_incompatible_head_blocks() {
        let scheduler = Scheduler::new(SchedulingStrategy::Fifo, false);
        let mut queue = PendingQueue::new(SchedulingStrategy::Fifo);
        queue.push(waiter(0, RequestKind::Write, 0));
        queue.push(waiter(1, RequestKind::Read, 0));

        let mut state = LockState::default();
        state.occupy(RequestKind::Read, OwnerId::new(99));
        assert!(scheduler.next(&mut queue, &state).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_round_robin_rotates_incompatible_head() {
        let scheduler = Scheduler::new(SchedulingStrategy::RoundRobin, false);
        let mut queue = PendingQueue::new(SchedulingStrategy::RoundRobin);
        queue.push(waiter(0, RequestKind::Write, 0));
        queue.push(waiter(1, RequestKind::Read, 0));

        let mut state = LockState::default();
        state.occupy(RequestKind::Read, OwnerId::new(99));

        let granted = scheduler.next(&mut queue, &state).map(|w| w.seq);
        assert_eq!(granted, Some(1));
        // 写者被轮转到队尾，仍在队列中
        assert_eq!(queue.in_service_order()[0].seq, 0);
    }

    #[test]
    fn test_round_robin_respects_fairness() {
        let scheduler = Scheduler::new(SchedulingStrategy::RoundRobin, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::RoundRobin);
        queue.push(waiter(0, RequestKind::Write, 0));
        queue.push(waiter(1, RequestKind::Read, 0));

        let mut state = LockState::default();
        state.occupy(RequestKind::Read, OwnerId::new(99));
        assert!(scheduler.next(&mut queue, &state).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_ranked_picks_highest_compatible() {
        let scheduler = Scheduler::new(SchedulingStrategy::Priority, false);
        let mut queue = PendingQueue::new(SchedulingStrategy::Priority);
        queue.push(waiter(0, RequestKind::Write, 9));
        queue.push(waiter(1, RequestKind::Read, 2));
        queue.push(waiter(2, RequestKind::Read, 5));

        let mut state = LockState::default();
        state.occupy(RequestKind::Read, OwnerId::new(99));

        // 写者最高但不兼容，读者按优先级放行
        let granted: Vec<u64> = std::iter::from_fn(|| scheduler.next(&mut queue, &state))
            .map(|w| w.seq)
            .collect();
        assert_eq!(granted, vec![2, 1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ranked_fairness_holds_readers_behind_writer() {
        let scheduler = Scheduler::new(SchedulingStrategy::Priority, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::Priority);
        queue.push(waiter(0, RequestKind::Write, 9));
        queue.push(waiter(1, RequestKind::Read, 2));

        let mut state = LockState::default();
        state.occupy(RequestKind::Read, OwnerId::new(99));
        assert!(scheduler.next(&mut queue, &state).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_ranked_ties_in_arrival_order() {
        let scheduler = Scheduler::new(SchedulingStrategy::Priority, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::Priority);
        for seq in 0..4 {
            queue.push(waiter(seq, RequestKind::Exclusive, 1));
        }

        let mut order = Vec::new();
        let mut state = LockState::default();
        while let Some(w) = scheduler.next(&mut queue, &state) {
            order.push(w.seq);
            state.occupy(w.kind, w.owner);
            state.vacate(w.kind, w.owner);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_admits_immediately() {
        let scheduler = Scheduler::new(SchedulingStrategy::Fifo, true);
        let mut queue = PendingQueue::new(SchedulingStrategy::Fifo);
        let mut state = LockState::default();

        assert!(scheduler.admits_immediately(&queue, &state, RequestKind::Exclusive, 0, 0.0, 1.0));

        state.occupy(RequestKind::Read, OwnerId::new(1));
        assert!(scheduler.admits_immediately(&queue, &state, RequestKind::Read, 0, 0.0, 1.0));
        assert!(!scheduler.admits_immediately(&queue, &state, RequestKind::Write, 0, 0.0, 1.0));

        queue.push(waiter(0, RequestKind::Write, 0));
        // 公平模式：排队写者阻止新读者
        assert!(!scheduler.admits_immediately(&queue, &state, RequestKind::Read, 1, 0.0, 1.0));

        let unfair = Scheduler::new(SchedulingStrategy::Fifo, false);
        assert!(unfair.admits_immediately(&queue, &state, RequestKind::Read, 1, 0.0, 1.0));
    }
}
