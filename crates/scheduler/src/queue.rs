use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) type Work<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

pub(crate) struct ScheduledItem<T> {
    pub trigger: Instant,
    pub seq: u64,
    pub work: Work<T>,
}

impl<T> ScheduledItem<T> {
    fn key(&self) -> (Instant, u64) {
        (self.trigger, self.seq)
    }
}

impl<T> PartialEq for ScheduledItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for ScheduledItem<T> {}

impl<T> PartialOrd for ScheduledItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Running,
    /// No new work; queued items still run.
    ShuttingDown,
    Stopped,
}

pub(crate) enum Next<T> {
    Due(ScheduledItem<T>),
    WaitUntil(Instant),
    Idle,
    Exit,
}

/// Min-heap on (trigger, seq) plus the sequence counter and run state, all
/// guarded by one lock so a schedule call cannot race a shutdown.
pub(crate) struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<ScheduledItem<T>>>,
    next_seq: u64,
    pub state: RunState,
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            state: RunState::Running,
        }
    }

    pub fn push(&mut self, trigger: Instant, work: Work<T>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledItem { trigger, seq, work }));
        seq
    }

    pub fn next(&mut self, now: Instant) -> Next<T> {
        let trigger = match self.heap.peek() {
            Some(Reverse(item)) => item.trigger,
            None if self.state == RunState::Running => return Next::Idle,
            None => return Next::Exit,
        };
        if trigger > now {
            return Next::WaitUntil(trigger);
        }
        match self.heap.pop() {
            Some(Reverse(item)) => Next::Due(item),
            None => Next::Idle,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) -> usize {
        let discarded = self.heap.len();
        self.heap.clear();
        discarded
    }
}
