use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::queue::ScheduledItem;

/// Eventually consistent snapshot of the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub active_workers: usize,
    pub pool_size: usize,
    pub peak_pool_size: usize,
    pub queued: usize,
}

/// Unbounded worker pool bookkeeping. Idle workers park a oneshot sender
/// here; handing off an item means sending it through one of them.
pub(crate) struct WorkerPool<T> {
    idle: Mutex<Vec<oneshot::Sender<ScheduledItem<T>>>>,
    size: AtomicUsize,
    peak: AtomicUsize,
    active: AtomicUsize,
}

impl<T> WorkerPool<T> {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Give `item` to an idle worker. Hands the item back when none is
    /// available so the caller can start a new worker.
    pub fn offer(&self, mut item: ScheduledItem<T>) -> Option<ScheduledItem<T>> {
        loop {
            let slot = self.idle.lock().pop();
            match slot {
                Some(slot) => match slot.send(item) {
                    Ok(()) => return None,
                    // That worker retired in the meantime.
                    Err(returned) => item = returned,
                },
                None => return Some(item),
            }
        }
    }

    pub fn park(&self, slot: oneshot::Sender<ScheduledItem<T>>) {
        let mut idle = self.idle.lock();
        idle.retain(|parked| !parked.is_closed());
        idle.push(slot);
    }

    /// Drop every parked slot; the owning workers wake up and retire.
    pub fn release_idle(&self) {
        self.idle.lock().clear();
    }

    pub fn worker_started(&self) -> usize {
        let size = self.size.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(size, Ordering::SeqCst);
        size
    }

    pub fn worker_retired(&self) -> usize {
        self.size.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn run_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn run_finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn metrics(&self, queued: usize) -> PoolMetrics {
        PoolMetrics {
            active_workers: self.active.load(Ordering::SeqCst),
            pool_size: self.size.load(Ordering::SeqCst),
            peak_pool_size: self.peak.load(Ordering::SeqCst),
            queued,
        }
    }
}
