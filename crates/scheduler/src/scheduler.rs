use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::{Completion, Outcome};
use crate::pool::{PoolMetrics, WorkerPool};
use crate::queue::{DelayQueue, Next, RunState, ScheduledItem, Work};
use crate::{SchedulerConfig, SchedulerError};

/// Called on the worker after each item finishes, before its completion is
/// published.
pub type DoneHook<T> = Arc<dyn Fn(&Completion<T>) + Send + Sync>;

/// Receipt for a scheduled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask {
    pub seq: u64,
    pub trigger: Instant,
}

struct Shared<T> {
    queue: Mutex<DelayQueue<T>>,
    wakeup: Notify,
    cancel: CancellationToken,
    pool: WorkerPool<T>,
    completions: mpsc::UnboundedSender<Completion<T>>,
    done_hook: Option<DoneHook<T>>,
    in_flight: AtomicUsize,
    dispatcher_done: AtomicBool,
    terminated: Notify,
    keep_alive: Duration,
}

impl<T> Shared<T> {
    fn is_terminated(&self) -> bool {
        self.queue.lock().state != RunState::Running
            && self.dispatcher_done.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) == 0
    }
}

/// Fires work at a monotonic-clock offset, strictly in (trigger, sequence)
/// order, on an unbounded pool of tokio tasks.
///
/// Every item that reaches a worker produces exactly one [`Completion`],
/// retrieved with [`take_next_completed`](Self::take_next_completed).
pub struct DelayScheduler<T> {
    shared: Arc<Shared<T>>,
    completions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Completion<T>>>,
}

impl<T: Send + 'static> DelayScheduler<T> {
    /// Must be called inside a tokio runtime: the dispatch loop starts
    /// immediately.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_done_hook(config: SchedulerConfig, hook: DoneHook<T>) -> Self {
        Self::build(config, Some(hook))
    }

    fn build(config: SchedulerConfig, done_hook: Option<DoneHook<T>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue: Mutex::new(DelayQueue::new()),
            wakeup: Notify::new(),
            cancel: CancellationToken::new(),
            pool: WorkerPool::new(),
            completions: tx,
            done_hook,
            in_flight: AtomicUsize::new(0),
            dispatcher_done: AtomicBool::new(false),
            terminated: Notify::new(),
            keep_alive: config.worker_keep_alive,
        });
        tokio::spawn(dispatch_loop(shared.clone()));
        Self {
            shared,
            completions: tokio::sync::Mutex::new(rx),
        }
    }

    /// Queue `work` to run `delay` from now. Never blocks; fails fast once
    /// the scheduler is shutting down.
    pub fn schedule<F, Fut>(
        &self,
        work: F,
        delay: Duration,
    ) -> Result<ScheduledTask, SchedulerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let trigger = Instant::now() + delay;
        let work: Work<T> = Box::new(move |token| work(token).boxed());

        let seq = {
            let mut queue = self.shared.queue.lock();
            if queue.state != RunState::Running {
                return Err(SchedulerError::Shutdown);
            }
            queue.push(trigger, work)
        };
        self.shared.wakeup.notify_one();
        debug!(seq, delay_ms = delay.as_millis() as u64, "Scheduled work");
        Ok(ScheduledTask { seq, trigger })
    }

    /// Wait for the next finished item and remove it from the completion
    /// queue. Each completion is returned exactly once.
    pub async fn take_next_completed(&self) -> Result<Completion<T>, SchedulerError> {
        let mut rx = self.completions.lock().await;
        rx.recv().await.ok_or(SchedulerError::Closed)
    }

    pub fn try_take_completed(&self) -> Option<Completion<T>> {
        let mut rx = self.completions.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Stop accepting work; queued and running items still finish.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.state != RunState::Running {
                return;
            }
            queue.state = RunState::ShuttingDown;
        }
        self.shared.wakeup.notify_one();
        info!("Scheduler shutting down");
    }

    /// Stop immediately: discard items not yet dispatched and cancel those
    /// in flight. Returns the number of discarded items.
    pub fn shutdown_now(&self) -> usize {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.state = RunState::Stopped;
            queue.clear()
        };
        self.shared.cancel.cancel();
        self.shared.pool.release_idle();
        self.shared.wakeup.notify_one();
        self.shared.terminated.notify_waiters();
        info!(discarded, "Scheduler stopped");
        discarded
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().state != RunState::Running
    }

    /// Wait until the dispatch loop has exited and no item is in flight.
    /// Returns `false` if that did not happen within `limit`.
    pub async fn await_termination(&self, limit: Duration) -> bool {
        let shared = &self.shared;
        let wait = async {
            loop {
                let notified = shared.terminated.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if shared.is_terminated() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let queued = self.shared.queue.lock().len();
        self.shared.pool.metrics(queued)
    }
}

impl<T> Drop for DelayScheduler<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.pool.release_idle();
    }
}

async fn dispatch_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let next = shared.queue.lock().next(Instant::now());
        let deadline = match next {
            Next::Due(item) => {
                debug!(seq = item.seq, "Dispatching due work");
                shared.in_flight.fetch_add(1, Ordering::SeqCst);
                hand_off(&shared, item);
                continue;
            }
            Next::WaitUntil(at) => Some(at),
            Next::Idle => None,
            Next::Exit => break,
        };

        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.wakeup.notified() => {}
            _ = sleep => {}
        }
    }

    shared.dispatcher_done.store(true, Ordering::SeqCst);
    shared.terminated.notify_waiters();
    debug!("Dispatch loop exited");
}

fn hand_off<T: Send + 'static>(shared: &Arc<Shared<T>>, item: ScheduledItem<T>) {
    if let Some(item) = shared.pool.offer(item) {
        let size = shared.pool.worker_started();
        debug!(pool_size = size, "Starting scheduler worker");
        tokio::spawn(worker_loop(shared.clone(), item));
    }
}

async fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>, first: ScheduledItem<T>) {
    let mut next = Some(first);
    while let Some(item) = next.take() {
        run_item(&shared, item).await;
        next = wait_for_work(&shared).await;
    }
    let remaining = shared.pool.worker_retired();
    debug!(pool_size = remaining, "Scheduler worker retired");
}

async fn wait_for_work<T>(shared: &Shared<T>) -> Option<ScheduledItem<T>> {
    let (slot, mut rx) = oneshot::channel();
    shared.pool.park(slot);

    tokio::select! {
        received = &mut rx => return received.ok(),
        _ = tokio::time::sleep(shared.keep_alive) => {}
        _ = shared.cancel.cancelled() => {}
    }
    // An item may have been handed over just before we gave up.
    rx.close();
    rx.try_recv().ok()
}

async fn run_item<T: Send + 'static>(shared: &Shared<T>, item: ScheduledItem<T>) {
    let ScheduledItem { trigger, seq, work } = item;
    let started_at = Instant::now();
    shared.pool.run_started();

    let token = shared.cancel.child_token();
    let outcome = if token.is_cancelled() {
        Outcome::Cancelled
    } else {
        let child = token.clone();
        let running = AssertUnwindSafe(async move { work(child).await }).catch_unwind();
        tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled,
            result = running => match result {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(err)) => Outcome::Failed(err),
                Err(panic) => Outcome::Failed(anyhow::anyhow!(
                    "scheduled work panicked: {}",
                    panic_message(panic.as_ref())
                )),
            },
        }
    };

    shared.pool.run_finished();
    let completion = Completion {
        seq,
        scheduled_for: trigger,
        started_at,
        finished_at: Instant::now(),
        outcome,
    };
    match completion.error() {
        Some(err) => warn!(seq, "Scheduled work failed: {:#}", err),
        None => debug!(seq, outcome = completion.label(), "Scheduled work finished"),
    }

    if let Some(hook) = &shared.done_hook {
        hook(&completion);
    }
    let _ = shared.completions.send(completion);
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    shared.terminated.notify_waiters();
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
