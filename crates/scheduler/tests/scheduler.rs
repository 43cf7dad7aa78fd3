use std::collections::BTreeSet;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use fleetload_scheduler::{
    CancellationToken, Completion, DelayScheduler, Outcome, SchedulerConfig, SchedulerError,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};

fn config() -> SchedulerConfig {
    SchedulerConfig {
        worker_keep_alive: Duration::from_secs(1),
    }
}

fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(
    log: &Arc<Mutex<Vec<&'static str>>>,
    label: &'static str,
) -> impl FnOnce(CancellationToken) -> Ready<anyhow::Result<&'static str>> + Send + 'static {
    let log = log.clone();
    move |_| {
        log.lock().push(label);
        ready(Ok(label))
    }
}

async fn drain<T: Send + 'static>(scheduler: &DelayScheduler<T>, n: usize) -> Vec<Completion<T>> {
    let mut completions = Vec::with_capacity(n);
    for _ in 0..n {
        completions.push(scheduler.take_next_completed().await.unwrap());
    }
    completions
}

#[tokio::test(start_paused = true)]
async fn dispatch_follows_trigger_then_sequence() {
    let scheduler = DelayScheduler::new(config());
    let log = recorder();

    scheduler
        .schedule(record(&log, "A"), Duration::from_millis(100))
        .unwrap();
    scheduler
        .schedule(record(&log, "B"), Duration::from_millis(50))
        .unwrap();
    scheduler
        .schedule(record(&log, "C"), Duration::from_millis(100))
        .unwrap();

    let completions = drain(&scheduler, 3).await;
    assert!(completions.iter().all(Completion::is_success));
    assert_eq!(*log.lock(), vec!["B", "A", "C"]);
}

#[tokio::test(start_paused = true)]
async fn items_do_not_fire_before_their_offset() {
    let scheduler = DelayScheduler::new(config());
    let origin = Instant::now();
    for delay in [300u64, 0, 120, 40] {
        scheduler
            .schedule(
                move |_| async move { Ok(Instant::now()) },
                Duration::from_millis(delay),
            )
            .unwrap();
    }

    let mut fired: Vec<(u64, u64)> = drain(&scheduler, 4)
        .await
        .into_iter()
        .map(|c| {
            let started = match c.outcome {
                Outcome::Completed(at) => at,
                other => panic!("unexpected outcome {other:?}"),
            };
            assert!(started >= c.scheduled_for);
            (c.seq, (started - origin).as_millis() as u64)
        })
        .collect();
    fired.sort();
    assert_eq!(fired, vec![(0, 300), (1, 0), (2, 120), (3, 40)]);
}

#[tokio::test(start_paused = true)]
async fn each_item_completes_exactly_once() {
    let scheduler = DelayScheduler::new(config());
    for i in 0..5u64 {
        scheduler
            .schedule(
                move |_| async move {
                    sleep(Duration::from_millis(50 * (5 - i))).await;
                    Ok(i)
                },
                Duration::from_millis(10 * i),
            )
            .unwrap();
    }

    let seqs: BTreeSet<u64> = drain(&scheduler, 5).await.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (0..5).collect::<BTreeSet<u64>>());

    let extra = timeout(Duration::from_secs(5), scheduler.take_next_completed()).await;
    assert!(extra.is_err(), "a sixth completion must block");
    assert!(scheduler.try_take_completed().is_none());
}

#[tokio::test(start_paused = true)]
async fn failures_and_panics_become_failed_completions() {
    let scheduler: DelayScheduler<()> = DelayScheduler::new(config());
    scheduler
        .schedule(|_| async { Err(anyhow!("target refused")) }, Duration::ZERO)
        .unwrap();
    scheduler
        .schedule(
            |_| async {
                if true {
                    panic!("driver blew up");
                }
                Ok(())
            },
            Duration::from_millis(5),
        )
        .unwrap();

    let completions = drain(&scheduler, 2).await;
    let messages: Vec<String> = completions
        .iter()
        .map(|c| c.error().map(|e| e.to_string()).unwrap_or_default())
        .collect();
    assert!(messages.contains(&"target refused".to_string()));
    assert!(messages
        .iter()
        .any(|m| m.contains("panicked") && m.contains("driver blew up")));
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_rejects_new_work_but_runs_queued_items() {
    let scheduler = DelayScheduler::new(config());
    let log = recorder();
    scheduler
        .schedule(record(&log, "queued"), Duration::from_millis(20))
        .unwrap();
    scheduler.shutdown();
    assert!(scheduler.is_shutdown());

    let rejected = scheduler.schedule(record(&log, "late"), Duration::ZERO);
    assert_eq!(rejected.unwrap_err(), SchedulerError::Shutdown);

    let completion = scheduler.take_next_completed().await.unwrap();
    assert!(completion.is_success());
    assert!(scheduler.await_termination(Duration::from_secs(1)).await);
    assert_eq!(*log.lock(), vec!["queued"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_now_interrupts_running_and_discards_queued() {
    let scheduler = DelayScheduler::new(config());
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));

    {
        let started = started.clone();
        let finished = finished.clone();
        scheduler
            .schedule(
                move |token: CancellationToken| async move {
                    started.notify_one();
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(Duration::from_secs(30)) => {
                            finished.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Ok(())
                },
                Duration::ZERO,
            )
            .unwrap();
    }
    for _ in 0..2 {
        let finished = finished.clone();
        scheduler
            .schedule(
                move |_| async move {
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_secs(10),
            )
            .unwrap();
    }

    started.notified().await;
    assert_eq!(scheduler.metrics().queued, 2);
    assert_eq!(scheduler.shutdown_now(), 2);

    let completion = scheduler.take_next_completed().await.unwrap();
    assert!(completion.is_cancelled());
    assert!(scheduler.await_termination(Duration::from_secs(1)).await);
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert!(scheduler.try_take_completed().is_none());
    assert!(matches!(
        scheduler.schedule(|_| async { Ok(()) }, Duration::ZERO),
        Err(SchedulerError::Shutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn await_termination_times_out_while_running() {
    let scheduler: DelayScheduler<()> = DelayScheduler::new(config());
    assert!(!scheduler.await_termination(Duration::from_millis(100)).await);
}

#[tokio::test(start_paused = true)]
async fn pool_grows_on_demand_and_reclaims_idle_workers() {
    let scheduler = DelayScheduler::new(config());
    for _ in 0..3 {
        scheduler
            .schedule(
                |_| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok(())
                },
                Duration::ZERO,
            )
            .unwrap();
    }

    sleep(Duration::from_millis(10)).await;
    let busy = scheduler.metrics();
    assert_eq!(busy.active_workers, 3);
    assert_eq!(busy.pool_size, 3);
    assert_eq!(busy.peak_pool_size, 3);

    drain(&scheduler, 3).await;
    scheduler
        .schedule(|_| async { Ok(()) }, Duration::ZERO)
        .unwrap();
    drain(&scheduler, 1).await;
    assert_eq!(scheduler.metrics().peak_pool_size, 3);

    sleep(Duration::from_secs(2)).await;
    let idle = scheduler.metrics();
    assert_eq!(idle.active_workers, 0);
    assert_eq!(idle.pool_size, 0);
    assert_eq!(idle.peak_pool_size, 3);
}

#[tokio::test(start_paused = true)]
async fn done_hook_sees_every_completion() {
    let seen = Arc::new(AtomicUsize::new(0));
    let hook_seen = seen.clone();
    let scheduler = DelayScheduler::with_done_hook(
        config(),
        Arc::new(move |completion: &Completion<u32>| {
            assert!(completion.finished_at >= completion.started_at);
            hook_seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    for i in 0..4u32 {
        scheduler
            .schedule(move |_| async move { Ok(i) }, Duration::from_millis(u64::from(i)))
            .unwrap();
    }
    drain(&scheduler, 4).await;
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}
