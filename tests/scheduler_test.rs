use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep, timeout};

use ma_image_cache::engine::scheduler::Scheduler;
use ma_image_cache::engine::task::{TaskState, TaskUnit};

const WAIT: Duration = Duration::from_secs(5);

/// Completion callback that reports how many units had signaled when it fired.
fn barrier_probe(signaled: Arc<AtomicUsize>, fired: Arc<AtomicUsize>) -> (impl FnOnce() + Send, oneshot::Receiver<usize>) {
    let (tx, rx) = oneshot::channel();
    let on_complete = move || {
        fired.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(signaled.load(Ordering::SeqCst));
    };
    (on_complete, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_barrier_fires_once_after_all_units() {
    for (n, k) in [(5usize, 1usize), (5, 2), (3, 8), (12, 3)] {
        let signaled = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));

        let units = (0..n)
            .map(|i| {
                let signaled = signaled.clone();
                TaskUnit::new(move |_token, done| async move {
                    sleep(Duration::from_millis((i % 3) as u64 * 5)).await;
                    signaled.fetch_add(1, Ordering::SeqCst);
                    done.signal();
                })
            })
            .collect();

        let (on_complete, rx) = barrier_probe(signaled.clone(), fired.clone());
        let batch = Scheduler::run(units, k, on_complete).unwrap();

        let seen = timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(seen, n, "n={} k={}", n, k);
        batch.finished().await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "n={} k={}", n, k);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_more_than_k_in_flight() {
    let k = 3;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let units = (0..20)
        .map(|_| {
            let active = active.clone();
            let peak = peak.clone();
            TaskUnit::new(move |_token, done| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.signal();
            })
        })
        .collect();

    let batch = Scheduler::run(units, k, || {}).unwrap();
    timeout(WAIT, batch.finished()).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= k);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serial_mode_is_strictly_ordered() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let units = (0..5)
        .map(|i| {
            let log = log.clone();
            TaskUnit::new(move |_token, done| async move {
                // Earlier units sleep longer so any overlap would reorder the log.
                sleep(Duration::from_millis((5 - i) as u64 * 4)).await;
                log.lock().push(i);
                done.signal();
            })
        })
        .collect();

    let batch = Scheduler::run_serial(units, || {}).unwrap();
    timeout(WAIT, batch.finished()).await.unwrap();

    assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_empty_batch_completes_immediately() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();

    let batch = Scheduler::run(Vec::new(), 2, move || flag.store(true, Ordering::SeqCst)).unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert!(batch.is_finished());
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    assert!(Scheduler::run(Vec::new(), 0, || {}).is_err());
    assert!(Scheduler::new(0).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_unit_skips_body_but_signals() {
    let release = Arc::new(Notify::new());
    let second_ran = Arc::new(AtomicBool::new(false));

    let gate = release.clone();
    let first = TaskUnit::new(move |_token, done| async move {
        gate.notified().await;
        done.signal();
    });
    let ran = second_ran.clone();
    let second = TaskUnit::from_callback(move |_token, done| {
        ran.store(true, Ordering::SeqCst);
        done.signal();
    });

    let batch = Scheduler::run(vec![first, second], 1, || {}).unwrap();
    batch.units()[1].cancel();
    release.notify_one();

    timeout(WAIT, batch.finished()).await.unwrap();
    assert!(!second_ran.load(Ordering::SeqCst));
    assert_eq!(batch.units()[1].state(), TaskState::Finished);
    assert_eq!(batch.units()[0].state(), TaskState::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_cancel_skips_pending_units() {
    let ran = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    let mut units = Vec::new();
    let gate = release.clone();
    let counter = ran.clone();
    units.push(TaskUnit::new(move |_token, done| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        gate.notified().await;
        done.signal();
    }));
    for _ in 0..4 {
        let counter = ran.clone();
        units.push(TaskUnit::from_callback(move |_token, done| {
            counter.fetch_add(1, Ordering::SeqCst);
            done.signal();
        }));
    }

    let batch = Scheduler::run(units, 1, || {}).unwrap();
    // Wait until the first unit holds the only slot.
    let first = batch.units()[0].clone();
    let mut state = first.subscribe();
    timeout(WAIT, state.wait_for(|s| *s == TaskState::Running))
        .await
        .unwrap()
        .unwrap();

    batch.cancel();
    release.notify_one();

    timeout(WAIT, batch.finished()).await.unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_or_silent_units_still_advance_barrier() {
    let units = vec![
        TaskUnit::new(|_token, _done| async move {
            panic!("task body failed");
        }),
        TaskUnit::from_callback(|_token, done| drop(done)),
        TaskUnit::from_callback(|_token, done| done.signal()),
    ];

    let batch = Scheduler::run(units, 2, || {}).unwrap();
    timeout(WAIT, batch.finished()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slot_is_held_until_completion_signal() {
    let log = Arc::new(Mutex::new(Vec::new()));

    // Hands its completion to a detached task, like a network callback.
    let first_log = log.clone();
    let first = TaskUnit::from_callback(move |_token, done| {
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            first_log.lock().push("first-done");
            done.signal();
        });
    });
    let second_log = log.clone();
    let second = TaskUnit::from_callback(move |_token, done| {
        second_log.lock().push("second-start");
        done.signal();
    });

    let batch = Scheduler::run(vec![first, second], 1, || {}).unwrap();
    timeout(WAIT, batch.finished()).await.unwrap();

    assert_eq!(*log.lock(), vec!["first-done", "second-start"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unit_cancelled_behind_queue_head_signals_promptly() {
    let pool = Scheduler::new(1).unwrap();
    let release = Arc::new(Notify::new());

    let gate = release.clone();
    let busy = pool.submit(TaskUnit::new(move |_token, done| async move {
        gate.notified().await;
        done.signal();
    }));
    let head = pool.submit(TaskUnit::from_callback(|_token, done| done.signal()));
    let tail_ran = Arc::new(AtomicBool::new(false));
    let ran = tail_ran.clone();
    let tail = pool.submit(TaskUnit::from_callback(move |_token, done| {
        ran.store(true, Ordering::SeqCst);
        done.signal();
    }));

    let mut state = busy.subscribe();
    timeout(WAIT, state.wait_for(|s| *s == TaskState::Running))
        .await
        .unwrap()
        .unwrap();

    // The only slot is taken and `head` waits for it; `tail` must not.
    tail.cancel();
    timeout(WAIT, tail.finished()).await.unwrap();
    assert_eq!(head.state(), TaskState::Pending);
    assert!(!tail_ran.load(Ordering::SeqCst));

    release.notify_one();
    timeout(WAIT, head.finished()).await.unwrap();
    timeout(WAIT, busy.finished()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_queued_and_running_units() {
    let pool = Scheduler::new(1).unwrap();

    let running = pool.submit(TaskUnit::new(|token, done| async move {
        token.cancelled().await;
        done.signal();
    }));
    let queued_ran = Arc::new(AtomicBool::new(false));
    let ran = queued_ran.clone();
    let queued = pool.submit(TaskUnit::from_callback(move |_token, done| {
        ran.store(true, Ordering::SeqCst);
        done.signal();
    }));

    let mut state = running.subscribe();
    timeout(WAIT, state.wait_for(|s| *s == TaskState::Running))
        .await
        .unwrap()
        .unwrap();

    pool.shutdown();
    timeout(WAIT, running.finished()).await.unwrap();
    timeout(WAIT, queued.finished()).await.unwrap();

    assert!(queued.is_cancelled());
    assert!(!queued_ran.load(Ordering::SeqCst));

    // Work submitted after shutdown is cancelled, not run.
    let late = pool.submit(TaskUnit::from_callback(|_token, done| done.signal()));
    timeout(WAIT, late.finished()).await.unwrap();
    assert!(late.is_cancelled());
}
