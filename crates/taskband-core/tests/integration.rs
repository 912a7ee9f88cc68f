//! Integration tests for the taskband-core crate.
//!
//! These tests exercise the single-queue executor, the banded group, the
//! run-once registry, and the named-lock registry as integrated subsystems.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use taskband_core::{
    ExecError, Executor, ExecutorConfig, ExecutorGroup, HIGH_PRIORITY, LOW_PRIORITY,
    NORMAL_PRIORITY, NamedLockRegistry, TaskHandle, TaskStatus,
};

// ═══════════════════════════════════════════════════════════════════════
//  Ordering and dispatch
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn actions_run_in_submission_order_within_a_band() {
    let group = ExecutorGroup::create("fifo", false);
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["A", "B", "C"] {
        let order = Arc::clone(&order);
        group
            .create_action(
                move || async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                },
                NORMAL_PRIORITY,
            )
            .expect("group is running")
            .submit();
    }

    group.wait_for_all().await;
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    assert!(group.shut_down(true).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn high_band_runs_ahead_of_a_busy_low_band() {
    let group = ExecutorGroup::create("bands", false);
    let low_done = Arc::new(Mutex::new(None::<Instant>));
    let high_done = Arc::new(Mutex::new(None::<Instant>));

    let done = Arc::clone(&low_done);
    group
        .create_action(
            move || async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                *done.lock().unwrap() = Some(Instant::now());
                Ok(())
            },
            LOW_PRIORITY,
        )
        .unwrap()
        .submit();

    let done = Arc::clone(&high_done);
    group
        .create_action(
            move || async move {
                *done.lock().unwrap() = Some(Instant::now());
                Ok(())
            },
            HIGH_PRIORITY,
        )
        .unwrap()
        .submit();

    group.wait_for_all().await;

    let high = high_done.lock().unwrap().expect("high task ran");
    let low = low_done.lock().unwrap().expect("low task ran");
    assert!(high < low, "the high band must not wait for the low band");
    assert!(group.shut_down(true).await);
}

#[tokio::test]
async fn mode_change_while_queued_takes_effect() {
    let executor = Executor::new(ExecutorConfig::new("modes"));
    let task = executor.create_action(|| async { Ok(()) }).submit();
    task.set_async();

    executor.start();
    executor.wait_for_all().await;
    assert_eq!(executor.executed_async(), 1);
    assert_eq!(executor.executed_sync(), 0);
    assert!(executor.shut_down(true).await);
}

// ═══════════════════════════════════════════════════════════════════════
//  Run-once de-duplication
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_once_collapses_duplicate_submissions() {
    let group = ExecutorGroup::create("dedup", false);
    let counter = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..1000 {
        let body_counter = Arc::clone(&counter);
        let seen_counter = Arc::clone(&counter);
        let task = group
            .create_action(
                move || async move {
                    body_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                NORMAL_PRIORITY,
            )
            .unwrap();
        task.run_only_once("dedup:op#1", move || {
            seen_counter.load(Ordering::SeqCst) > 0
        });
        handles.push(task.submit());
    }

    group.wait_for_all().await;
    for handle in &handles {
        handle.join().await.expect("join canonical");
        assert!(handle.finished());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(group.shut_down(true).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_once_failure_frees_the_identity() {
    let executor = Executor::create(ExecutorConfig::new("retry"));

    let failing = executor.create_action(|| async { Err("flaky backend".to_string()) });
    failing.run_only_once("retry:op", || false);
    let failing = failing.submit();
    failing.join().await.expect("action join never errors");
    assert!(failing.ended_with_errors());
    assert_eq!(failing.error().as_deref(), Some("flaky backend"));

    // The identity is fresh again; a new submission runs.
    let counter = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&counter);
    let retry = executor.create_action(move || async move {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    retry.run_only_once("retry:op", || false);
    let retry = retry.submit();
    retry.join().await.expect("join retry");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!retry.ended_with_errors());
    assert!(executor.shut_down(true).await);
}

// ═══════════════════════════════════════════════════════════════════════
//  Producers
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn producer_returns_its_value() {
    let group = ExecutorGroup::create("produce", false);

    let task = group
        .create_producer(|| async { Ok(42) }, HIGH_PRIORITY)
        .unwrap()
        .submit();

    assert_eq!(task.join().await.expect("producer join"), 42);
    assert!(task.finished());
    assert!(task.error().is_none());

    // The result is stable across repeated reads and extra waiters.
    assert_eq!(task.result(), Some(42));
    assert_eq!(task.result(), Some(42));
    assert_eq!(task.join().await.expect("second join"), 42);
    assert!(group.shut_down(true).await);
}

#[tokio::test]
async fn failed_producer_surfaces_on_join() {
    let executor = Executor::create(ExecutorConfig::new("fail"));

    let task = executor
        .create_producer::<_, _, u32>(|| async { Err("backend offline".to_string()) })
        .submit();

    match task.join().await {
        Err(ExecError::TaskFailed { reason, .. }) => assert_eq!(reason, "backend offline"),
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert!(task.ended_with_errors());
    assert_eq!(task.result(), None);
    assert!(executor.shut_down(true).await);
}

// ═══════════════════════════════════════════════════════════════════════
//  Suspension
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspend_immediate_pauses_between_tasks() {
    let executor = Executor::create(ExecutorConfig::new("suspend"));
    let sequence = Arc::new(Mutex::new(Vec::new()));

    let seq = Arc::clone(&sequence);
    executor
        .create_action(move || async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            seq.lock().unwrap().push("1");
            Ok(())
        })
        .submit();

    // Let the first task start before queueing the second and suspending.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seq = Arc::clone(&sequence);
    executor
        .create_action(move || async move {
            seq.lock().unwrap().push("2");
            Ok(())
        })
        .submit();

    executor.suspend_immediate().await;
    assert_eq!(*sequence.lock().unwrap(), vec!["1"]);
    assert!(executor.is_suspended());

    executor.resume();
    executor.wait_for_all().await;
    assert_eq!(*sequence.lock().unwrap(), vec!["1", "2"]);
    assert!(executor.shut_down(true).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn suspend_waits_for_async_in_flight_tasks() {
    let executor = Executor::create(ExecutorConfig::new("inflight"));
    let done = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&done);
    executor
        .create_action(move || async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .set_async()
        .submit();

    // Give the worker a moment to dispatch the async context.
    tokio::time::sleep(Duration::from_millis(20)).await;
    executor.suspend_immediate().await;
    assert!(done.load(Ordering::SeqCst));

    executor.resume();
    assert!(executor.shut_down(true).await);
}

// ═══════════════════════════════════════════════════════════════════════
//  Waiting and priority inheritance
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn wait_for_raises_only_tasks_ahead_of_the_target() {
    let executor = Executor::new(ExecutorConfig::new("inherit"));
    let first = executor.create_action(|| async { Ok(()) }).submit();
    let second = executor.create_action(|| async { Ok(()) }).submit();
    let target = executor.create_action(|| async { Ok(()) }).submit();

    let waiter = {
        let executor = executor.clone();
        let target = target.clone();
        tokio::spawn(async move { executor.wait_for_at(&target, 9).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first.priority(), 9);
    assert_eq!(second.priority(), 9);
    assert_eq!(target.priority(), NORMAL_PRIORITY);

    executor.start();
    waiter.await.expect("waiter completes");
    assert!(executor.shut_down(true).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_wait_observes_every_band() {
    let group = ExecutorGroup::create("sweep", false);
    let counter = Arc::new(AtomicU32::new(0));

    for priority in [0, 3, NORMAL_PRIORITY, 7, HIGH_PRIORITY, 12] {
        let c = Arc::clone(&counter);
        group
            .create_action(
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                priority,
            )
            .unwrap()
            .submit();
    }

    group.wait_for_all_at(HIGH_PRIORITY).await;
    assert_eq!(counter.load(Ordering::SeqCst), 6);
    assert!(group.shut_down(true).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joining_your_own_task_is_refused() {
    let executor = Executor::create(ExecutorConfig::new("selfjoin"));
    let slot: Arc<OnceLock<TaskHandle>> = Arc::new(OnceLock::new());
    let observed = Arc::new(Mutex::new(None));

    let handle_slot = Arc::clone(&slot);
    let seen = Arc::clone(&observed);
    let task = executor.create_action(move || async move {
        let me = handle_slot.get().expect("handle registered").clone();
        if let Err(err) = me.join().await {
            *seen.lock().unwrap() = Some(err);
        }
        Ok(())
    });
    assert!(slot.set(task.clone()).is_ok());
    task.submit();

    executor.wait_for_all().await;
    let err = observed.lock().unwrap().take().expect("self-join must error");
    assert!(matches!(err, ExecError::JoinFromOwnTask { .. }));
    assert!(executor.shut_down(true).await);
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shut_down_without_wait_discards_queued_tasks() {
    let executor = Executor::create(ExecutorConfig::new("abort"));
    let counter = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let c = Arc::clone(&counter);
        tasks.push(
            executor
                .create_action(move || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .submit(),
        );
    }

    assert!(executor.shut_down(false).await);
    let ran = counter.load(Ordering::SeqCst);
    assert!(ran <= 1, "at most the current task may run, {ran} did");

    // Discarded tasks are finished with a captured error; waiters do not hang.
    for task in &tasks {
        task.join().await.expect("join discarded task");
        assert!(task.finished());
    }
    let clean = tasks.iter().filter(|t| !t.ended_with_errors()).count() as u32;
    assert_eq!(clean, ran);

    // Subsequent submissions are refused and never run.
    let late = executor.create_action(|| async { Ok(()) }).submit();
    assert_eq!(late.status(), TaskStatus::Created);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!late.finished());
    assert_eq!(counter.load(Ordering::SeqCst), ran);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shut_down_with_wait_drains_everything_first() {
    let executor = Executor::create(ExecutorConfig::new("drain"));
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .submit();
    }

    assert!(executor.shut_down(true).await);
    assert_eq!(counter.load(Ordering::SeqCst), 5);
    assert_eq!(executor.executed_sync(), 5);
    assert!(executor.is_terminated());
}

#[tokio::test]
async fn undestroyable_group_requires_its_key() {
    let (group, key) = ExecutorGroup::undestroyable("locked-group", false);

    assert!(!group.shut_down(true).await);
    assert!(group.band(NORMAL_PRIORITY).is_some());

    assert!(group.shut_down_with(&key, true).await);
    assert!(group.band(NORMAL_PRIORITY).is_none());
    assert!(matches!(
        group.create_action(|| async { Ok(()) }, NORMAL_PRIORITY),
        Err(ExecError::Terminated { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════
//  Named locks
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn named_lock_serializes_tasks_across_bands() {
    let group = ExecutorGroup::create("locked", false);
    let locks = NamedLockRegistry::new();
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    for priority in [LOW_PRIORITY, NORMAL_PRIORITY, HIGH_PRIORITY] {
        let lock = locks.get("resource:shared");
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        group
            .create_action(
                move || async move {
                    let _guard = lock.lock().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                priority,
            )
            .unwrap()
            .submit();
    }

    group.wait_for_all().await;
    assert_eq!(peak.load(Ordering::SeqCst), 1, "critical sections overlapped");
    assert_eq!(locks.len(), 1);
    assert!(group.shut_down(true).await);
}
