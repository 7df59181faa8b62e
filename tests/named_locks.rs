//! Reference counting and exclusion of named locks across threads and tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use cachegraph::cache::NamedLockRegistry;
use cachegraph::error::{CacheError, UsageError};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn concurrent_requests_leave_no_record_behind() {
    let registry = NamedLockRegistry::new();
    let threads: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    registry.get_lock("hot").dispose().expect("dispose");
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().expect("worker");
    }

    assert!(registry.is_empty());
    assert_eq!(registry.reference_count("hot"), None);
}

#[test]
fn counts_track_outstanding_handles() {
    let registry = NamedLockRegistry::new();
    let mut handles: Vec<_> = (0..5).map(|_| registry.get_lock("k")).collect();
    assert_eq!(registry.reference_count("k"), Some(5));

    for handle in handles.drain(..3) {
        handle.dispose().expect("dispose");
    }
    assert_eq!(registry.reference_count("k"), Some(2));

    handles.push(registry.get_lock("k"));
    assert_eq!(registry.reference_count("k"), Some(3));

    for handle in handles {
        handle.dispose().expect("dispose");
    }
    assert!(registry.is_empty());
}

#[test]
fn release_is_idempotent_and_harmless() {
    let registry = NamedLockRegistry::new();
    let cancel = CancellationToken::new();
    let mut idle = registry.get_lock("k");
    let mut worker = registry.get_lock("k");

    idle.release();
    idle.release();

    assert!(worker.acquire(WAIT, &cancel).expect("acquire"));
    worker.release();
    worker.release();
    assert!(idle.acquire(WAIT, &cancel).expect("reacquire"));
    idle.release();

    idle.dispose().expect("dispose idle");
    worker.dispose().expect("dispose worker");
}

#[test]
fn misuse_is_reported_as_usage_errors() {
    let registry = NamedLockRegistry::new();
    let cancel = CancellationToken::new();
    let mut handle = registry.get_lock("k");
    assert!(handle.acquire(WAIT, &cancel).expect("acquire"));

    let err = handle.acquire(WAIT, &cancel).expect_err("double acquire");
    assert!(matches!(err, CacheError::Usage(UsageError::AlreadyHeld { .. })));

    let err = handle.dispose().expect_err("dispose while held");
    assert!(matches!(err, CacheError::Usage(UsageError::DisposedWhileHeld { .. })));

    // The misuse still returned the lock and the reference.
    assert!(registry.is_empty());
    let mut next = registry.get_lock("k");
    assert!(next.acquire(Duration::ZERO, &cancel).expect("free again"));
    next.release();
    next.dispose().expect("dispose");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_holders_are_mutually_exclusive() {
    let registry = NamedLockRegistry::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    let mut handle = registry.get_lock("shared");
                    assert!(handle.acquire_async(WAIT, &cancel).await.expect("acquire"));
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    handle.release_async().await;
                    handle.dispose().expect("dispose");
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn cancelled_waiters_leave_the_lock_usable() {
    let registry = NamedLockRegistry::new();
    let cancel = CancellationToken::new();
    let mut holder = registry.get_lock("k");
    assert!(holder.acquire_async(WAIT, &cancel).await.expect("acquire"));

    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let registry = registry.clone();
        let waiter_cancel = waiter_cancel.clone();
        tokio::spawn(async move {
            let mut handle = registry.get_lock("k");
            let acquired = handle
                .acquire_async(WAIT, &waiter_cancel)
                .await
                .expect("acquire");
            handle.dispose().expect("dispose");
            acquired
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    waiter_cancel.cancel();
    assert!(!waiter.await.expect("waiter"));

    holder.release_async().await;
    let mut next = registry.get_lock("k");
    assert!(next.acquire_async(Duration::ZERO, &cancel).await.expect("free"));
    next.release();

    holder.dispose().expect("dispose holder");
    next.dispose().expect("dispose next");
    assert!(registry.is_empty());
}
