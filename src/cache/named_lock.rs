//! Reference-counted named locks.
//!
//! Callers that are about to recompute the value for a cache key ask the
//! registry for a lock with the same name, so only one of them does the
//! work. Records exist only while at least one handle references them.
//!
//! Reference counts change only while the registry shard holding the record
//! is write-locked (`DashMap::entry`). An increment therefore either finds
//! the live record or creates a fresh one; it can never revive a record
//! that a concurrent dispose is deleting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::gauge;
use tokio::runtime::{Builder, Handle};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{CacheError, CacheResult, UsageError};

const METRIC_NAMED_LOCKS: &str = "cachegraph_named_locks";

/// Single-permit semaphore shared by blocking and async waiters.
///
/// A holder's permit is forgotten on acquire and added back on release, so
/// the permit count never exceeds one.
#[derive(Debug)]
struct KeySemaphore {
    permits: Semaphore,
}

impl KeySemaphore {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    fn try_take(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn give(&self) {
        self.permits.add_permits(1);
    }

    async fn take(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        if self.try_take() {
            return true;
        }

        tokio::select! {
            biased;
            acquired = self.permits.acquire() => match acquired {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    /// Waits on the ambient runtime when there is one (for example inside
    /// `spawn_blocking`), otherwise on a private current-thread runtime.
    fn take_blocking(&self, timeout: Duration, cancel: &CancellationToken) -> CacheResult<bool> {
        if self.try_take() {
            return Ok(true);
        }
        if timeout.is_zero() || cancel.is_cancelled() {
            return Ok(false);
        }

        match Handle::try_current() {
            Ok(handle) => Ok(handle.block_on(self.take(timeout, cancel))),
            Err(_) => {
                let runtime = Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(|err| {
                        CacheError::store(format!("named lock wait runtime unavailable: {err}"))
                    })?;
                Ok(runtime.block_on(self.take(timeout, cancel)))
            }
        }
    }
}

#[derive(Debug)]
struct LockRecord {
    key: String,
    /// Only mutated while the owning registry shard is write-locked.
    references: AtomicUsize,
    semaphore: KeySemaphore,
}

impl LockRecord {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            references: AtomicUsize::new(1),
            semaphore: KeySemaphore::new(),
        }
    }
}

type RecordMap = DashMap<String, Arc<LockRecord>>;

/// Process-scoped table of named locks.
///
/// Constructed explicitly and shared by cloning; clones refer to the same
/// table.
#[derive(Debug, Clone, Default)]
pub struct NamedLockRegistry {
    records: Arc<RecordMap>,
}

impl NamedLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle for `key` without waiting for anything.
    pub fn get_lock(&self, key: &str) -> LockHandle {
        let record = match self.records.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let record = occupied.get();
                record.references.fetch_add(1, Ordering::AcqRel);
                Arc::clone(record)
            }
            Entry::Vacant(vacant) => {
                let record = Arc::new(LockRecord::new(key));
                vacant.insert(Arc::clone(&record));
                gauge!(METRIC_NAMED_LOCKS).increment(1.0);
                record
            }
        };

        trace!(key, "Named lock handle issued");
        LockHandle {
            record,
            records: Arc::clone(&self.records),
            held: false,
            disposed: false,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Outstanding handles for `key`, or `None` when no record exists.
    pub fn reference_count(&self, key: &str) -> Option<usize> {
        self.records
            .get(key)
            .map(|record| record.references.load(Ordering::Acquire))
    }

    fn remove_reference(records: &RecordMap, record: &Arc<LockRecord>) -> CacheResult<()> {
        match records.entry(record.key.clone()) {
            Entry::Occupied(occupied) => {
                if !Arc::ptr_eq(occupied.get(), record) {
                    return Err(CacheError::consistency(format!(
                        "lock record for `{}` was replaced while still referenced",
                        record.key
                    )));
                }

                let previous = record.references.load(Ordering::Acquire);
                if previous == 0 {
                    return Err(CacheError::consistency(format!(
                        "lock record for `{}` has no references left to release",
                        record.key
                    )));
                }
                record.references.store(previous - 1, Ordering::Release);

                if previous == 1 {
                    let (_, removed) = occupied.remove_entry();
                    if !Arc::ptr_eq(&removed, record) {
                        return Err(CacheError::consistency(format!(
                            "removed lock record for `{}` is not the one released",
                            record.key
                        )));
                    }
                    gauge!(METRIC_NAMED_LOCKS).decrement(1.0);
                    trace!(key = %record.key, "Named lock record discarded");
                }
                Ok(())
            }
            Entry::Vacant(_) => Err(CacheError::consistency(format!(
                "lock record for `{}` vanished while still referenced",
                record.key
            ))),
        }
    }
}

/// One caller's claim on a named lock.
///
/// Acquire, release, then dispose. Dropping a handle disposes it; dropping
/// one that is still held releases it and logs the misuse at `error`.
#[derive(Debug)]
pub struct LockHandle {
    record: Arc<LockRecord>,
    records: Arc<RecordMap>,
    held: bool,
    disposed: bool,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.record.key
    }

    /// True while this handle owns the lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Block the current thread until the lock is obtained, `timeout`
    /// elapses, or `cancel` fires. Returns whether the lock was obtained.
    ///
    /// Must not be called from async code when the lock may be contended;
    /// use [`acquire_async`](Self::acquire_async) there.
    pub fn acquire(&mut self, timeout: Duration, cancel: &CancellationToken) -> CacheResult<bool> {
        self.ensure_not_held()?;
        let acquired = self.record.semaphore.take_blocking(timeout, cancel)?;
        self.finish_acquire(acquired);
        Ok(acquired)
    }

    /// Async counterpart of [`acquire`](Self::acquire).
    pub async fn acquire_async(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        self.ensure_not_held()?;
        let acquired = self.record.semaphore.take(timeout, cancel).await;
        self.finish_acquire(acquired);
        Ok(acquired)
    }

    /// Release the lock if this handle holds it; otherwise do nothing.
    pub fn release(&mut self) {
        if self.held {
            self.held = false;
            self.record.semaphore.give();
            trace!(key = %self.record.key, "Named lock released");
        }
    }

    /// Async counterpart of [`release`](Self::release). Never suspends.
    pub async fn release_async(&mut self) {
        self.release();
    }

    /// Give the handle's reference back to the registry.
    ///
    /// Disposing a held handle still releases the lock and the reference,
    /// then reports [`UsageError::DisposedWhileHeld`].
    pub fn dispose(mut self) -> CacheResult<()> {
        self.dispose_inner()
    }

    fn ensure_not_held(&self) -> CacheResult<()> {
        if self.held {
            return Err(UsageError::AlreadyHeld {
                key: self.record.key.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn finish_acquire(&mut self, acquired: bool) {
        self.held = acquired;
        if acquired {
            trace!(key = %self.record.key, "Named lock acquired");
        } else {
            debug!(key = %self.record.key, "Named lock not acquired before timeout or cancellation");
        }
    }

    fn dispose_inner(&mut self) -> CacheResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let was_held = self.held;
        self.release();
        NamedLockRegistry::remove_reference(&self.records, &self.record)?;

        if was_held {
            return Err(UsageError::DisposedWhileHeld {
                key: self.record.key.clone(),
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(err) = self.dispose_inner() {
            error!(key = %self.record.key, error = %err, "Named lock handle dropped improperly");
        }
    }
}
