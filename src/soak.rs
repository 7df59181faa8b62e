//! Concurrent soak run over one backend and one lock registry.
//!
//! Workers issue a deterministic pseudo-random mix of writes, reads,
//! removals, invalidations and lock-guarded recomputations. Once they finish
//! the run checks that the dependency index agrees with the store and that
//! every named lock was returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheStore, CachingBackend, ItemOptions, NamedLockRegistry};
use crate::config::SoakArgs;
use crate::error::{CacheError, CacheResult};

/// Shape of a soak run.
#[derive(Debug, Clone)]
pub struct SoakPlan {
    pub workers: usize,
    pub keys: usize,
    pub tokens: usize,
    pub rounds: usize,
    pub lock_timeout: Duration,
}

impl From<&SoakArgs> for SoakPlan {
    fn from(args: &SoakArgs) -> Self {
        Self {
            workers: args.threads.max(1),
            keys: args.keys.max(1),
            tokens: args.tokens.max(1),
            rounds: args.rounds,
            lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    reads: AtomicU64,
    removals: AtomicU64,
    invalidations: AtomicU64,
    invalidated_keys: AtomicU64,
    lock_acquired: AtomicU64,
    lock_timeouts: AtomicU64,
}

/// Totals of one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoakReport {
    pub writes: u64,
    pub reads: u64,
    pub removals: u64,
    pub invalidations: u64,
    pub invalidated_keys: u64,
    pub lock_acquired: u64,
    pub lock_timeouts: u64,
    pub elapsed: Duration,
}

impl SoakReport {
    pub fn operations(&self) -> u64 {
        self.writes + self.reads + self.removals + self.invalidations + self.lock_acquired
            + self.lock_timeouts
    }
}

struct Worker<S: CacheStore> {
    id: usize,
    plan: SoakPlan,
    backend: CachingBackend<S>,
    locks: NamedLockRegistry,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    state: u64,
}

impl<S: CacheStore> Worker<S> {
    fn next(&mut self) -> u64 {
        // splitmix64
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn pick(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }

    fn key(&mut self) -> String {
        format!("item-{}", self.pick(self.plan.keys))
    }

    fn token(&mut self) -> String {
        format!("token-{}", self.pick(self.plan.tokens))
    }

    fn options(&mut self) -> ItemOptions {
        let count = self.pick(3);
        let tokens: Vec<String> = (0..count).map(|_| self.token()).collect();
        let options = ItemOptions::new().depends_on(tokens);
        if self.pick(16) == 0 {
            options.absolute_expiration(Duration::from_millis(1))
        } else {
            options
        }
    }

    fn write(&mut self, key: &str) -> CacheResult<()> {
        let options = self.options();
        let value = Bytes::from(format!("{}:{}", self.id, self.state));
        self.backend.set_item(key, value, options)
    }

    /// One step that does not involve a named lock.
    fn step(&mut self, roll: usize, key: &str) -> CacheResult<()> {
        match roll {
            0..=3 => {
                self.write(key)?;
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            4 | 5 => {
                self.backend.get_item(key)?;
                self.counters.reads.fetch_add(1, Ordering::Relaxed);
            }
            6 => {
                self.backend.remove_item(key)?;
                self.counters.removals.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                let token = self.token();
                let removed = self.backend.invalidate_dependency(&token)?;
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .invalidated_keys
                    .fetch_add(removed.len() as u64, Ordering::Relaxed);
                if self.pick(32) == 0 {
                    self.backend.purge_expired()?;
                }
            }
        }
        Ok(())
    }

    fn recompute_if_missing(&mut self, key: &str, acquired: bool) -> CacheResult<()> {
        if acquired {
            self.counters.lock_acquired.fetch_add(1, Ordering::Relaxed);
            if !self.backend.contains_item(key)? {
                self.write(key)?;
            }
        } else {
            self.counters.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn run_blocking(mut self) -> CacheResult<()> {
        for _ in 0..self.plan.rounds {
            let roll = self.pick(10);
            let key = self.key();
            if roll < 9 {
                self.step(roll, &key)?;
                continue;
            }
            let mut handle = self.locks.get_lock(&key);
            let acquired = handle.acquire(self.plan.lock_timeout, &self.cancel)?;
            let outcome = self.recompute_if_missing(&key, acquired);
            handle.release();
            handle.dispose()?;
            outcome?;
        }
        debug!(worker = self.id, mode = "blocking", "Soak worker finished");
        Ok(())
    }

    async fn run_async(mut self) -> CacheResult<()> {
        for _ in 0..self.plan.rounds {
            let roll = self.pick(10);
            let key = self.key();
            if roll < 9 {
                self.step(roll, &key)?;
                if roll == 0 {
                    tokio::task::yield_now().await;
                }
                continue;
            }
            let mut handle = self.locks.get_lock(&key);
            let acquired = handle
                .acquire_async(self.plan.lock_timeout, &self.cancel)
                .await?;
            let outcome = self.recompute_if_missing(&key, acquired);
            handle.release_async().await;
            handle.dispose()?;
            outcome?;
        }
        debug!(worker = self.id, mode = "async", "Soak worker finished");
        Ok(())
    }
}

/// Run `plan` to completion and verify the engine's invariants.
///
/// Even-numbered workers use blocking lock acquisition on the blocking pool;
/// odd-numbered workers acquire asynchronously.
pub async fn run<S: CacheStore>(
    backend: &CachingBackend<S>,
    locks: &NamedLockRegistry,
    plan: &SoakPlan,
) -> CacheResult<SoakReport> {
    let started = Instant::now();
    let counters = Arc::new(Counters::default());
    let cancel = CancellationToken::new();

    info!(
        workers = plan.workers,
        keys = plan.keys,
        tokens = plan.tokens,
        rounds = plan.rounds,
        "Soak run starting"
    );

    let mut workers = JoinSet::new();
    for id in 0..plan.workers {
        let worker = Worker {
            id,
            plan: plan.clone(),
            backend: backend.clone(),
            locks: locks.clone(),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            state: id as u64 + 1,
        };
        if id % 2 == 0 {
            workers.spawn_blocking(move || worker.run_blocking());
        } else {
            workers.spawn(worker.run_async());
        }
    }

    let mut failure = None;
    while let Some(joined) = workers.join_next().await {
        let outcome = joined
            .map_err(|err| CacheError::consistency(format!("soak worker did not finish: {err}")))
            .and_then(|result| result);
        if let Err(err) = outcome {
            cancel.cancel();
            if failure.is_none() {
                failure = Some(err);
            }
        }
    }
    if let Some(err) = failure {
        return Err(err);
    }

    backend.check_consistency()?;
    if !locks.is_empty() {
        return Err(CacheError::consistency(format!(
            "{} named lock records outlived their handles",
            locks.len()
        )));
    }

    let report = SoakReport {
        writes: counters.writes.load(Ordering::Relaxed),
        reads: counters.reads.load(Ordering::Relaxed),
        removals: counters.removals.load(Ordering::Relaxed),
        invalidations: counters.invalidations.load(Ordering::Relaxed),
        invalidated_keys: counters.invalidated_keys.load(Ordering::Relaxed),
        lock_acquired: counters.lock_acquired.load(Ordering::Relaxed),
        lock_timeouts: counters.lock_timeouts.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    };
    info!(
        operations = report.operations(),
        invalidated_keys = report.invalidated_keys,
        lock_timeouts = report.lock_timeouts,
        entries = backend.len(),
        tokens = backend.dependency_count(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Soak run passed"
    );
    Ok(report)
}
