//! Poison-tolerant guards for the std `RwLock`s guarding store shards.
//!
//! A panic while a guard is held must not wedge unrelated keys, so every
//! acquisition recovers the inner value and records that it did.

use std::sync::{LockResult, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    kind: &'static str,
) -> G {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = kind,
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn rwlock_recovers_after_panic() {
        let lock = RwLock::new(vec![1_u32]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("rwlock should lock");
            panic!("poison rwlock");
        }));

        rw_write(&lock, "test", "write").push(2);
        assert_eq!(rw_read(&lock, "test", "read").len(), 2);
    }
}
