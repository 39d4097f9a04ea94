use crate::CoreError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes outbound sends per remote account.
///
/// Locks are created lazily and never shared across accounts, so there is no
/// process-wide critical section. [`prune_idle`](Self::prune_idle) drops lock
/// handles that nobody holds or waits on.
#[derive(Default)]
pub struct AccountSendSerializer {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

/// Held for the duration of one outbound operation. Dropping it releases the
/// account lock on every exit path.
#[must_use = "the account lock is released as soon as the guard is dropped"]
pub struct SendGuard {
    held: Option<OwnedMutexGuard<()>>,
}

impl SendGuard {
    pub fn is_noop(&self) -> bool {
        self.held.is_none()
    }
}

impl AccountSendSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive send access to `account`.
    ///
    /// Without an account, a non-required lock is a guard that never blocks;
    /// a required one is a caller bug and fails with
    /// [`CoreError::MissingAccount`].
    pub async fn acquire(&self, account: Option<i64>, required: bool) -> Result<SendGuard, CoreError> {
        let Some(account) = account else {
            if required {
                return Err(CoreError::MissingAccount);
            }
            return Ok(SendGuard { held: None });
        };

        // Clone the handle out so no map shard stays locked across the await.
        let lock = self.locks.entry(account).or_default().clone();
        Ok(SendGuard {
            held: Some(lock.lock_owned().await),
        })
    }

    /// Remove lock handles with no holder and no waiter. Returns how many were
    /// removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            tracing::debug!(removed, "send_lock: pruned idle account locks");
        }
        removed
    }

    pub fn tracked_accounts(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn one_critical_section_per_account() {
        let serializer = Arc::new(AccountSendSerializer::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let serializer = serializer.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = serializer.acquire(Some(42), true).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_accounts_do_not_block_each_other() {
        let serializer = AccountSendSerializer::new();
        let _a = serializer.acquire(Some(1), true).await.unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), serializer.acquire(Some(2), true))
            .await
            .expect("account 2 must not wait on account 1");
        assert!(!b.unwrap().is_noop());
    }

    #[tokio::test]
    async fn missing_account_depends_on_required() {
        let serializer = AccountSendSerializer::new();
        let noop = serializer.acquire(None, false).await.unwrap();
        assert!(noop.is_noop());
        let second = serializer.acquire(None, false).await.unwrap();
        assert!(second.is_noop());
        assert!(matches!(
            serializer.acquire(None, true).await,
            Err(CoreError::MissingAccount)
        ));
        assert_eq!(serializer.tracked_accounts(), 0);
    }

    #[tokio::test]
    async fn lock_is_released_when_guarded_work_fails() {
        let serializer = AccountSendSerializer::new();
        let result: Result<(), CoreError> = async {
            let _guard = serializer.acquire(Some(7), true).await?;
            Err(CoreError::Remote("flood".into()))
        }
        .await;
        assert!(result.is_err());
        let relock = tokio::time::timeout(Duration::from_secs(1), serializer.acquire(Some(7), true)).await;
        assert!(relock.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let serializer = AccountSendSerializer::new();
        let held = serializer.acquire(Some(1), true).await.unwrap();
        drop(serializer.acquire(Some(2), true).await.unwrap());
        assert_eq!(serializer.tracked_accounts(), 2);
        assert_eq!(serializer.prune_idle(), 1);
        assert_eq!(serializer.tracked_accounts(), 1);
        drop(held);
        assert_eq!(serializer.prune_idle(), 1);
    }
}
