// ============================================================================
// Migration Lock Acquisition
// ============================================================================

use crate::core::{MigrateError, Result};
use crate::driver::MigrationLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long to wait for the lock and how often to retry.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// Proof that the migration lock is held. Released with [`release`].
#[derive(Debug)]
pub struct LockHandle {
    owner: String,
    acquired_at: Instant,
}

impl LockHandle {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// Polls the lock until it is obtained or `options.timeout` elapses.
pub async fn acquire<L>(lock: &mut L, options: &LockOptions) -> Result<LockHandle>
where
    L: MigrationLock + ?Sized,
{
    let owner = Uuid::new_v4().to_string();
    let start = Instant::now();

    loop {
        if lock.try_lock(&owner).await? {
            debug!(owner = %owner, "migration lock acquired");
            return Ok(LockHandle {
                owner,
                acquired_at: Instant::now(),
            });
        }

        let waited = start.elapsed();
        if waited >= options.timeout {
            warn!(?waited, "migration lock busy");
            return Err(MigrateError::LockBusy { waited });
        }

        tokio::time::sleep(options.retry_interval.min(options.timeout - waited)).await;
    }
}

/// Releases a lock obtained from [`acquire`].
pub async fn release<L>(lock: &mut L, handle: LockHandle) -> Result<()>
where
    L: MigrationLock + ?Sized,
{
    lock.unlock(&handle.owner).await?;
    debug!(owner = %handle.owner, held_for = ?handle.held_for(), "migration lock released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Lock that stays busy for a fixed number of attempts.
    struct BusyLock {
        busy_attempts: usize,
        attempts: usize,
        holder: Option<String>,
    }

    #[async_trait]
    impl MigrationLock for BusyLock {
        async fn try_lock(&mut self, owner: &str) -> Result<bool> {
            self.attempts += 1;
            if self.attempts <= self.busy_attempts {
                return Ok(false);
            }
            self.holder = Some(owner.to_string());
            Ok(true)
        }

        async fn unlock(&mut self, owner: &str) -> Result<()> {
            assert_eq!(self.holder.as_deref(), Some(owner));
            self.holder = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acquire_retries_until_free() {
        let mut lock = BusyLock {
            busy_attempts: 3,
            attempts: 0,
            holder: None,
        };
        let options = LockOptions {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(1),
        };

        let handle = acquire(&mut lock, &options).await.unwrap();
        assert_eq!(lock.attempts, 4);
        assert_eq!(lock.holder.as_deref(), Some(handle.owner()));

        release(&mut lock, handle).await.unwrap();
        assert!(lock.holder.is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let mut lock = BusyLock {
            busy_attempts: usize::MAX,
            attempts: 0,
            holder: None,
        };
        let options = LockOptions {
            timeout: Duration::from_millis(30),
            retry_interval: Duration::from_millis(5),
        };

        let err = acquire(&mut lock, &options).await.unwrap_err();
        assert!(matches!(err, MigrateError::LockBusy { waited } if waited >= options.timeout));
        assert!(lock.attempts > 1);
    }
}
