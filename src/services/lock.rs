use sqlx::{pool::PoolConnection, PgPool, Postgres};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock is already held by another instance")]
    AlreadyHeld,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A unique key identifying a specific background job lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    pub const fn new(key: i64) -> Self {
        Self(key)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl LockKey {
    /// Monthly invoice generation job.
    pub const MONTHLY_GENERATION: LockKey = LockKey::new(0x00B1_1100_0001);
    /// Sweep of sent invoices past their due date.
    pub const OVERDUE_SWEEP: LockKey = LockKey::new(0x00B1_1100_0002);
}

/// A guard that holds a PostgreSQL advisory lock
///
/// Session-level locks survive a connection's return to the pool, so the
/// guard either unlocks explicitly or closes the connection when dropped.
pub struct JobLockGuard {
    conn: PoolConnection<Postgres>,
    key: LockKey,
    released: bool,
}

impl JobLockGuard {
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Release the lock and hand the connection back to the pool.
    pub async fn release(mut self) -> Result<(), LockError> {
        let released: bool = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key.value())
            .fetch_one(&mut *self.conn)
            .await?;

        self.released = true;

        if released {
            info!("Released job lock {}", self.key);
        } else {
            warn!("Failed to release job lock {} - was not held", self.key);
        }
        Ok(())
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        if !self.released {
            // A pooled session keeps its advisory locks, so close the
            // connection rather than returning it with the key still held.
            debug!("Closing connection for unreleased job lock {}", self.key);
            self.conn.close_on_drop();
        }
    }
}

/// Mutual exclusion for background billing jobs
///
/// Uses PostgreSQL session-level advisory locks so that only one service
/// instance runs a given job at a time. Locks are released automatically
/// if the holding connection is closed (crash safety).
#[derive(Clone)]
pub struct JobLock {
    pool: PgPool,
}

impl JobLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Try to acquire a job lock (non-blocking)
    ///
    /// Returns a guard if the lock was acquired, or `LockError::AlreadyHeld`
    /// when another instance is running the job. The lock is released when
    /// the guard is dropped.
    pub async fn try_acquire(&self, key: LockKey) -> Result<JobLockGuard, LockError> {
        let mut conn = self.pool.acquire().await?;

        let acquired: bool = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key.value())
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            info!("Acquired job lock {}", key);
            Ok(JobLockGuard {
                conn,
                key,
                released: false,
            })
        } else {
            debug!("Failed to acquire job lock {} - already held", key);
            Err(LockError::AlreadyHeld)
        }
    }

    /// Check if a lock is currently held (by any connection)
    ///
    /// This is useful for monitoring and tests. A 64-bit advisory key is
    /// stored split across classid (high half) and objid (low half), so the
    /// key has to be reassembled before comparing.
    pub async fn is_locked(&self, key: LockKey) -> Result<bool, LockError> {
        let locked: bool = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(
                SELECT 1 FROM pg_locks
                WHERE locktype = 'advisory'
                AND ((classid::bigint << 32) | objid::bigint) = $1
            )",
        )
        .bind(key.value())
        .fetch_one(&self.pool)
        .await?;

        Ok(locked)
    }
}
