//! Scheduled billing jobs.
//!
//! Two jobs run on a timer: the monthly generation run and the daily overdue
//! sweep. Each one takes a database advisory lock first, so with several
//! service instances deployed only one actually does the work; the rest skip.

use crate::error::AppError;
use crate::services::clock::Clock;
use crate::services::database::Database;
use crate::services::generator::InvoiceGenerator;
use crate::services::lock::{JobLock, LockError, LockKey};
use crate::services::metrics::{record_generation_run, record_overdue_transitions};
use chrono::{Datelike, NaiveDate};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// The billing background jobs and the state they share.
#[derive(Clone)]
pub struct BillingJobs {
    db: Database,
    generator: InvoiceGenerator,
    lock: JobLock,
    clock: Clock,
    generation_day: u32,
}

impl BillingJobs {
    pub fn new(
        db: Database,
        generator: InvoiceGenerator,
        clock: Clock,
        generation_day: u32,
    ) -> Self {
        let lock = JobLock::new(db.pool().clone());
        Self {
            db,
            generator,
            lock,
            clock,
            generation_day,
        }
    }

    /// Run the monthly generation for the previous calendar month.
    ///
    /// Returns the number of invoices generated, or zero when another
    /// instance holds the job lock.
    #[instrument(skip(self))]
    pub async fn run_monthly_generation(&self) -> Result<usize, AppError> {
        let guard = match self.lock.try_acquire(LockKey::MONTHLY_GENERATION).await {
            Ok(guard) => guard,
            Err(LockError::AlreadyHeld) => {
                info!("Monthly generation already running on another instance, skipping");
                record_generation_run("scheduled", "skipped");
                return Ok(0);
            }
            Err(LockError::Database(e)) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to acquire generation lock: {}",
                    e
                )));
            }
        };

        let outcome = self.generator.generate_monthly_invoices(None).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release generation lock");
        }

        let invoices = outcome?;
        Ok(invoices.len())
    }

    /// Move sent invoices past their due date to overdue.
    ///
    /// Returns the number of invoices moved, or zero when another instance
    /// holds the job lock.
    #[instrument(skip(self))]
    pub async fn run_overdue_sweep(&self) -> Result<usize, AppError> {
        let guard = match self.lock.try_acquire(LockKey::OVERDUE_SWEEP).await {
            Ok(guard) => guard,
            Err(LockError::AlreadyHeld) => {
                info!("Overdue sweep already running on another instance, skipping");
                return Ok(0);
            }
            Err(LockError::Database(e)) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to acquire sweep lock: {}",
                    e
                )));
            }
        };

        let outcome = self.db.mark_overdue_invoices(self.clock.today()).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release sweep lock");
        }

        let moved = outcome?;
        record_overdue_transitions("scheduled", moved.len() as u64);
        Ok(moved.len())
    }
}

/// Spawn the scheduler loop.
///
/// Every tick it runs the overdue sweep at most once per day, and the
/// generation run at most once per month on the configured day. The first
/// tick fires immediately so a restart on billing day still bills; the
/// advisory locks and the at-most-once constraint make that safe.
pub fn spawn_scheduler(jobs: BillingJobs, tick_seconds: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_sweep: Option<NaiveDate> = None;
        let mut last_generation: Option<(i32, u32)> = None;

        loop {
            interval.tick().await;
            let today = jobs.clock.today();

            if last_sweep != Some(today) {
                match jobs.run_overdue_sweep().await {
                    Ok(moved) => {
                        last_sweep = Some(today);
                        if moved > 0 {
                            info!(moved = moved, "Overdue sweep completed");
                        }
                    }
                    Err(e) => error!(error = %e, "Overdue sweep failed"),
                }
            }

            let month = (today.year(), today.month());
            if today.day() == jobs.generation_day && last_generation != Some(month) {
                match jobs.run_monthly_generation().await {
                    Ok(count) => {
                        last_generation = Some(month);
                        info!(invoice_count = count, "Monthly generation completed");
                    }
                    Err(e) => error!(error = %e, "Monthly generation failed"),
                }
            }
        }
    })
}
