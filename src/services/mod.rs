//! Services module for commons-billing.

pub mod clock;
pub mod database;
pub mod document;
pub mod generator;
pub mod jobs;
pub mod line_items;
pub mod lock;
pub mod metrics;
pub mod usage_metrics;

pub use clock::Clock;
pub use database::Database;
pub use document::render_invoice;
pub use generator::{previous_billing_period, InvoiceGenerator};
pub use jobs::{spawn_scheduler, BillingJobs};
pub use lock::{JobLock, JobLockGuard, LockError, LockKey};
pub use metrics::{get_metrics, init_metrics};
