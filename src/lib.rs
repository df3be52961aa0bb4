//! Commons Billing - usage-based billing for shared community resources.

pub mod config;
pub mod error;
pub mod models;
pub mod observability;
pub mod services;
pub mod startup;
