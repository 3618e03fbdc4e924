//! Core data models for the bucket usage metering service.
//!
//! These entities represent the usage ledger (time-sliced records per
//! bucket) and the sweep audit trail (runs). They map cleanly to database
//! tables via `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod bucket;
pub mod record;
pub mod run;
