//! Represents one metering sweep, audited as a single run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One execution of the metering procedure over a set of buckets.
///
/// A run is opened before any bucket is attempted and closed exactly once
/// after every bucket has been attempted, regardless of individual
/// failures. Runs do not own usage records; records back-reference the run
/// that observed them and outlive it independently.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Run {
    /// Internal UUID for this run.
    pub id: Uuid,

    /// When the run was opened.
    pub start_time: DateTime<Utc>,

    /// When the run was closed; `None` while the sweep is in progress.
    pub end_time: Option<DateTime<Utc>>,

    /// Free-form cause label ("automatic", "manual", ...).
    pub trigger: String,

    /// Uids of every bucket attempted during this run.
    #[sqlx(json)]
    pub all_uids: Vec<String>,

    /// Uids of buckets whose attempt failed.
    #[sqlx(json)]
    pub failed_uids: Vec<String>,

    /// One message per failure, aligned with `failed_uids`.
    #[sqlx(json)]
    pub error_messages: Vec<String>,
}
