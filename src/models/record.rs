//! Represents one time-sliced usage record in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A usage record for one bucket over one interval of stable usage.
///
/// The counters are valid for the whole interval `[period_start,
/// period_end)`. A record with `period_end == None` is *open*: it carries
/// the bucket's currently believed usage and stays valid until the next
/// observed change closes it. Per bucket there is at most one open record
/// at any time, and successive records are contiguous (the `period_end` of
/// one equals the `period_start` of the next).
#[derive(Serialize, Deserialize, Clone, PartialEq, FromRow, Debug)]
pub struct UsageRecord {
    /// Internal UUID, assigned when the record is created.
    pub id: Uuid,

    /// Externally assigned identifier of the measured bucket.
    pub bucket_uid: String,

    /// When this interval began. Immutable after creation.
    pub period_start: DateTime<Utc>,

    /// When this interval ended; `None` while the record is open.
    pub period_end: Option<DateTime<Utc>>,

    /// Number of objects observed in the bucket for this interval.
    pub objects_count: i64,

    /// Total payload bytes observed in the bucket for this interval.
    pub bytes_total: i64,

    /// The sweep run during which this record was created.
    pub run_id: Uuid,
}
