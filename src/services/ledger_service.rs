//! src/services/ledger_service.rs
//!
//! LedgerService — the usage ledger backed by SQLite. Usage is stored as
//! transition points only: a new record is appended when a bucket's
//! observed counters change, and the previously open record is closed in
//! the same transaction. Observing an unchanged bucket writes nothing, so
//! storage grows with change events rather than with polls.

use crate::models::record::UsageRecord;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const RECORD_COLUMNS: &str =
    "id, bucket_uid, period_start, period_end, objects_count, bytes_total, run_id";

/// A point-in-time measurement of one bucket's usage.
///
/// Both counters must be non-negative; the writer rejects anything else.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Observation {
    pub objects_count: i64,
    pub bytes_total: i64,
}

/// Filter for ledger range queries. Unset fields mean "unbounded".
///
/// An explicitly empty uid or run-id list matches nothing, which is
/// distinct from leaving the field unset.
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    pub bucket_uids: Option<Vec<String>>,
    pub run_ids: Option<Vec<Uuid>>,
    pub from_period: Option<DateTime<Utc>>,
    pub to_period: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("bucket uid must not be empty")]
    EmptyBucketUid,
    #[error("observation counters must be non-negative (objects: {objects_count}, bytes: {bytes_total})")]
    NegativeCounters { objects_count: i64, bytes_total: i64 },
    #[error("run `{0}` not found")]
    RunNotFound(Uuid),
    #[error("run `{0}` is already closed")]
    RunClosed(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// LedgerService provides the two halves of the usage ledger:
/// - Writer: fold a fresh observation into the bucket's period history
///   (`record_usage`), keeping at most one open record per bucket.
/// - Reader: answer range queries over the history (`query_records`),
///   clipping the returned boundaries to the requested window.
#[derive(Clone)]
pub struct LedgerService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl LedgerService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Fetch the bucket's open record, if any.
    ///
    /// The open record carries the bucket's currently believed usage;
    /// `None` means the bucket has never been observed (or its history is
    /// fully closed, which the writer never leaves behind).
    pub async fn current_record(&self, bucket_uid: &str) -> LedgerResult<Option<UsageRecord>> {
        let record = sqlx::query_as::<Sqlite, UsageRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE bucket_uid = ? AND period_end IS NULL
             LIMIT 1"
        ))
        .bind(bucket_uid)
        .fetch_optional(&*self.db)
        .await?;

        Ok(record)
    }

    /// Fold a fresh observation into the bucket's history.
    ///
    /// Runs as a single transaction:
    /// 1. Read the bucket's open record.
    /// 2. If there is none, or its counters differ from `observation`,
    ///    close it (`period_end = now`) and insert a new open record with
    ///    `period_start = now`. Returns `true`.
    /// 3. Otherwise write nothing and return `false` — the open record's
    ///    declared counters remain valid up to the next detected change.
    ///
    /// `run_id` must reference an open run. Any storage error rolls the
    /// whole transaction back, so a close is never persisted without its
    /// matching insert.
    pub async fn record_usage(
        &self,
        bucket_uid: &str,
        observation: Observation,
        run_id: Uuid,
    ) -> LedgerResult<bool> {
        if bucket_uid.is_empty() {
            return Err(LedgerError::EmptyBucketUid);
        }
        if observation.objects_count < 0 || observation.bytes_total < 0 {
            return Err(LedgerError::NegativeCounters {
                objects_count: observation.objects_count,
                bytes_total: observation.bytes_total,
            });
        }

        let mut tx = self.db.begin().await?;

        let run_end: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT end_time FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
        match run_end {
            None => return Err(LedgerError::RunNotFound(run_id)),
            Some(Some(_)) => return Err(LedgerError::RunClosed(run_id)),
            Some(None) => {}
        }

        let current = sqlx::query_as::<Sqlite, UsageRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE bucket_uid = ? AND period_end IS NULL
             LIMIT 1"
        ))
        .bind(bucket_uid)
        .fetch_optional(&mut *tx)
        .await?;

        let unchanged = current.as_ref().is_some_and(|record| {
            record.objects_count == observation.objects_count
                && record.bytes_total == observation.bytes_total
        });
        if unchanged {
            // Dropping the transaction rolls back the (read-only) work.
            return Ok(false);
        }

        // One timestamp for both sides of the transition keeps successive
        // records contiguous: the closed record's end is the new start.
        let now = Utc::now();

        if current.is_some() {
            sqlx::query(
                "UPDATE records SET period_end = ? WHERE bucket_uid = ? AND period_end IS NULL",
            )
            .bind(now)
            .bind(bucket_uid)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO records (id, bucket_uid, period_start, period_end, objects_count, bytes_total, run_id)
             VALUES (?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(bucket_uid)
        .bind(now)
        .bind(observation.objects_count)
        .bind(observation.bytes_total)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Range query over the ledger.
    ///
    /// Selects every record that overlaps the requested window — including
    /// the open record when `to_period` lies in the future — then clips
    /// the returned boundaries to the window. Clipping affects only the
    /// view handed back; stored rows are never mutated, so byte-time
    /// integration over the window stays correct even though the
    /// underlying record may extend outside it.
    ///
    /// A window with `from_period > to_period` yields an empty result, not
    /// an error. Result order follows storage order.
    pub async fn query_records(&self, filter: &RecordFilter) -> LedgerResult<Vec<UsageRecord>> {
        // An inverted window would otherwise still match records spanning
        // both bounds and hand back negative-length views.
        if let (Some(from), Some(to)) = (filter.from_period, filter.to_period) {
            if from > to {
                return Ok(Vec::new());
            }
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE 1 = 1"
        ));

        if let Some(uids) = &filter.bucket_uids {
            if uids.is_empty() {
                builder.push(" AND 1 = 0");
            } else {
                builder.push(" AND bucket_uid IN (");
                let mut parts = builder.separated(", ");
                for uid in uids {
                    parts.push_bind(uid.as_str());
                }
                builder.push(")");
            }
        }

        if let Some(run_ids) = &filter.run_ids {
            if run_ids.is_empty() {
                builder.push(" AND 1 = 0");
            } else {
                builder.push(" AND run_id IN (");
                let mut parts = builder.separated(", ");
                for run_id in run_ids {
                    parts.push_bind(*run_id);
                }
                builder.push(")");
            }
        }

        if let Some(from) = filter.from_period {
            builder.push(" AND (period_end > ");
            builder.push_bind(from);
            builder.push(" OR period_end IS NULL)");
        }

        if let Some(to) = filter.to_period {
            builder.push(" AND period_start < ");
            builder.push_bind(to);
        }

        let mut records: Vec<UsageRecord> =
            builder.build_query_as().fetch_all(&*self.db).await?;

        for record in &mut records {
            clip_to_window(record, filter);
        }

        Ok(records)
    }

    /// Single-bucket form of [`query_records`](Self::query_records).
    ///
    /// Purely an ergonomic entry point; it delegates to the one
    /// parameterized implementation with `bucket_uids = [uid]`.
    pub async fn bucket_records(
        &self,
        uid: &str,
        filter: &RecordFilter,
    ) -> LedgerResult<Vec<UsageRecord>> {
        let filter = RecordFilter {
            bucket_uids: Some(vec![uid.to_string()]),
            ..filter.clone()
        };
        self.query_records(&filter).await
    }
}

/// Clip a record's reported boundaries to the filter window.
///
/// Idempotent: re-clipping an already clipped record with the same window
/// changes nothing.
fn clip_to_window(record: &mut UsageRecord, filter: &RecordFilter) {
    if let Some(from) = filter.from_period {
        if record.period_start < from {
            record.period_start = from;
        }
    }
    if let Some(to) = filter.to_period {
        if record.period_end.is_none_or(|end| end > to) {
            record.period_end = Some(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::run_service::RunService;
    use crate::services::testing::{insert_record, test_pool};
    use chrono::TimeZone;

    fn obs(objects_count: i64, bytes_total: i64) -> Observation {
        Observation {
            objects_count,
            bytes_total,
        }
    }

    async fn open_run(db: &Arc<SqlitePool>) -> Uuid {
        RunService::new(db.clone())
            .open_run("test")
            .await
            .expect("open run")
            .id
    }

    #[tokio::test]
    async fn first_observation_opens_a_record() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        let changed = ledger.record_usage("b1", obs(5, 100), run_id).await.unwrap();
        assert!(changed);

        let current = ledger.current_record("b1").await.unwrap().expect("open record");
        assert_eq!(current.objects_count, 5);
        assert_eq!(current.bytes_total, 100);
        assert_eq!(current.run_id, run_id);
        assert!(current.period_end.is_none());
    }

    #[tokio::test]
    async fn unchanged_observations_collapse_into_one_record() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        assert!(ledger.record_usage("b1", obs(5, 100), run_id).await.unwrap());
        for _ in 0..4 {
            let changed = ledger.record_usage("b1", obs(5, 100), run_id).await.unwrap();
            assert!(!changed);
        }

        let records = ledger.query_records(&RecordFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn changed_observation_closes_and_reopens_contiguously() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let r1 = open_run(&db).await;
        let r2 = open_run(&db).await;
        let r3 = open_run(&db).await;

        assert!(ledger.record_usage("b1", obs(5, 100), r1).await.unwrap());
        assert!(!ledger.record_usage("b1", obs(5, 100), r2).await.unwrap());
        assert!(ledger.record_usage("b1", obs(7, 200), r3).await.unwrap());

        let mut records = ledger.query_records(&RecordFilter::default()).await.unwrap();
        records.sort_by_key(|r| r.period_start);
        assert_eq!(records.len(), 2);

        let (first, second) = (&records[0], &records[1]);
        assert_eq!(first.objects_count, 5);
        assert_eq!(first.bytes_total, 100);
        assert_eq!(first.run_id, r1);
        assert_eq!(first.period_end, Some(second.period_start));
        assert_eq!(second.objects_count, 7);
        assert_eq!(second.bytes_total, 200);
        assert_eq!(second.run_id, r3);
        assert!(second.period_end.is_none());
    }

    #[tokio::test]
    async fn at_most_one_open_record_per_bucket() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        for (objects, bytes) in [(1, 10), (1, 10), (2, 20), (3, 30), (3, 30), (4, 40)] {
            ledger
                .record_usage("b1", obs(objects, bytes), run_id)
                .await
                .unwrap();

            let open: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM records WHERE bucket_uid = ? AND period_end IS NULL",
            )
            .bind("b1")
            .fetch_one(&*db)
            .await
            .unwrap();
            assert_eq!(open, 1);
        }
    }

    #[tokio::test]
    async fn writer_rejects_bad_inputs() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        assert!(matches!(
            ledger.record_usage("", obs(1, 1), run_id).await,
            Err(LedgerError::EmptyBucketUid)
        ));
        assert!(matches!(
            ledger.record_usage("b1", obs(-1, 1), run_id).await,
            Err(LedgerError::NegativeCounters { .. })
        ));
        assert!(matches!(
            ledger.record_usage("b1", obs(1, 1), Uuid::new_v4()).await,
            Err(LedgerError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn writer_rejects_closed_runs() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let runs = RunService::new(db.clone());

        let run = runs.open_run("test").await.unwrap();
        runs.close_run(run.id, Default::default()).await.unwrap();

        assert!(matches!(
            ledger.record_usage("b1", obs(1, 1), run.id).await,
            Err(LedgerError::RunClosed(_))
        ));
        assert!(ledger.current_record("b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_query_clips_overlapping_records() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        let jan = |day| Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        insert_record(&db, "b1", jan(1), Some(jan(10)), 5, 100, run_id).await;

        let window = RecordFilter {
            from_period: Some(jan(5)),
            to_period: Some(jan(8)),
            ..Default::default()
        };
        let records = ledger.query_records(&window).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].period_start, jan(5));
        assert_eq!(records[0].period_end, Some(jan(8)));
        // Stored row is untouched by clipping.
        let stored = ledger
            .query_records(&RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(stored[0].period_start, jan(1));
        assert_eq!(stored[0].period_end, Some(jan(10)));

        let past_the_end = RecordFilter {
            from_period: Some(jan(20)),
            ..Default::default()
        };
        assert!(ledger.query_records(&past_the_end).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_record_is_selected_and_clipped_at_to_period() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        let jan = |day| Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        insert_record(&db, "b1", jan(1), None, 5, 100, run_id).await;

        let window = RecordFilter {
            from_period: Some(jan(2)),
            to_period: Some(jan(9)),
            ..Default::default()
        };
        let records = ledger.query_records(&window).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].period_start, jan(2));
        assert_eq!(records[0].period_end, Some(jan(9)));
    }

    #[tokio::test]
    async fn set_filters_restrict_by_uid_and_run() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let r1 = open_run(&db).await;
        let r2 = open_run(&db).await;

        let jan = |day| Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        insert_record(&db, "b1", jan(1), None, 1, 10, r1).await;
        insert_record(&db, "b2", jan(1), None, 2, 20, r2).await;

        let by_uid = RecordFilter {
            bucket_uids: Some(vec!["b2".into()]),
            ..Default::default()
        };
        let records = ledger.query_records(&by_uid).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bucket_uid, "b2");

        let by_run = RecordFilter {
            run_ids: Some(vec![r1]),
            ..Default::default()
        };
        let records = ledger.query_records(&by_run).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, r1);

        // Explicitly empty set matches nothing.
        let none = RecordFilter {
            bucket_uids: Some(vec![]),
            ..Default::default()
        };
        assert!(ledger.query_records(&none).await.unwrap().is_empty());

        let convenience = ledger.bucket_records("b1", &RecordFilter::default()).await.unwrap();
        assert_eq!(convenience.len(), 1);
        assert_eq!(convenience[0].bucket_uid, "b1");
    }

    #[tokio::test]
    async fn inverted_window_yields_empty_not_error() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let run_id = open_run(&db).await;

        let jan = |day| Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        insert_record(&db, "b1", jan(1), Some(jan(10)), 5, 100, run_id).await;

        let inverted = RecordFilter {
            from_period: Some(jan(8)),
            to_period: Some(jan(5)),
            ..Default::default()
        };
        assert!(ledger.query_records(&inverted).await.unwrap().is_empty());
    }

    #[test]
    fn clipping_is_a_fixed_point() {
        let jan = |day| Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap();
        let filter = RecordFilter {
            from_period: Some(jan(5)),
            to_period: Some(jan(8)),
            ..Default::default()
        };
        let mut record = UsageRecord {
            id: Uuid::new_v4(),
            bucket_uid: "b1".into(),
            period_start: jan(1),
            period_end: None,
            objects_count: 5,
            bytes_total: 100,
            run_id: Uuid::new_v4(),
        };

        clip_to_window(&mut record, &filter);
        let once = record.clone();
        clip_to_window(&mut record, &filter);
        assert_eq!(record, once);
        assert_eq!(record.period_start, jan(5));
        assert_eq!(record.period_end, Some(jan(8)));
    }
}
