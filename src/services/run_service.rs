//! src/services/run_service.rs
//!
//! RunService — persistence for sweep runs, plus the in-memory summary a
//! sweep accumulates while it iterates buckets. A run is opened before the
//! first bucket attempt and closed exactly once after the last, whatever
//! happened in between.

use crate::models::run::Run;
use crate::services::ledger_service::{LedgerError, LedgerResult};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::sync::Arc;
use uuid::Uuid;

const RUN_COLUMNS: &str =
    "id, start_time, end_time, trigger, all_uids, failed_uids, error_messages";

/// Per-bucket outcomes accumulated across one sweep, in memory.
///
/// `error_messages[i]` explains `failed_uids[i]`; the two sequences are
/// only ever appended to together. Written to storage once, at close.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub all_uids: Vec<String>,
    pub failed_uids: Vec<String>,
    pub error_messages: Vec<String>,
}

impl RunSummary {
    /// Record a bucket that was attempted and metered successfully.
    pub fn record_success(&mut self, uid: &str) {
        self.all_uids.push(uid.to_string());
    }

    /// Record a bucket whose attempt failed, with the reason.
    pub fn record_failure(&mut self, uid: &str, message: impl Into<String>) {
        self.all_uids.push(uid.to_string());
        self.failed_uids.push(uid.to_string());
        self.error_messages.push(message.into());
    }
}

/// Filter for run queries. Unset fields mean "unbounded".
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub ids: Option<Vec<Uuid>>,
    pub trigger: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
}

/// RunService persists the audit trail of metering sweeps.
#[derive(Clone)]
pub struct RunService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl RunService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open a new run with empty outcome lists and no end time.
    ///
    /// This must succeed before any bucket is attempted; without a run
    /// there is no audit trail, so a failure here aborts the whole sweep.
    pub async fn open_run(&self, trigger: &str) -> LedgerResult<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            trigger: trigger.to_string(),
            all_uids: Vec::new(),
            failed_uids: Vec::new(),
            error_messages: Vec::new(),
        };

        sqlx::query(
            "INSERT INTO runs (id, start_time, end_time, trigger, all_uids, failed_uids, error_messages)
             VALUES (?, ?, NULL, ?, '[]', '[]', '[]')",
        )
        .bind(run.id)
        .bind(run.start_time)
        .bind(&run.trigger)
        .execute(&*self.db)
        .await?;

        Ok(run)
    }

    /// Close an open run: one write setting `end_time = now` and the three
    /// accumulated outcome lists.
    ///
    /// Guarded by `end_time IS NULL` — a run transitions OPEN -> CLOSED
    /// once and never reopens. Closing a run that is missing or already
    /// closed is an error.
    pub async fn close_run(&self, run_id: Uuid, summary: RunSummary) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE runs
             SET end_time = ?, all_uids = ?, failed_uids = ?, error_messages = ?
             WHERE id = ? AND end_time IS NULL",
        )
        .bind(Utc::now())
        .bind(Json(&summary.all_uids))
        .bind(Json(&summary.failed_uids))
        .bind(Json(&summary.error_messages))
        .bind(run_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&*self.db)
                .await?;
            return Err(match exists {
                Some(_) => LedgerError::RunClosed(run_id),
                None => LedgerError::RunNotFound(run_id),
            });
        }

        Ok(())
    }

    /// Query runs by id set, exact trigger, and time window.
    ///
    /// `from_time` selects runs that ended after it (open runs are
    /// excluded), `to_time` selects runs that started before it.
    pub async fn query_runs(&self, filter: &RunFilter) -> LedgerResult<Vec<Run>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1"));

        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                builder.push(" AND 1 = 0");
            } else {
                builder.push(" AND id IN (");
                let mut parts = builder.separated(", ");
                for id in ids {
                    parts.push_bind(*id);
                }
                builder.push(")");
            }
        }

        if let Some(trigger) = &filter.trigger {
            builder.push(" AND trigger = ");
            builder.push_bind(trigger.as_str());
        }

        if let Some(from) = filter.from_time {
            builder.push(" AND end_time > ");
            builder.push_bind(from);
        }

        if let Some(to) = filter.to_time {
            builder.push(" AND start_time < ");
            builder.push_bind(to);
        }

        let runs = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(runs)
    }

    /// Fetch a single run by id.
    pub async fn get_run(&self, run_id: Uuid) -> LedgerResult<Option<Run>> {
        let filter = RunFilter {
            ids: Some(vec![run_id]),
            ..Default::default()
        };
        Ok(self.query_runs(&filter).await?.into_iter().next())
    }
}
