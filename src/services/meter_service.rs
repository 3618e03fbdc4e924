//! src/services/meter_service.rs
//!
//! MeterService — the sweep driver. One sweep opens a run, walks the given
//! buckets sequentially, folds each observation into the ledger, and
//! closes the run with the per-bucket outcomes. A bucket failing to meter
//! is captured in the summary and never stops the sweep; only a failure
//! to open the run aborts it.
//!
//! The observation itself comes from a [`UsageSource`]. The bundled
//! [`S3UsageSource`] lists an S3-compatible endpoint over HTTP and sums
//! object sizes; anything that can produce an [`Observation`] for a
//! bucket works, which is also how tests script failures.

use crate::models::bucket::MeteredBucket;
use crate::models::run::Run;
use crate::services::ledger_service::{LedgerResult, LedgerService, Observation};
use crate::services::run_service::{RunService, RunSummary};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Produces a point-in-time usage observation for one bucket.
///
/// Implementations are external collaborators as far as the ledger is
/// concerned: any error is a per-bucket failure, captured into the run
/// summary with the message as-is.
pub trait UsageSource {
    fn observe(
        &self,
        bucket: &MeteredBucket,
    ) -> impl Future<Output = anyhow::Result<Observation>> + Send;
}

/// Enumerates the buckets a sweep should cover.
pub trait BucketCatalog {
    fn list_buckets(&self) -> impl Future<Output = anyhow::Result<Vec<MeteredBucket>>> + Send;
}

/// MeterService drives metering sweeps against a usage source.
#[derive(Clone)]
pub struct MeterService<S> {
    ledger: LedgerService,
    runs: RunService,
    source: S,
}

impl<S: UsageSource> MeterService<S> {
    pub fn new(ledger: LedgerService, runs: RunService, source: S) -> Self {
        Self {
            ledger,
            runs,
            source,
        }
    }

    /// Run one metering sweep over `buckets` and return the closed run.
    ///
    /// Buckets are attempted sequentially; each failure is recorded in the
    /// summary and the sweep moves on. The run is closed exactly once,
    /// after the last attempt. An error opening or closing the run
    /// propagates to the caller.
    pub async fn sweep(&self, trigger: &str, buckets: &[MeteredBucket]) -> LedgerResult<Run> {
        let run = self.runs.open_run(trigger).await?;
        info!(
            "Starting metering sweep {} over {} buckets (trigger: {})",
            run.id,
            buckets.len(),
            trigger
        );

        let mut summary = RunSummary::default();
        for bucket in buckets {
            match self.meter_bucket(bucket, &run).await {
                Ok(changed) => {
                    info!(
                        "Metered bucket ({}) [Name={}, Uid={}]",
                        if changed { "UPDATED" } else { "UNCHANGED" },
                        bucket.name,
                        bucket.uid
                    );
                    summary.record_success(&bucket.uid);
                }
                Err(err) => {
                    warn!(
                        "Failed to meter bucket [Name={}, Uid={}]: {}",
                        bucket.name, bucket.uid, err
                    );
                    summary.record_failure(&bucket.uid, err.to_string());
                }
            }
        }

        let failed = summary.failed_uids.len();
        self.runs.close_run(run.id, summary).await?;
        info!(
            "Finished metering sweep {}: {} attempted, {} failed",
            run.id,
            buckets.len(),
            failed
        );

        Ok(self.runs.get_run(run.id).await?.unwrap_or(run))
    }

    async fn meter_bucket(&self, bucket: &MeteredBucket, run: &Run) -> anyhow::Result<bool> {
        let observation = self.source.observe(bucket).await?;
        let changed = self
            .ledger
            .record_usage(&bucket.uid, observation, run.id)
            .await?;
        Ok(changed)
    }
}

/// Usage source that lists an S3-compatible endpoint over plain HTTP.
///
/// Issues path-style `GET {endpoint}/{name}?list-type=2` requests, follows
/// `NextContinuationToken` pagination, and sums the `<Size>` of every
/// `<Contents>` entry. Request signing is out of scope here; endpoints
/// that require SigV4 credentials need their own source.
#[derive(Clone)]
pub struct S3UsageSource {
    http: reqwest::Client,
}

impl S3UsageSource {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }
}

impl UsageSource for S3UsageSource {
    async fn observe(&self, bucket: &MeteredBucket) -> anyhow::Result<Observation> {
        let url = format!(
            "{}/{}",
            bucket.endpoint.trim_end_matches('/'),
            bucket.name
        );

        let mut observation = Observation {
            objects_count: 0,
            bytes_total: 0,
        };
        let mut token: Option<String> = None;

        loop {
            let mut request = self.http.get(&url).query(&[("list-type", "2")]);
            if let Some(token) = &token {
                request = request.query(&[("continuation-token", token.as_str())]);
            }

            let body = request
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            let page = parse_list_page(&body)?;
            observation.objects_count += page.objects_count;
            observation.bytes_total += page.bytes_total;

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        Ok(observation)
    }
}

/// Usage counters and continuation state parsed from one list response.
#[derive(Debug, PartialEq, Eq)]
struct ListPage {
    objects_count: i64,
    bytes_total: i64,
    next_token: Option<String>,
}

/// Pull the counters out of a ListObjectsV2 XML page.
///
/// `<Size>` only ever appears inside a `<Contents>` entry and each entry
/// carries exactly one, so counting sizes counts objects. Deliberately not
/// a general XML parser; it reads the handful of flat tags this response
/// shape uses.
fn parse_list_page(xml: &str) -> anyhow::Result<ListPage> {
    let mut objects_count = 0i64;
    let mut bytes_total = 0i64;

    for raw in tag_values(xml, "Size") {
        let size: i64 = raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("unparseable <Size> value `{raw}` in list response"))?;
        objects_count += 1;
        bytes_total += size;
    }

    let truncated = tag_values(xml, "IsTruncated")
        .first()
        .is_some_and(|value| value.trim() == "true");
    let next_token = if truncated {
        let token = tag_values(xml, "NextContinuationToken")
            .first()
            .map(|value| value.to_string());
        if token.is_none() {
            anyhow::bail!("truncated list response without NextContinuationToken");
        }
        token
    } else {
        None
    };

    Ok(ListPage {
        objects_count,
        bytes_total,
        next_token,
    })
}

/// Collect the text between every `<name>...</name>` pair.
fn tag_values<'a>(xml: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut values = Vec::new();
    let mut rest = xml;

    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else { break };
        values.push(&rest[..end]);
        rest = &rest[end + close.len()..];
    }

    values
}

/// Bucket catalog read from a JSON file: an array of
/// `{uid, name, namespace?, endpoint}` entries.
///
/// The file is re-read on every sweep, so catalog edits take effect
/// without a restart.
#[derive(Clone)]
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl BucketCatalog for FileCatalog {
    async fn list_buckets(&self) -> anyhow::Result<Vec<MeteredBucket>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            anyhow::anyhow!("reading bucket catalog {}: {err}", self.path.display())
        })?;
        let buckets: Vec<MeteredBucket> = serde_json::from_str(&raw).map_err(|err| {
            anyhow::anyhow!("parsing bucket catalog {}: {err}", self.path.display())
        })?;
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger_service::RecordFilter;
    use crate::services::testing::test_pool;
    use std::collections::HashMap;

    /// Scripted source: fixed observation per uid, error for unknown uids.
    struct ScriptedSource {
        observations: HashMap<String, Observation>,
    }

    impl ScriptedSource {
        fn new(entries: &[(&str, i64, i64)]) -> Self {
            let observations = entries
                .iter()
                .map(|(uid, objects_count, bytes_total)| {
                    (
                        uid.to_string(),
                        Observation {
                            objects_count: *objects_count,
                            bytes_total: *bytes_total,
                        },
                    )
                })
                .collect();
            Self { observations }
        }
    }

    impl UsageSource for ScriptedSource {
        async fn observe(&self, bucket: &MeteredBucket) -> anyhow::Result<Observation> {
            self.observations
                .get(&bucket.uid)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("listing bucket `{}` failed", bucket.name))
        }
    }

    fn bucket(uid: &str) -> MeteredBucket {
        MeteredBucket {
            uid: uid.to_string(),
            name: format!("{uid}-name"),
            namespace: None,
            endpoint: "http://storage.local".to_string(),
        }
    }

    #[tokio::test]
    async fn sweep_survives_per_bucket_failures() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let meter = MeterService::new(
            ledger.clone(),
            RunService::new(db.clone()),
            ScriptedSource::new(&[("a", 1, 10), ("c", 3, 30)]),
        );

        let buckets = [bucket("a"), bucket("b"), bucket("c")];
        let run = meter.sweep("manual", &buckets).await.unwrap();

        assert!(run.end_time.is_some());
        assert_eq!(run.trigger, "manual");
        assert_eq!(run.all_uids, vec!["a", "b", "c"]);
        assert_eq!(run.failed_uids, vec!["b"]);
        assert_eq!(run.error_messages.len(), 1);
        assert!(run.error_messages[0].contains("b-name"));

        // The two healthy buckets produced records under this run; the
        // failed one produced nothing.
        let filter = RecordFilter {
            run_ids: Some(vec![run.id]),
            ..Default::default()
        };
        let mut uids: Vec<String> = ledger
            .query_records(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.bucket_uid)
            .collect();
        uids.sort();
        assert_eq!(uids, vec!["a", "c"]);
        assert!(ledger.current_record("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeat_sweeps_do_not_grow_the_ledger_when_usage_is_stable() {
        let db = test_pool().await;
        let ledger = LedgerService::new(db.clone());
        let meter = MeterService::new(
            ledger.clone(),
            RunService::new(db.clone()),
            ScriptedSource::new(&[("a", 1, 10)]),
        );

        let buckets = [bucket("a")];
        let first = meter.sweep("automatic", &buckets).await.unwrap();
        let second = meter.sweep("automatic", &buckets).await.unwrap();
        assert_ne!(first.id, second.id);

        let records = ledger.query_records(&RecordFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        // The record stays attributed to the run that first observed it.
        assert_eq!(records[0].run_id, first.id);
    }

    #[test]
    fn parses_a_list_page() {
        let xml = concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
            "<Name>photos</Name><KeyCount>2</KeyCount><IsTruncated>false</IsTruncated>",
            "<Contents><Key>a.jpg</Key><Size>100</Size></Contents>",
            "<Contents><Key>b.jpg</Key><Size>250</Size></Contents>",
            "</ListBucketResult>",
        );

        let page = parse_list_page(xml).unwrap();
        assert_eq!(
            page,
            ListPage {
                objects_count: 2,
                bytes_total: 350,
                next_token: None,
            }
        );
    }

    #[test]
    fn parses_a_truncated_page_and_empty_page() {
        let truncated = concat!(
            "<ListBucketResult><IsTruncated>true</IsTruncated>",
            "<NextContinuationToken>b2JqLTUwMA==</NextContinuationToken>",
            "<Contents><Key>x</Key><Size>7</Size></Contents>",
            "</ListBucketResult>",
        );
        let page = parse_list_page(truncated).unwrap();
        assert_eq!(page.objects_count, 1);
        assert_eq!(page.bytes_total, 7);
        assert_eq!(page.next_token.as_deref(), Some("b2JqLTUwMA=="));

        let empty = "<ListBucketResult><KeyCount>0</KeyCount><IsTruncated>false</IsTruncated></ListBucketResult>";
        let page = parse_list_page(empty).unwrap();
        assert_eq!(page.objects_count, 0);
        assert_eq!(page.bytes_total, 0);
        assert!(page.next_token.is_none());

        let bad = "<ListBucketResult><Contents><Size>huge</Size></Contents></ListBucketResult>";
        assert!(parse_list_page(bad).is_err());
    }
}
