//! Represents an externally managed bucket scheduled for metering.

use serde::{Deserialize, Serialize};

/// A bucket the sweep should measure.
///
/// Buckets are not created or owned by this service; the catalog hands the
/// sweep a resolved view of each one — its stable uid, its name at the
/// storage endpoint, and the endpoint itself. Credential resolution happens
/// upstream of this type.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MeteredBucket {
    /// Stable external identifier; keys the ledger.
    pub uid: String,

    /// Bucket name as known to the storage endpoint.
    pub name: String,

    /// Logical grouping the bucket belongs to, when the catalog has one.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Base URL of the S3-compatible endpoint hosting the bucket.
    pub endpoint: String,
}
