//! Query/function evaluator seam.
//!
//! The query language and execution planner live outside this crate; what
//! arrives here is an opaque compiled operation to run against one locally
//! hosted bucket. Results come back as a finite lazy sequence, restartable
//! only by re-invoking.

use crate::directory::{BucketId, RegionId};
use crate::ops::FailureKind;
use crate::storage::BucketStorage;

use bytes::Bytes;

/// A finite sequence of serialized result objects. Items may carry a typed
/// failure mid-scan (e.g. the low-memory guard tripping).
pub type ResultSeq =
    Box<dyn Iterator<Item = Result<Bytes, FailureKind>> + Send>;

/// Evaluates an opaque compiled operation against one local bucket.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        region: RegionId,
        bucket: BucketId,
        compiled: &Bytes,
        storage: &dyn BucketStorage,
    ) -> Result<ResultSeq, FailureKind>;
}

/// Default evaluator: a full bucket scan yielding each entry as an encoded
/// `(key, value)` pair, ignoring the compiled operation. Stands in for the
/// real planner in tests and for fetch-everything queries.
pub struct ScanEvaluator;

impl Evaluator for ScanEvaluator {
    fn evaluate(
        &self,
        region: RegionId,
        bucket: BucketId,
        _compiled: &Bytes,
        storage: &dyn BucketStorage,
    ) -> Result<ResultSeq, FailureKind> {
        let pairs = storage.scan(region, bucket).map_err(|e| {
            FailureKind::Application {
                detail: e.to_string(),
            }
        })?;
        let objects = pairs.into_iter().map(|(key, value)| {
            let obj = rmp_serde::to_vec(&(key.as_ref(), value.as_ref()))
                .map_err(|e| FailureKind::Application {
                    detail: e.to_string(),
                })?;
            Ok(Bytes::from(obj))
        });
        Ok(Box::new(objects.collect::<Vec<_>>().into_iter()))
    }
}
