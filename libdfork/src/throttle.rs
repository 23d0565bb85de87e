//! Bounded-concurrency sweep over a range of object indices.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{debug, warn};

use crate::error::{DforkError, Result};
use crate::progress::{NoProgress, ProgressContext};

/// What a per-object operation ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    Done,
    /// Nothing to do for this index, e.g. the object map says it was never
    /// written.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleSummary {
    pub done: u64,
    pub skipped: u64,
}

/// Drives one operation per index of `range` with at most `concurrency` of
/// them outstanding.
///
/// Failure policy: an index whose operation reports `NotFound` counts as
/// done. Any other failure is recorded, the first one is returned once the
/// whole range has been processed, and the remaining operations keep
/// running. There is no cancellation once a sweep has started.
pub struct AsyncObjectThrottle {
    range: Range<u64>,
    concurrency: usize,
    progress: Arc<dyn ProgressContext>,
}

impl AsyncObjectThrottle {
    pub fn new(range: Range<u64>, concurrency: usize, progress: Arc<dyn ProgressContext>) -> Self {
        Self {
            range,
            concurrency: concurrency.max(1),
            progress,
        }
    }

    pub fn without_progress(range: Range<u64>, concurrency: usize) -> Self {
        Self::new(range, concurrency, Arc::new(NoProgress))
    }

    pub fn total(&self) -> u64 {
        self.range.end.saturating_sub(self.range.start)
    }

    pub async fn run<F, Fut>(&self, mut op: F) -> Result<ThrottleSummary>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<ObjectOutcome>>,
    {
        let total = self.total();
        let mut in_flight = stream::iter(self.range.clone())
            .map(move |object_no| {
                let fut = op(object_no);
                async move { (object_no, fut.await) }
            })
            .buffer_unordered(self.concurrency);

        let mut summary = ThrottleSummary::default();
        let mut first_error: Option<DforkError> = None;
        let mut completed = 0u64;
        while let Some((object_no, result)) = in_flight.next().await {
            completed += 1;
            match result {
                Ok(ObjectOutcome::Done) => summary.done += 1,
                Ok(ObjectOutcome::Skipped) => summary.skipped += 1,
                Err(e) if e.is_not_found() => {
                    debug!(object_no, "object already absent");
                    summary.done += 1;
                }
                Err(e) => {
                    warn!(object_no, error = %e, "object operation failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            self.progress.update_progress(completed, total);
        }
        self.progress.finish();

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}
