//! Content store contract
//!
//! The durable queue of submissions. Any backend must honor the semantics
//! documented on each method; [`crate::db::Database`] is the SQLite
//! implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::fingerprint::HistogramRange;
use crate::types::{
    ExternalMessageRef, MediaRef, NewSubmission, PostOutcome, QueueCounts, Submission,
    SubmissionId,
};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Append a pending submission, stamping it with the store's clock
    ///
    /// # Errors
    ///
    /// Returns `InvalidFingerprint` for an unusable fingerprint and
    /// `Persistence` when the write fails.
    async fn insert(&self, submission: &NewSubmission) -> Result<SubmissionId>;

    /// Exact lookup by media reference, in any state
    async fn find_by_reference(&self, media: &MediaRef) -> Result<Submission>;

    /// Exact lookup by the message created on the channel
    async fn find_by_external_ref(&self, external: &ExternalMessageRef) -> Result<Submission>;

    /// All submissions (any state) whose derived histogram average and sum
    /// both fall in the closed intervals of `range`; order is unspecified
    async fn candidates_by_histogram_range(&self, range: &HistogramRange)
        -> Result<Vec<Submission>>;

    /// Replace the caption of a pending submission
    async fn update_caption(&self, id: SubmissionId, caption: &str) -> Result<()>;

    /// Record a delivery; a no-op on posted or deleted entries
    async fn mark_posted(&self, id: SubmissionId, outcome: &PostOutcome) -> Result<()>;

    /// Remove from the active queue after a failed delivery; a no-op on
    /// posted or deleted entries
    async fn mark_errored(&self, id: SubmissionId) -> Result<()>;

    /// Terminal transition from any state; a no-op when already deleted
    async fn mark_deleted(&self, id: SubmissionId) -> Result<()>;

    async fn queue_length(&self) -> Result<u64>;

    /// Oldest pending submission, ties broken by ascending id
    async fn next_pending(&self) -> Result<Option<Submission>>;

    /// 1-based rank among pending submissions; `NotFound` if not pending
    async fn position_of(&self, id: SubmissionId) -> Result<u64>;

    /// Pending submissions in posting order
    async fn list_pending(&self, limit: usize) -> Result<Vec<Submission>>;

    async fn counts(&self) -> Result<QueueCounts>;
}
