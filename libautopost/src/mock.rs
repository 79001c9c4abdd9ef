//! Mock collaborators for testing
//!
//! Compiled in all builds (not just `cfg(test)`) so that integration tests
//! under `tests/` can drive the coordinator without a chat platform or a
//! media analysis backend. Every mock records what it was asked to do.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AutopostError, DbError, Result, ServiceError};
use crate::fingerprint::{Fingerprint, HistogramRange};
use crate::services::{Alerter, Delivery, DeliveryRequest, Fingerprinter, UserDirectory};
use crate::store::ContentStore;
use crate::types::{
    ExternalMessageRef, MediaKind, MediaRef, NewSubmission, PostOutcome, QueueCounts, Submission,
    SubmissionId, UserId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fingerprinter answering from a fixed table
///
/// Media missing from the table fail with a service error, like media the
/// real backend cannot decode.
#[derive(Clone, Default)]
pub struct MockFingerprinter {
    known: Arc<Mutex<HashMap<MediaRef, Fingerprint>>>,
    calls: Arc<AtomicUsize>,
}

impl MockFingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, media: &str, fingerprint: Fingerprint) -> Self {
        self.insert(media, fingerprint);
        self
    }

    pub fn insert(&self, media: &str, fingerprint: Fingerprint) {
        lock(&self.known).insert(MediaRef(media.to_string()), fingerprint);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fingerprinter for MockFingerprinter {
    async fn fingerprint(
        &self,
        media: &MediaRef,
        _kind: MediaKind,
    ) -> std::result::Result<Fingerprint, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.known)
            .get(media)
            .cloned()
            .ok_or_else(|| ServiceError::Fingerprint(format!("cannot decode {}", media)))
    }
}

/// Delivery that records every request
#[derive(Clone)]
pub struct MockDelivery {
    succeeds: Arc<AtomicBool>,
    delivered: Arc<Mutex<Vec<DeliveryRequest>>>,
    attempts: Arc<AtomicUsize>,
}

impl Default for MockDelivery {
    fn default() -> Self {
        Self {
            succeeds: Arc::new(AtomicBool::new(true)),
            delivered: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockDelivery {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure() -> Self {
        let delivery = Self::default();
        delivery.set_succeeds(false);
        delivery
    }

    pub fn set_succeeds(&self, succeeds: bool) {
        self.succeeds.store(succeeds, Ordering::SeqCst);
    }

    /// Number of `deliver` calls, failed ones included
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Requests that were delivered successfully, in order
    pub fn delivered(&self) -> Vec<DeliveryRequest> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> std::result::Result<ExternalMessageRef, ServiceError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.succeeds.load(Ordering::SeqCst) {
            return Err(ServiceError::Delivery("mock delivery failed".to_string()));
        }

        lock(&self.delivered).push(request.clone());
        Ok(ExternalMessageRef(format!("msg-{}", attempt)))
    }
}

/// Alerter keeping every alert for later inspection
#[derive(Clone, Default)]
pub struct RecordingAlerter {
    low_queue: Arc<Mutex<Vec<u64>>>,
    hazards: Arc<Mutex<Vec<(SubmissionId, ExternalMessageRef)>>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn low_queue_alerts(&self) -> Vec<u64> {
        lock(&self.low_queue).clone()
    }

    pub fn hazards(&self) -> Vec<(SubmissionId, ExternalMessageRef)> {
        lock(&self.hazards).clone()
    }
}

impl Alerter for RecordingAlerter {
    fn notify_low_queue(&self, pending: u64) {
        lock(&self.low_queue).push(pending);
    }

    fn reconciliation_hazard(&self, submission: &Submission, outcome: &PostOutcome, _reason: &str) {
        lock(&self.hazards).push((submission.id, outcome.external_ref.clone()));
    }
}

#[derive(Clone, Default)]
pub struct MockDirectory {
    names: HashMap<UserId, String>,
}

impl MockDirectory {
    pub fn with(mut self, user: i64, name: &str) -> Self {
        self.names.insert(UserId(user), name.to_string());
        self
    }
}

#[async_trait]
impl UserDirectory for MockDirectory {
    async fn display_name(&self, user: UserId) -> Option<String> {
        self.names.get(&user).cloned()
    }
}

/// Store wrapper that fails selected operations on demand
pub struct FaultyStore<S> {
    inner: S,
    fail_range_query: AtomicBool,
    fail_mark_posted: AtomicBool,
    fail_mark_errored: AtomicBool,
    fail_queue_length: AtomicBool,
    fail_position_of: AtomicBool,
}

impl<S: ContentStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_range_query: AtomicBool::new(false),
            fail_mark_posted: AtomicBool::new(false),
            fail_mark_errored: AtomicBool::new(false),
            fail_queue_length: AtomicBool::new(false),
            fail_position_of: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_range_query(&self, fail: bool) {
        self.fail_range_query.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_posted(&self, fail: bool) {
        self.fail_mark_posted.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_errored(&self, fail: bool) {
        self.fail_mark_errored.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queue_length(&self, fail: bool) {
        self.fail_queue_length.store(fail, Ordering::SeqCst);
    }

    pub fn fail_position_of(&self, fail: bool) {
        self.fail_position_of.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(AutopostError::Persistence(DbError::Unavailable(format!(
                "injected failure in {}",
                operation
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ContentStore> ContentStore for FaultyStore<S> {
    async fn insert(&self, submission: &NewSubmission) -> Result<SubmissionId> {
        self.inner.insert(submission).await
    }

    async fn find_by_reference(&self, media: &MediaRef) -> Result<Submission> {
        self.inner.find_by_reference(media).await
    }

    async fn find_by_external_ref(&self, external: &ExternalMessageRef) -> Result<Submission> {
        self.inner.find_by_external_ref(external).await
    }

    async fn candidates_by_histogram_range(
        &self,
        range: &HistogramRange,
    ) -> Result<Vec<Submission>> {
        Self::check(&self.fail_range_query, "candidates_by_histogram_range")?;
        self.inner.candidates_by_histogram_range(range).await
    }

    async fn update_caption(&self, id: SubmissionId, caption: &str) -> Result<()> {
        self.inner.update_caption(id, caption).await
    }

    async fn mark_posted(&self, id: SubmissionId, outcome: &PostOutcome) -> Result<()> {
        Self::check(&self.fail_mark_posted, "mark_posted")?;
        self.inner.mark_posted(id, outcome).await
    }

    async fn mark_errored(&self, id: SubmissionId) -> Result<()> {
        Self::check(&self.fail_mark_errored, "mark_errored")?;
        self.inner.mark_errored(id).await
    }

    async fn mark_deleted(&self, id: SubmissionId) -> Result<()> {
        self.inner.mark_deleted(id).await
    }

    async fn queue_length(&self) -> Result<u64> {
        Self::check(&self.fail_queue_length, "queue_length")?;
        self.inner.queue_length().await
    }

    async fn next_pending(&self) -> Result<Option<Submission>> {
        self.inner.next_pending().await
    }

    async fn position_of(&self, id: SubmissionId) -> Result<u64> {
        Self::check(&self.fail_position_of, "position_of")?;
        self.inner.position_of(id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Submission>> {
        self.inner.list_pending(limit).await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.inner.counts().await
    }
}
