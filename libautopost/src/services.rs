//! External collaborators
//!
//! The core never talks to the chat platform or the media analysis backend
//! directly. Each concern is a trait injected at construction time, so tests
//! and deployments can swap implementations freely (see [`crate::mock`]).

use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::ServiceError;
use crate::fingerprint::Fingerprint;
use crate::types::{ExternalMessageRef, MediaKind, MediaRef, PostOutcome, Submission, UserId};

/// Media analysis backend
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    async fn fingerprint(
        &self,
        media: &MediaRef,
        kind: MediaKind,
    ) -> std::result::Result<Fingerprint, ServiceError>;
}

/// What the engine hands to the delivery collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub kind: MediaKind,
    /// Channel the media is posted to
    pub target: String,
    pub media: MediaRef,
    /// Final caption, signature included
    pub caption: String,
}

/// Publishes media to the target channel
///
/// Called exactly once per posting attempt. A returned error means the
/// attempt failed; the engine never retries the same submission on its own.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> std::result::Result<ExternalMessageRef, ServiceError>;
}

/// Operational alerts
///
/// Fire-and-forget: implementations must return promptly and must not fail
/// the caller. Anything slow belongs in a task spawned by the implementation.
pub trait Alerter: Send + Sync {
    /// The backlog dropped below the configured threshold
    fn notify_low_queue(&self, pending: u64);

    /// A delivery succeeded but could not be recorded locally
    fn reconciliation_hazard(&self, submission: &Submission, outcome: &PostOutcome, reason: &str);
}

/// Resolves user ids to names for info reports, best effort
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user: UserId) -> Option<String>;
}

/// Default alerter that only writes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn notify_low_queue(&self, pending: u64) {
        warn!(pending, "Queue is running low");
    }

    fn reconciliation_hazard(&self, submission: &Submission, outcome: &PostOutcome, reason: &str) {
        error!(
            submission_id = %submission.id,
            media = %submission.media,
            external_ref = %outcome.external_ref,
            reason,
            "Delivered submission could not be marked as posted; manual reconciliation required"
        );
    }
}
