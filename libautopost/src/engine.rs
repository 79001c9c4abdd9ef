//! Scheduling engine
//!
//! Owns the posting timer and the Idle/Armed/Paused/Posting state machine.
//! The engine is driven exclusively by the coordinator task, so none of its
//! state is shared or locked. Timer expiries come back to the coordinator as
//! [`Event::TimerFired`] messages carrying the generation they were armed
//! with; every re-arm bumps the generation, which turns any fire already
//! sitting in the channel into a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::WeakSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::caption::format_caption;
use crate::clock::{add_duration, elapsed_between, Clock};
use crate::config::PostingConfig;
use crate::coordinator::Event;
use crate::error::{AutopostError, Result, Throttle};
use crate::rate::RatePolicy;
use crate::services::{Alerter, Delivery, DeliveryRequest};
use crate::store::ContentStore;
use crate::types::{ExternalMessageRef, PostOutcome, Submission, SubmissionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Nothing to post, no timer
    Idle,
    /// Timer running toward the next attempt
    Armed,
    /// Timer deferred by a pause request
    Paused,
    /// An attempt is in flight
    Posting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Armed => write!(f, "armed"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Posting => write!(f, "posting"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub channel: String,
    pub signature: Option<String>,
    pub min_interval_between_posts: Duration,
    pub min_interval_between_pauses: Duration,
    pub alert_threshold: u64,
}

impl EngineSettings {
    pub fn from_config(posting: &PostingConfig) -> Self {
        Self {
            channel: posting.channel.clone(),
            signature: posting.signature.clone(),
            min_interval_between_posts: posting.min_interval_between_posts,
            min_interval_between_pauses: posting.min_interval_between_pauses,
            alert_threshold: posting.alert_threshold,
        }
    }
}

/// What a timer fire led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The fire belonged to a timer that was already replaced
    Stale,
    NothingPending,
    Posted {
        id: SubmissionId,
        external_ref: ExternalMessageRef,
    },
    /// A previously delivered submission was finally recorded as posted
    Reconciled { id: SubmissionId },
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: EngineState,
    pub interval: Option<Duration>,
    pub next_fire: Option<DateTime<Utc>>,
    pub edition: String,
}

/// The single outstanding sleep task
struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
    events: WeakSender<Event>,
}

impl Timer {
    fn new(events: WeakSender<Event>) -> Self {
        Self {
            generation: 0,
            task: None,
            events,
        }
    }

    /// Stop the running task and invalidate anything it already sent
    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Cancel, then start a new sleep task; returns its generation
    fn replace(&mut self, delay: Duration) -> u64 {
        self.cancel();
        let generation = self.generation;
        let events = self.events.clone();

        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = events.upgrade() {
                let _ = sender.send(Event::TimerFired { generation }).await;
            }
        }));

        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }

    /// The current task fired; it is no longer outstanding
    fn consume(&mut self) {
        self.task = None;
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct SchedulingEngine {
    store: Arc<dyn ContentStore>,
    delivery: Arc<dyn Delivery>,
    alerter: Arc<dyn Alerter>,
    policy: Arc<dyn RatePolicy>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    timer: Timer,
    state: EngineState,
    interval: Option<Duration>,
    armed_at: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
    previous_post: Option<DateTime<Utc>>,
    previous_pause: Option<DateTime<Utc>>,
    /// Delivered but not yet recorded as posted
    unreconciled: HashMap<SubmissionId, PostOutcome>,
    /// Delivery failed but the errored mark did not stick
    unmarked_failures: HashSet<SubmissionId>,
}

impl SchedulingEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        delivery: Arc<dyn Delivery>,
        alerter: Arc<dyn Alerter>,
        policy: Arc<dyn RatePolicy>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
        events: WeakSender<Event>,
    ) -> Self {
        Self {
            store,
            delivery,
            alerter,
            policy,
            clock,
            settings,
            timer: Timer::new(events),
            state: EngineState::Idle,
            interval: None,
            armed_at: None,
            next_fire: None,
            previous_post: None,
            previous_pause: None,
            unreconciled: HashMap::new(),
            unmarked_failures: HashSet::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Generation of the outstanding timer, if any
    pub fn timer_generation(&self) -> Option<u64> {
        self.timer.task.as_ref().map(|_| self.timer.generation)
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            interval: self.interval,
            next_fire: self.next_fire,
            edition: self.policy.name().to_string(),
        }
    }

    /// Advisory post time for the submission at `position`
    pub fn estimated_post_time(&self, position: u64, queue_length: u64) -> Option<DateTime<Utc>> {
        let base = self.next_fire?;
        Some(add_duration(
            base,
            self.policy.estimated_wait_for_position(position, queue_length),
        ))
    }

    /// Arm the timer if the engine is idle and something is queued
    ///
    /// Called after every insert and at startup. A no-op while a timer is
    /// already running, so a burst of submissions arms exactly once.
    pub async fn ensure_armed(&mut self) -> Result<()> {
        if self.state != EngineState::Idle {
            return Ok(());
        }

        let queue_length = self.store.queue_length().await?;
        if let Some(interval) = self.policy.interval_for_queue_length(queue_length) {
            info!(
                queue_length,
                interval = %humantime::format_duration(interval),
                "Queue no longer empty, arming"
            );
            self.arm(interval);
        }
        Ok(())
    }

    /// Handle a timer expiry
    ///
    /// Stale generations are ignored. Otherwise one posting attempt runs and
    /// the engine is rescheduled whatever its result; the attempt's error is
    /// returned for the coordinator to report.
    pub async fn on_timer_fired(&mut self, generation: u64) -> Result<AttemptOutcome> {
        if !self.timer.is_current(generation) {
            debug!(
                generation,
                current = self.timer.generation,
                "Ignoring stale timer fire"
            );
            return Ok(AttemptOutcome::Stale);
        }

        self.timer.consume();
        self.state = EngineState::Posting;

        let result = self.attempt().await;
        self.reschedule().await;
        result
    }

    async fn attempt(&mut self) -> Result<AttemptOutcome> {
        let now = self.clock.now();
        let minimum = self.settings.min_interval_between_posts;

        if let Some(previous) = self.previous_post {
            let elapsed = elapsed_between(previous, now);
            if elapsed < minimum {
                warn!(
                    elapsed = %humantime::format_duration(elapsed),
                    "Posting attempt too close to the previous post, skipping"
                );
                return Err(AutopostError::TooSoon {
                    throttle: Throttle::Posting,
                    elapsed,
                    minimum,
                });
            }
        }

        let submission = loop {
            let Some(submission) = self.store.next_pending().await? else {
                self.forget_all_except(None);
                debug!("Timer fired with an empty queue");
                return Ok(AttemptOutcome::NothingPending);
            };
            self.forget_all_except(Some(submission.id));

            if self.unmarked_failures.contains(&submission.id) {
                // Never delivered again, only the mark is retried
                self.store.mark_errored(submission.id).await?;
                self.unmarked_failures.remove(&submission.id);
                info!(submission_id = %submission.id, "Recorded earlier delivery failure");
                continue;
            }

            if let Some(outcome) = self.unreconciled.get(&submission.id).cloned() {
                return self.reconcile(&submission, outcome).await;
            }

            break submission;
        };

        let request = DeliveryRequest {
            kind: submission.kind,
            target: self.settings.channel.clone(),
            media: submission.media.clone(),
            caption: format_caption(&submission.caption, self.settings.signature.as_deref()),
        };

        let external_ref = match self.delivery.deliver(&request).await {
            Ok(external_ref) => external_ref,
            Err(e) => {
                warn!(submission_id = %submission.id, error = %e, "Delivery failed");
                if let Err(mark_error) = self.store.mark_errored(submission.id).await {
                    error!(
                        submission_id = %submission.id,
                        error = %mark_error,
                        "Could not mark submission as errored, retrying on the next fire"
                    );
                    self.unmarked_failures.insert(submission.id);
                }
                return Err(e.into());
            }
        };

        let posted_at = self.clock.now();
        self.previous_post = Some(posted_at);
        let outcome = PostOutcome {
            posted_at: posted_at.timestamp(),
            external_ref: external_ref.clone(),
        };

        if let Err(e) = self.store.mark_posted(submission.id, &outcome).await {
            self.unreconciled.insert(submission.id, outcome.clone());
            return Err(self.hazard(&submission, &outcome, e));
        }

        info!(
            submission_id = %submission.id,
            external_ref = %external_ref,
            "Posted submission"
        );
        Ok(AttemptOutcome::Posted {
            id: submission.id,
            external_ref,
        })
    }

    /// Record a delivery that happened earlier instead of delivering again
    async fn reconcile(
        &mut self,
        submission: &Submission,
        outcome: PostOutcome,
    ) -> Result<AttemptOutcome> {
        match self.store.mark_posted(submission.id, &outcome).await {
            Ok(()) => {
                self.unreconciled.remove(&submission.id);
                info!(
                    submission_id = %submission.id,
                    external_ref = %outcome.external_ref,
                    "Recorded previously delivered submission"
                );
                Ok(AttemptOutcome::Reconciled { id: submission.id })
            }
            Err(e) => Err(self.hazard(submission, &outcome, e)),
        }
    }

    /// Drop fix-ups for submissions that are no longer at the head of the queue
    ///
    /// Only the oldest pending submission is ever attempted, so an entry for
    /// any other id belongs to one that was deleted or otherwise left Pending.
    fn forget_all_except(&mut self, head: Option<SubmissionId>) {
        let keep = |id: &SubmissionId| Some(*id) == head;
        self.unreconciled.retain(|id, outcome| {
            let kept = keep(id);
            if !kept {
                warn!(
                    submission_id = %id,
                    external_ref = %outcome.external_ref,
                    "Delivered submission left the queue before it was recorded"
                );
            }
            kept
        });
        self.unmarked_failures.retain(|id| keep(id));
    }

    fn hazard(
        &self,
        submission: &Submission,
        outcome: &PostOutcome,
        cause: AutopostError,
    ) -> AutopostError {
        let reason = cause.to_string();
        error!(
            submission_id = %submission.id,
            external_ref = %outcome.external_ref,
            reason = %reason,
            "Reconciliation hazard"
        );
        self.alerter.reconciliation_hazard(submission, outcome, &reason);
        AutopostError::ReconciliationHazard {
            submission_id: submission.id,
            external_ref: outcome.external_ref.clone(),
            reason,
        }
    }

    /// Re-read the backlog and re-arm, or go idle
    async fn reschedule(&mut self) {
        let interval = match self.store.queue_length().await {
            Ok(queue_length) => {
                if queue_length < self.settings.alert_threshold {
                    self.alerter.notify_low_queue(queue_length);
                }
                self.policy.interval_for_queue_length(queue_length)
            }
            Err(e) => {
                warn!(error = %e, "Could not read queue length, keeping the previous interval");
                self.interval
            }
        };

        match interval {
            Some(interval) => self.arm(interval),
            None => self.disarm(),
        }
    }

    fn arm(&mut self, interval: Duration) {
        let now = self.clock.now();
        let generation = self.timer.replace(interval);

        self.state = EngineState::Armed;
        self.interval = Some(interval);
        self.armed_at = Some(now);
        self.next_fire = Some(add_duration(now, interval));

        debug!(
            generation,
            interval = %humantime::format_duration(interval),
            "Timer armed"
        );
    }

    fn disarm(&mut self) {
        self.timer.cancel();
        self.state = EngineState::Idle;
        self.interval = None;
        self.armed_at = None;
        self.next_fire = None;
        info!("Queue empty, timer disarmed");
    }

    /// Push the next attempt back by `duration`
    ///
    /// Returns the new target time.
    pub async fn pause(&mut self, duration: Duration) -> Result<DateTime<Utc>> {
        if duration.is_zero() {
            return Err(AutopostError::InvalidInput(
                "pause duration must be greater than zero".to_string(),
            ));
        }
        if self.state == EngineState::Idle {
            return Err(AutopostError::InvalidInput(
                "nothing is scheduled, there is nothing to pause".to_string(),
            ));
        }

        let now = self.clock.now();
        let minimum = self.settings.min_interval_between_pauses;
        if let Some(previous) = self.previous_pause {
            let elapsed = elapsed_between(previous, now);
            if elapsed < minimum {
                return Err(AutopostError::TooSoon {
                    throttle: Throttle::Pause,
                    elapsed,
                    minimum,
                });
            }
        }

        let target = add_duration(self.next_fire.unwrap_or(now), duration);
        let generation = self.timer.replace(elapsed_between(now, target));

        self.next_fire = Some(target);
        self.previous_pause = Some(now);
        self.state = EngineState::Paused;

        info!(
            generation,
            pause = %humantime::format_duration(duration),
            next_fire = %target,
            "Posting paused"
        );
        Ok(target)
    }

    /// Recompute the interval against the current backlog
    ///
    /// While armed, the target moves to `armed_at + new interval`, or to now
    /// if that moment has already passed. Paused targets are left alone.
    pub async fn refresh_rate(&mut self) -> Result<()> {
        match self.state {
            EngineState::Idle => return self.ensure_armed().await,
            EngineState::Paused | EngineState::Posting => return Ok(()),
            EngineState::Armed => {}
        }

        let queue_length = self.store.queue_length().await?;
        let Some(interval) = self.policy.interval_for_queue_length(queue_length) else {
            // The next fire finds the queue empty and disarms
            return Ok(());
        };
        if Some(interval) == self.interval {
            return Ok(());
        }

        let now = self.clock.now();
        let armed_at = self.armed_at.unwrap_or(now);
        let target = add_duration(armed_at, interval).max(now);
        let generation = self.timer.replace(elapsed_between(now, target));

        self.interval = Some(interval);
        self.next_fire = Some(target);

        info!(
            generation,
            queue_length,
            interval = %humantime::format_duration(interval),
            next_fire = %target,
            "Posting rate refreshed"
        );
        Ok(())
    }

    /// Stop the timer for good
    pub fn shutdown(&mut self) {
        self.timer.cancel();
        self.state = EngineState::Idle;
        self.next_fire = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TierConfig;
    use crate::db::Database;
    use crate::fingerprint::Fingerprint;
    use crate::mock::{FaultyStore, MockDelivery, RecordingAlerter};
    use crate::rate::{FixedPolicy, TieredPolicy};
    use crate::types::{MediaKind, MediaRef, NewSubmission, SubmissionState, UserId};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        _temp: TempDir,
        store: Arc<FaultyStore<Database>>,
        delivery: MockDelivery,
        alerter: RecordingAlerter,
        clock: Arc<ManualClock>,
        engine: SchedulingEngine,
        _sender: mpsc::Sender<Event>,
        receiver: mpsc::Receiver<Event>,
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            channel: "@channel".to_string(),
            signature: Some("@channel".to_string()),
            min_interval_between_posts: 5 * MINUTE,
            min_interval_between_pauses: 5 * MINUTE,
            alert_threshold: 10,
        }
    }

    async fn harness_with(policy: Arc<dyn RatePolicy>, settings: EngineSettings) -> Harness {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        let store = Arc::new(FaultyStore::new(db));

        let delivery = MockDelivery::success();
        let alerter = RecordingAlerter::new();
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let (sender, receiver) = mpsc::channel(16);

        let engine = SchedulingEngine::new(
            store.clone(),
            Arc::new(delivery.clone()),
            Arc::new(alerter.clone()),
            policy,
            clock.clone(),
            settings,
            sender.downgrade(),
        );

        Harness {
            _temp: temp,
            store,
            delivery,
            alerter,
            clock,
            engine,
            _sender: sender,
            receiver,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(FixedPolicy::new(30 * MINUTE)), settings()).await
    }

    impl Harness {
        async fn submit(&self, media: &str, submitted_at: i64) -> SubmissionId {
            self.store
                .inner()
                .insert_with_timestamp(
                    &NewSubmission {
                        kind: MediaKind::Image,
                        media: MediaRef(media.to_string()),
                        fingerprint: Fingerprint::new(vec![1.0, 2.0], "ff00"),
                        submitted_by: UserId(1),
                        caption: format!("caption {}", media),
                    },
                    submitted_at,
                )
                .await
                .unwrap()
        }

        async fn fire(&mut self) -> Result<AttemptOutcome> {
            let generation = self.engine.timer_generation().unwrap();
            self.engine.on_timer_fired(generation).await
        }

        async fn state_of(&self, media: &str) -> SubmissionState {
            self.store
                .find_by_reference(&MediaRef(media.to_string()))
                .await
                .unwrap()
                .state()
        }
    }

    #[tokio::test]
    async fn test_burst_of_submissions_arms_once_and_posts_oldest() {
        let mut h = harness().await;
        assert_eq!(h.engine.state(), EngineState::Idle);

        let first = h.submit("first", 0).await;
        h.engine.ensure_armed().await.unwrap();
        let generation = h.engine.timer_generation().unwrap();
        let target = h.engine.next_fire().unwrap();

        h.submit("second", 1).await;
        h.engine.ensure_armed().await.unwrap();
        h.submit("third", 2).await;
        h.engine.ensure_armed().await.unwrap();

        assert_eq!(h.engine.timer_generation(), Some(generation));
        assert_eq!(h.engine.next_fire(), Some(target));
        assert_eq!(h.engine.state(), EngineState::Armed);

        let outcome = h.engine.on_timer_fired(generation).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Posted { id, .. } if id == first));

        let delivered = h.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].media.0, "first");
        assert_eq!(delivered[0].caption, "caption first\n\n@channel");
        assert_eq!(delivered[0].target, "@channel");
        assert_eq!(h.state_of("first").await, SubmissionState::Posted);
    }

    #[tokio::test]
    async fn test_ensure_armed_with_empty_queue_stays_idle() {
        let mut h = harness().await;
        h.engine.ensure_armed().await.unwrap();
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.timer_generation(), None);
    }

    #[tokio::test]
    async fn test_posting_too_soon_skips_delivery_and_rearms() {
        let mut h = harness().await;
        h.submit("a", 0).await;
        h.submit("b", 1).await;
        h.engine.ensure_armed().await.unwrap();

        h.fire().await.unwrap();
        assert_eq!(h.delivery.attempt_count(), 1);

        h.clock.advance(MINUTE);
        let result = h.fire().await;
        assert!(matches!(
            result,
            Err(AutopostError::TooSoon {
                throttle: Throttle::Posting,
                ..
            })
        ));
        assert_eq!(h.delivery.attempt_count(), 1);
        assert_eq!(h.engine.state(), EngineState::Armed);
        assert_eq!(h.state_of("b").await, SubmissionState::Pending);

        h.clock.advance(5 * MINUTE);
        let outcome = h.fire().await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Posted { .. }));
        assert_eq!(h.delivery.attempt_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_fire_after_reschedule_does_not_deliver_twice() {
        let mut h = harness().await;
        h.submit("a", 0).await;
        h.submit("b", 1).await;
        h.engine.ensure_armed().await.unwrap();

        let old_generation = h.engine.timer_generation().unwrap();
        h.engine.on_timer_fired(old_generation).await.unwrap();
        assert_eq!(h.delivery.attempt_count(), 1);

        // The same fire dequeued again after the reschedule
        h.clock.advance(10 * MINUTE);
        let outcome = h.engine.on_timer_fired(old_generation).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Stale);
        assert_eq!(h.delivery.attempt_count(), 1);
        assert_eq!(h.state_of("b").await, SubmissionState::Pending);
    }

    #[tokio::test]
    async fn test_buffered_fire_is_discarded_after_pause() {
        let mut h = harness_with(
            Arc::new(FixedPolicy::new(Duration::from_millis(10))),
            settings(),
        )
        .await;
        h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();

        // Let the timer task deliver its fire into the channel
        let buffered = h.receiver.recv().await.unwrap();
        let Event::TimerFired { generation } = buffered else {
            panic!("expected a timer fire");
        };

        h.engine.pause(5 * MINUTE).await.unwrap();
        let outcome = h.engine.on_timer_fired(generation).await.unwrap();

        assert_eq!(outcome, AttemptOutcome::Stale);
        assert_eq!(h.delivery.attempt_count(), 0);
        assert_eq!(h.engine.state(), EngineState::Paused);
    }

    #[tokio::test]
    async fn test_pause_throttle_and_target_push() {
        let mut h = harness().await;
        h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();
        let start = h.clock.now();
        assert_eq!(h.engine.next_fire(), Some(start + chrono::Duration::minutes(30)));

        let target = h.engine.pause(5 * MINUTE).await.unwrap();
        assert_eq!(target, start + chrono::Duration::minutes(35));
        assert_eq!(h.engine.state(), EngineState::Paused);

        h.clock.advance(MINUTE);
        let result = h.engine.pause(5 * MINUTE).await;
        assert!(matches!(
            result,
            Err(AutopostError::TooSoon {
                throttle: Throttle::Pause,
                ..
            })
        ));
        assert_eq!(h.engine.next_fire(), Some(start + chrono::Duration::minutes(35)));

        h.clock.advance(5 * MINUTE);
        let target = h.engine.pause(5 * MINUTE).await.unwrap();
        assert_eq!(target, start + chrono::Duration::minutes(40));
    }

    #[tokio::test]
    async fn test_pause_while_idle_is_invalid() {
        let mut h = harness().await;
        let result = h.engine.pause(5 * MINUTE).await;
        assert!(matches!(result, Err(AutopostError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_fire_while_paused_posts() {
        let mut h = harness().await;
        h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();
        h.engine.pause(5 * MINUTE).await.unwrap();

        let outcome = h.fire().await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Posted { .. }));
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_delivery_failure_marks_errored_and_moves_on() {
        let mut h = harness().await;
        h.submit("bad", 0).await;
        h.submit("good", 1).await;
        h.engine.ensure_armed().await.unwrap();
        h.delivery.set_succeeds(false);

        let result = h.fire().await;
        assert!(matches!(result, Err(AutopostError::Service(_))));
        assert_eq!(h.state_of("bad").await, SubmissionState::Errored);
        assert_eq!(h.engine.state(), EngineState::Armed);

        // A failure does not count as a post for the spacing throttle
        h.delivery.set_succeeds(true);
        let outcome = h.fire().await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Posted { .. }));
        assert_eq!(h.state_of("good").await, SubmissionState::Posted);
    }

    #[tokio::test]
    async fn test_failed_mark_after_delivery_is_reconciled_without_redelivery() {
        let mut settings = settings();
        settings.min_interval_between_posts = Duration::ZERO;
        let mut h = harness_with(Arc::new(FixedPolicy::new(30 * MINUTE)), settings).await;
        let id = h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();
        h.store.fail_mark_posted(true);

        let result = h.fire().await;
        assert!(matches!(
            result,
            Err(AutopostError::ReconciliationHazard { submission_id, .. }) if submission_id == id
        ));
        assert_eq!(h.delivery.attempt_count(), 1);
        assert_eq!(h.alerter.hazards().len(), 1);
        assert_eq!(h.state_of("a").await, SubmissionState::Pending);

        // Still failing: abandoned again, still no second delivery
        let result = h.fire().await;
        assert!(matches!(result, Err(AutopostError::ReconciliationHazard { .. })));
        assert_eq!(h.delivery.attempt_count(), 1);
        assert_eq!(h.alerter.hazards().len(), 2);

        h.store.fail_mark_posted(false);
        let outcome = h.fire().await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Reconciled { id });
        assert_eq!(h.delivery.attempt_count(), 1);

        let stored = h.store.find_by_reference(&MediaRef("a".into())).await.unwrap();
        assert_eq!(stored.outcome.unwrap().external_ref.0, "msg-1");
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_failed_item_is_not_delivered_again_when_errored_mark_fails() {
        let mut h = harness().await;
        h.submit("bad", 0).await;
        h.submit("good", 1).await;
        h.engine.ensure_armed().await.unwrap();
        h.delivery.set_succeeds(false);
        h.store.fail_mark_errored(true);

        let result = h.fire().await;
        assert!(matches!(result, Err(AutopostError::Service(_))));
        assert_eq!(h.state_of("bad").await, SubmissionState::Pending);

        // The mark still fails: no delivery, the item stays at the head
        h.clock.advance(10 * MINUTE);
        let result = h.fire().await;
        assert!(matches!(result, Err(AutopostError::Persistence(_))));
        assert_eq!(h.delivery.attempt_count(), 1);

        h.clock.advance(10 * MINUTE);
        h.store.fail_mark_errored(false);
        h.delivery.set_succeeds(true);
        let outcome = h.fire().await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Posted { .. }));
        assert_eq!(h.state_of("bad").await, SubmissionState::Errored);
        assert_eq!(h.state_of("good").await, SubmissionState::Posted);
        assert_eq!(h.delivery.attempt_count(), 2);
        let delivered = h.delivery.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].media.0, "good");
        assert!(h.engine.unmarked_failures.is_empty());
    }

    #[tokio::test]
    async fn test_unrecorded_delivery_is_forgotten_once_deleted() {
        let mut settings = settings();
        settings.min_interval_between_posts = Duration::ZERO;
        let mut h = harness_with(Arc::new(FixedPolicy::new(30 * MINUTE)), settings).await;
        let first = h.submit("a", 0).await;
        h.submit("b", 1).await;
        h.engine.ensure_armed().await.unwrap();

        h.store.fail_mark_posted(true);
        assert!(h.fire().await.is_err());
        assert!(h.engine.unreconciled.contains_key(&first));

        h.store.mark_deleted(first).await.unwrap();
        h.store.fail_mark_posted(false);
        let outcome = h.fire().await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Posted { .. }));
        assert_eq!(h.state_of("b").await, SubmissionState::Posted);
        assert!(h.engine.unreconciled.is_empty());
    }

    #[tokio::test]
    async fn test_low_queue_alert_on_reschedule() {
        let mut h = harness().await;
        for i in 0..3 {
            h.submit(&format!("m{}", i), i).await;
        }
        h.engine.ensure_armed().await.unwrap();
        h.fire().await.unwrap();

        assert_eq!(h.alerter.low_queue_alerts(), vec![2]);
    }

    #[tokio::test]
    async fn test_empty_queue_fire_goes_idle() {
        let mut h = harness().await;
        let id = h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();
        h.store.mark_deleted(id).await.unwrap();

        let outcome = h.fire().await.unwrap();
        assert_eq!(outcome, AttemptOutcome::NothingPending);
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.timer_generation(), None);
        assert_eq!(h.delivery.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_length_failure_keeps_previous_interval() {
        let mut settings = settings();
        settings.min_interval_between_posts = Duration::ZERO;
        let mut h = harness_with(Arc::new(FixedPolicy::new(30 * MINUTE)), settings).await;
        h.submit("a", 0).await;
        h.submit("b", 1).await;
        h.engine.ensure_armed().await.unwrap();

        h.store.fail_queue_length(true);
        h.fire().await.unwrap();

        assert_eq!(h.engine.state(), EngineState::Armed);
        assert_eq!(h.engine.status().interval, Some(30 * MINUTE));
    }

    fn two_step_policy() -> Arc<dyn RatePolicy> {
        Arc::new(
            TieredPolicy::from_config(&[
                TierConfig {
                    up_to: Some(1),
                    interval: 60 * MINUTE,
                },
                TierConfig {
                    up_to: None,
                    interval: 10 * MINUTE,
                },
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_refresh_rate_moves_target_from_armed_time() {
        let mut h = harness_with(two_step_policy(), settings()).await;
        let start = h.clock.now();
        h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();
        assert_eq!(h.engine.next_fire(), Some(start + chrono::Duration::minutes(60)));

        h.submit("b", 1).await;
        h.clock.advance(5 * MINUTE);
        h.engine.refresh_rate().await.unwrap();

        assert_eq!(h.engine.next_fire(), Some(start + chrono::Duration::minutes(10)));
        assert_eq!(h.engine.status().interval, Some(10 * MINUTE));
    }

    #[tokio::test]
    async fn test_refresh_rate_never_targets_the_past() {
        let mut h = harness_with(two_step_policy(), settings()).await;
        h.submit("a", 0).await;
        h.engine.ensure_armed().await.unwrap();

        h.submit("b", 1).await;
        h.clock.advance(20 * MINUTE);
        h.engine.refresh_rate().await.unwrap();

        assert_eq!(h.engine.next_fire(), Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_status_and_estimate() {
        let mut h = harness().await;
        h.submit("a", 0).await;
        h.submit("b", 1).await;
        h.engine.ensure_armed().await.unwrap();

        let status = h.engine.status();
        assert_eq!(status.state, EngineState::Armed);
        assert_eq!(status.edition, "fixed");

        let next = h.engine.next_fire().unwrap();
        assert_eq!(h.engine.estimated_post_time(1, 2), Some(next));
        assert_eq!(
            h.engine.estimated_post_time(2, 2),
            Some(next + chrono::Duration::minutes(30))
        );
    }
}
