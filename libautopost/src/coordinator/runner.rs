use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::CoordinatorHandle;
use super::messages::{
    Event, Reply, StatusReport, SubmissionInfo, SubmissionOutcome, SubmitRequest,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::detector::DuplicateDetector;
use crate::engine::{AttemptOutcome, EngineSettings, SchedulingEngine};
use crate::error::{AutopostError, Result};
use crate::rate::build_policy;
use crate::services::{Alerter, Delivery, Fingerprinter, TracingAlerter, UserDirectory};
use crate::store::ContentStore;
use crate::types::{ExternalMessageRef, MediaRef, NewSubmission};

const EVENT_BUFFER: usize = 64;

/// Everything the coordinator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ContentStore>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    pub delivery: Arc<dyn Delivery>,
    pub alerter: Arc<dyn Alerter>,
    pub directory: Option<Arc<dyn UserDirectory>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Log-only alerts, no user directory, system clock
    pub fn new(
        store: Arc<dyn ContentStore>,
        fingerprinter: Arc<dyn Fingerprinter>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            store,
            fingerprinter,
            delivery,
            alerter: Arc::new(TracingAlerter),
            directory: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Coordinator {
    store: Arc<dyn ContentStore>,
    fingerprinter: Arc<dyn Fingerprinter>,
    directory: Option<Arc<dyn UserDirectory>>,
    detector: DuplicateDetector,
    engine: SchedulingEngine,
    receiver: mpsc::Receiver<Event>,
    events: mpsc::WeakSender<Event>,
    rate_refresh: Duration,
    ticker: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Build a coordinator and the handle feeding it, without starting it
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<(Self, CoordinatorHandle)> {
        config.validate()?;
        let policy = build_policy(&config.rate)?;

        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let events = sender.downgrade();

        let engine = SchedulingEngine::new(
            collaborators.store.clone(),
            collaborators.delivery,
            collaborators.alerter,
            policy,
            collaborators.clock,
            EngineSettings::from_config(&config.posting),
            events.clone(),
        );

        let coordinator = Self {
            store: collaborators.store,
            fingerprinter: collaborators.fingerprinter,
            directory: collaborators.directory,
            detector: DuplicateDetector::from_config(&config.matching),
            engine,
            receiver,
            events,
            rate_refresh: config.posting.rate_refresh,
            ticker: None,
        };

        Ok((coordinator, CoordinatorHandle::new(sender)))
    }

    /// Build and start the coordinator on the current runtime
    pub fn spawn(
        config: &Config,
        collaborators: Collaborators,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>)> {
        let (coordinator, handle) = Self::new(config, collaborators)?;
        let task = tokio::spawn(coordinator.run());
        Ok((handle, task))
    }

    /// Consume events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(edition = %self.engine.status().edition, "Coordinator started");

        // Submissions persisted by a previous run
        if let Err(e) = self.engine.ensure_armed().await {
            warn!(error = %e, "Could not read the queue at startup, waiting for the next event");
        }
        self.start_ticker();

        while let Some(event) = self.receiver.recv().await {
            if matches!(event, Event::Shutdown) {
                info!("Shutdown requested");
                break;
            }
            self.handle(event).await;
        }

        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.engine.shutdown();
        info!("Coordinator stopped");
    }

    fn start_ticker(&mut self) {
        let events = self.events.clone();
        let period = self.rate_refresh;

        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sender) = events.upgrade() else {
                    break;
                };
                if sender.send(Event::RefreshRate).await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn handle(&mut self, event: Event) {
        let name = event.name();
        debug!(event = name, "Handling event");

        match event {
            Event::Submit { request, reply } => {
                let result = self.submit(request).await;
                respond(name, reply, result);
            }
            Event::EditCaption {
                media,
                caption,
                reply,
            } => {
                let result = self.edit_caption(&media, &caption).await;
                respond(name, reply, result);
            }
            Event::Delete { media, reply } => {
                let result = self.delete(&media).await;
                respond(name, reply, result);
            }
            Event::DeletionNotice { external_refs } => {
                self.apply_deletion_notice(&external_refs).await;
            }
            Event::Pause { duration, reply } => {
                let result = self.engine.pause(duration).await;
                respond(name, reply, result);
            }
            Event::Status { reply } => {
                let result = self.status().await;
                respond(name, reply, result);
            }
            Event::Info { media, reply } => {
                let result = self.info(&media).await;
                respond(name, reply, result);
            }
            Event::TimerFired { generation } => match self.engine.on_timer_fired(generation).await
            {
                Ok(AttemptOutcome::Stale) => {}
                Ok(outcome) => debug!(?outcome, "Posting attempt finished"),
                Err(e) => log_failure(name, &e),
            },
            Event::RefreshRate => {
                if let Err(e) = self.engine.refresh_rate().await {
                    log_failure(name, &e);
                }
            }
            Event::Shutdown => {}
        }
    }

    async fn submit(&mut self, request: SubmitRequest) -> Result<SubmissionOutcome> {
        match self.store.find_by_reference(&request.media).await {
            Ok(existing) => {
                info!(media = %request.media, submission_id = %existing.id, "Media already known");
                return Ok(SubmissionOutcome::Duplicate(Box::new(existing)));
            }
            Err(AutopostError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let fingerprint = self
            .fingerprinter
            .fingerprint(&request.media, request.kind)
            .await?;

        if request.force {
            info!(media = %request.media, "Forced submission, skipping duplicate detection");
        } else if let Some(existing) = self
            .detector
            .is_duplicate(self.store.as_ref(), &fingerprint)
            .await?
        {
            info!(
                media = %request.media,
                matches = %existing.id,
                "Submission rejected as a duplicate"
            );
            return Ok(SubmissionOutcome::Duplicate(Box::new(existing)));
        }

        let id = self
            .store
            .insert(&NewSubmission {
                kind: request.kind,
                media: request.media.clone(),
                fingerprint,
                submitted_by: request.submitted_by,
                caption: request.caption,
            })
            .await?;

        if let Err(e) = self.engine.ensure_armed().await {
            warn!(error = %e, "Submission stored but the timer could not be armed");
        }

        // The insert is committed; the submitter gets an acknowledgment either way
        let position = match self.store.position_of(id).await {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(submission_id = %id, error = %e, "Could not read queue position");
                None
            }
        };
        info!(submission_id = %id, media = %request.media, ?position, "Submission queued");
        Ok(SubmissionOutcome::Accepted { id, position })
    }

    async fn edit_caption(&mut self, media: &MediaRef, caption: &str) -> Result<()> {
        let submission = self.store.find_by_reference(media).await?;
        self.store.update_caption(submission.id, caption).await?;
        info!(submission_id = %submission.id, "Caption updated");
        Ok(())
    }

    async fn delete(&mut self, media: &MediaRef) -> Result<()> {
        let submission = self.store.find_by_reference(media).await?;
        self.store.mark_deleted(submission.id).await?;
        info!(submission_id = %submission.id, "Submission deleted");
        Ok(())
    }

    async fn apply_deletion_notice(&mut self, external_refs: &[ExternalMessageRef]) {
        for external_ref in external_refs {
            let result = match self.store.find_by_external_ref(external_ref).await {
                Ok(submission) => self.store.mark_deleted(submission.id).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => info!(%external_ref, "Posted submission deleted from the channel"),
                Err(AutopostError::NotFound(_)) => {
                    debug!(%external_ref, "Deletion notice for an unknown message")
                }
                Err(e) => warn!(%external_ref, error = %e, "Could not apply deletion notice"),
            }
        }
    }

    async fn status(&self) -> Result<StatusReport> {
        let queue_length = self.store.queue_length().await?;
        let engine = self.engine.status();
        Ok(StatusReport {
            state: engine.state,
            queue_length,
            interval: engine.interval,
            next_post_at: engine.next_fire,
            edition: engine.edition,
        })
    }

    async fn info(&self, media: &MediaRef) -> Result<SubmissionInfo> {
        let submission = self.store.find_by_reference(media).await?;

        let display_name = match &self.directory {
            Some(directory) => directory.display_name(submission.submitted_by).await,
            None => None,
        };
        let submitter = display_name.unwrap_or_else(|| submission.submitted_by.to_string());

        let (position, estimated_post_at) = if submission.is_pending() {
            let position = self.store.position_of(submission.id).await?;
            let queue_length = self.store.queue_length().await?;
            (
                Some(position),
                self.engine.estimated_post_time(position, queue_length),
            )
        } else {
            (None, None)
        };

        let (posted_at, external_ref) = match &submission.outcome {
            Some(outcome) => (
                DateTime::from_timestamp(outcome.posted_at, 0),
                Some(outcome.external_ref.clone()),
            ),
            None => (None, None),
        };

        Ok(SubmissionInfo {
            id: submission.id,
            submitted_at: submission.submitted_at_utc(),
            state: submission.state(),
            submitted_by: submission.submitted_by,
            submitter,
            caption: submission.caption,
            media: submission.media,
            position,
            estimated_post_at,
            posted_at,
            external_ref,
        })
    }
}

fn respond<T>(event: &'static str, reply: Reply<T>, result: Result<T>) {
    if let Err(e) = &result {
        log_failure(event, e);
    }
    if reply.send(result).is_err() {
        debug!(event, "Requester went away before the reply");
    }
}

fn log_failure(event: &'static str, e: &AutopostError) {
    match e {
        AutopostError::ReconciliationHazard { .. } => error!(event, error = %e, "Event failed"),
        AutopostError::TooSoon { .. } => info!(event, error = %e, "Event throttled"),
        e if e.is_transient() => warn!(event, error = %e, "Event failed"),
        _ => debug!(event, error = %e, "Event rejected"),
    }
}
