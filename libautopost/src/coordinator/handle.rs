use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use super::messages::{
    Event, Reply, StatusReport, SubmissionInfo, SubmissionOutcome, SubmitRequest,
};
use crate::error::{AutopostError, Result};
use crate::types::{ExternalMessageRef, MediaRef};

/// Cloneable front door of the coordinator
///
/// Every method enqueues one event and, for requests, waits for the reply.
/// When the coordinator has stopped, calls fail with `CoordinatorClosed`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    pub(super) fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| AutopostError::CoordinatorClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Event) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| AutopostError::CoordinatorClosed)?
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmissionOutcome> {
        self.request(|reply| Event::Submit { request, reply }).await
    }

    pub async fn edit_caption(&self, media: &str, caption: &str) -> Result<()> {
        let media = MediaRef(media.to_string());
        let caption = caption.to_string();
        self.request(|reply| Event::EditCaption {
            media,
            caption,
            reply,
        })
        .await
    }

    pub async fn delete(&self, media: &str) -> Result<()> {
        let media = MediaRef(media.to_string());
        self.request(|reply| Event::Delete { media, reply }).await
    }

    /// Report messages removed from the channel (fire-and-forget)
    pub async fn deletion_notice(&self, external_refs: Vec<ExternalMessageRef>) -> Result<()> {
        self.send(Event::DeletionNotice { external_refs }).await
    }

    /// Delay the next post; returns the new target time
    pub async fn pause(&self, duration: Duration) -> Result<DateTime<Utc>> {
        self.request(|reply| Event::Pause { duration, reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(|reply| Event::Status { reply }).await
    }

    pub async fn info(&self, media: &str) -> Result<SubmissionInfo> {
        let media = MediaRef(media.to_string());
        self.request(|reply| Event::Info { media, reply }).await
    }

    /// Recompute the posting interval now instead of waiting for the ticker
    pub async fn refresh_rate(&self) -> Result<()> {
        self.send(Event::RefreshRate).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown).await
    }
}
