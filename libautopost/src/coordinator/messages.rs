use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::engine::EngineState;
use crate::error::Result;
use crate::types::{
    ExternalMessageRef, MediaKind, MediaRef, Submission, SubmissionId, SubmissionState, UserId,
};

/// Reply channel for a request
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// A new media item offered for posting
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: MediaKind,
    pub media: MediaRef,
    pub submitted_by: UserId,
    pub caption: String,
    /// Queue the item even if it looks like a known one
    pub force: bool,
}

impl SubmitRequest {
    pub fn new(kind: MediaKind, media: impl Into<String>, submitted_by: i64) -> Self {
        Self {
            kind,
            media: MediaRef(media.into()),
            submitted_by: UserId(submitted_by),
            caption: String::new(),
            force: false,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    /// Queued; `position` is the 1-based rank, `None` if it could not be read
    Accepted {
        id: SubmissionId,
        position: Option<u64>,
    },
    /// Matches a submission that is already known
    Duplicate(Box<Submission>),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: EngineState,
    pub queue_length: u64,
    #[serde(with = "optional_secs")]
    pub interval: Option<Duration>,
    pub next_post_at: Option<DateTime<Utc>>,
    pub edition: String,
}

/// Per-submission report
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionInfo {
    pub id: SubmissionId,
    pub media: MediaRef,
    pub state: SubmissionState,
    pub submitted_by: UserId,
    /// Display name, or the numeric id when the directory has none
    pub submitter: String,
    pub caption: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub position: Option<u64>,
    pub estimated_post_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub external_ref: Option<ExternalMessageRef>,
}

/// Everything the coordinator reacts to
pub enum Event {
    Submit {
        request: SubmitRequest,
        reply: Reply<SubmissionOutcome>,
    },
    EditCaption {
        media: MediaRef,
        caption: String,
        reply: Reply<()>,
    },
    Delete {
        media: MediaRef,
        reply: Reply<()>,
    },
    /// Messages removed from the channel by someone else
    DeletionNotice {
        external_refs: Vec<ExternalMessageRef>,
    },
    Pause {
        duration: Duration,
        reply: Reply<DateTime<Utc>>,
    },
    Status {
        reply: Reply<StatusReport>,
    },
    Info {
        media: MediaRef,
        reply: Reply<SubmissionInfo>,
    },
    TimerFired {
        generation: u64,
    },
    RefreshRate,
    Shutdown,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Submit { .. } => "submit",
            Event::EditCaption { .. } => "edit_caption",
            Event::Delete { .. } => "delete",
            Event::DeletionNotice { .. } => "deletion_notice",
            Event::Pause { .. } => "pause",
            Event::Status { .. } => "status",
            Event::Info { .. } => "info",
            Event::TimerFired { .. } => "timer_fired",
            Event::RefreshRate => "refresh_rate",
            Event::Shutdown => "shutdown",
        }
    }
}

mod optional_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}
