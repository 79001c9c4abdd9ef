//! Core types for Autopost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Store-assigned submission identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub i64);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user who submitted a media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote-storage reference of a media file (unique per submission)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl std::fmt::Display for MediaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the message created on the target channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalMessageRef(pub String);

impl std::fmt::Display for ExternalMessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Animation,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Animation => "animation",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "animation" => Some(MediaKind::Animation),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostOutcome {
    pub posted_at: i64,
    pub external_ref: ExternalMessageRef,
}

/// Logical state of a submission, always derived from its fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    Pending,
    Posted,
    Errored,
    Deleted,
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionState::Pending => write!(f, "pending"),
            SubmissionState::Posted => write!(f, "posted"),
            SubmissionState::Errored => write!(f, "errored"),
            SubmissionState::Deleted => write!(f, "deleted"),
        }
    }
}

/// A queue entry as persisted by the content store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub kind: MediaKind,
    pub media: MediaRef,
    pub fingerprint: Fingerprint,
    pub submitted_by: UserId,
    pub submitted_at: i64,
    pub caption: String,
    pub outcome: Option<PostOutcome>,
    pub has_error: bool,
    pub deleted: bool,
}

impl Submission {
    pub fn state(&self) -> SubmissionState {
        if self.deleted {
            SubmissionState::Deleted
        } else if self.outcome.is_some() {
            SubmissionState::Posted
        } else if self.has_error {
            SubmissionState::Errored
        } else {
            SubmissionState::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == SubmissionState::Pending
    }

    pub fn submitted_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.submitted_at, 0)
    }
}

/// A submission that passed duplicate detection and is about to be stored
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub kind: MediaKind,
    pub media: MediaRef,
    pub fingerprint: Fingerprint,
    pub submitted_by: UserId,
    pub caption: String,
}

/// Number of submissions in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub posted: u64,
    pub errored: u64,
    pub deleted: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.posted + self.errored + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Submission {
        Submission {
            id: SubmissionId(1),
            kind: MediaKind::Image,
            media: MediaRef("file-1".into()),
            fingerprint: Fingerprint::new(vec![1.0, 2.0], "ff00"),
            submitted_by: UserId(7),
            submitted_at: 1_700_000_000,
            caption: String::new(),
            outcome: None,
            has_error: false,
            deleted: false,
        }
    }

    #[test]
    fn test_state_is_derived_from_fields() {
        let mut s = submission();
        assert_eq!(s.state(), SubmissionState::Pending);

        s.has_error = true;
        assert_eq!(s.state(), SubmissionState::Errored);

        s.outcome = Some(PostOutcome {
            posted_at: 1_700_000_100,
            external_ref: ExternalMessageRef("m1".into()),
        });
        assert_eq!(s.state(), SubmissionState::Posted);

        s.deleted = true;
        assert_eq!(s.state(), SubmissionState::Deleted);
    }

    #[test]
    fn test_media_kind_db_round_trip() {
        for kind in [MediaKind::Image, MediaKind::Video, MediaKind::Animation] {
            assert_eq!(MediaKind::from_db_str(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::from_db_str("sticker"), None);
    }

    #[test]
    fn test_queue_counts_total() {
        let counts = QueueCounts {
            pending: 3,
            posted: 10,
            errored: 1,
            deleted: 2,
        };
        assert_eq!(counts.total(), 16);
    }
}
