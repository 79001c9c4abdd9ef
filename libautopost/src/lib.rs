//! Autopost - scheduling and deduplication core of a media autoposting service
//!
//! This library keeps a durable queue of media submissions, rejects
//! near-duplicates before they are queued, and posts the oldest pending item
//! at a rate that adapts to the size of the backlog.

pub mod caption;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod detector;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod rate;
pub mod services;
pub mod store;
pub mod types;

// Mock collaborators are available for all builds to support integration tests
pub mod mock;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{
    Collaborators, Coordinator, CoordinatorHandle, SubmissionOutcome, SubmitRequest,
};
pub use db::Database;
pub use error::{AutopostError, Result};
pub use fingerprint::Fingerprint;
pub use store::ContentStore;
pub use types::{MediaKind, MediaRef, Submission, SubmissionId, SubmissionState};
