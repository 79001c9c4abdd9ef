//! Error types for Autopost

use std::time::Duration;

use thiserror::Error;

use crate::types::{ExternalMessageRef, SubmissionId};

pub type Result<T> = std::result::Result<T, AutopostError>;

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DbError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error(
        "Too soon: {throttle} throttle requires {}, only {} elapsed",
        human(.minimum),
        human(.elapsed)
    )]
    TooSoon {
        throttle: Throttle,
        elapsed: Duration,
        minimum: Duration,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Reconciliation hazard: submission {submission_id} was delivered as {external_ref} but could not be marked as posted: {reason}"
    )]
    ReconciliationHazard {
        submission_id: SubmissionId,
        external_ref: ExternalMessageRef,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Coordinator is not running")]
    CoordinatorClosed,
}

impl AutopostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutopostError::InvalidInput(_)
            | AutopostError::InvalidFingerprint(_)
            | AutopostError::NotFound(_) => 3,
            AutopostError::Config(_) | AutopostError::Persistence(_) => 2,
            AutopostError::Service(_)
            | AutopostError::TooSoon { .. }
            | AutopostError::ReconciliationHazard { .. }
            | AutopostError::CoordinatorClosed => 1,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AutopostError::TooSoon { .. }
                | AutopostError::Service(_)
                | AutopostError::Persistence(_)
        )
    }
}

fn human(duration: &Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

/// Which throttle rejected a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Posting,
    Pause,
}

impl std::fmt::Display for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Throttle::Posting => write!(f, "posting"),
            Throttle::Pause => write!(f, "pause"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Could not analyze media: {0}")]
    Fingerprint(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}
