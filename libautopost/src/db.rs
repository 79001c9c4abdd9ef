//! SQLite implementation of the content store

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::error::{AutopostError, DbError, Result};
use crate::fingerprint::{Fingerprint, HistogramRange, PerceptualHash};
use crate::store::ContentStore;
use crate::types::{
    ExternalMessageRef, MediaKind, MediaRef, NewSubmission, PostOutcome, QueueCounts, Submission,
    SubmissionId, UserId,
};

/// Predicate selecting the active queue
const PENDING: &str = "posted_at IS NULL AND has_error = 0 AND deleted = 0";

const COLUMNS: &str = "id, media_kind, media_ref, histogram, perceptual_hash, submitted_by, \
                       submitted_at, caption, posted_at, external_ref, has_error, deleted";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Insert with an explicit submission timestamp (unix seconds)
    ///
    /// Used when importing submissions that already have an arrival time.
    pub async fn insert_with_timestamp(
        &self,
        submission: &NewSubmission,
        submitted_at: i64,
    ) -> Result<SubmissionId> {
        let fingerprint = &submission.fingerprint;
        fingerprint.validate()?;

        let histogram = serde_json::to_string(&fingerprint.histogram)
            .map_err(|e| AutopostError::InvalidFingerprint(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO submissions (
                media_kind, media_ref, histogram, histogram_average, histogram_sum,
                perceptual_hash, submitted_by, submitted_at, caption
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(submission.kind.as_str())
        .bind(&submission.media.0)
        .bind(histogram)
        .bind(fingerprint.histogram_average())
        .bind(fingerprint.histogram_sum())
        .bind(fingerprint.perceptual_hash.as_str())
        .bind(submission.submitted_by.0)
        .bind(submitted_at)
        .bind(&submission.caption)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AutopostError::InvalidInput(format!(
                    "media {} is already known",
                    submission.media
                ))
            }
            other => DbError::SqlxError(other).into(),
        })?;

        Ok(SubmissionId(result.last_insert_rowid()))
    }

    async fn fetch_one_where(&self, clause: &str, value: &str) -> Result<Option<Submission>> {
        let query = format!("SELECT {} FROM submissions WHERE {} = ?", COLUMNS, clause);
        let row = sqlx::query(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_submission).transpose()
    }

    /// Distinguish "no such id" from "transition did not apply"
    async fn ensure_exists(&self, id: SubmissionId) -> Result<()> {
        let row = sqlx::query("SELECT id FROM submissions WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        match row {
            Some(_) => Ok(()),
            None => Err(AutopostError::NotFound(format!("submission {}", id))),
        }
    }
}

fn row_to_submission(r: &SqliteRow) -> Result<Submission> {
    let id: i64 = r.get("id");

    let kind_str: String = r.get("media_kind");
    let kind = MediaKind::from_db_str(&kind_str).ok_or_else(|| DbError::CorruptRow {
        id,
        reason: format!("unknown media kind '{}'", kind_str),
    })?;

    let histogram_json: String = r.get("histogram");
    let histogram: Vec<f64> =
        serde_json::from_str(&histogram_json).map_err(|e| DbError::CorruptRow {
            id,
            reason: format!("unreadable histogram: {}", e),
        })?;

    let posted_at: Option<i64> = r.get("posted_at");
    let external_ref: Option<String> = r.get("external_ref");
    let outcome = match (posted_at, external_ref) {
        (Some(posted_at), Some(external_ref)) => Some(PostOutcome {
            posted_at,
            external_ref: ExternalMessageRef(external_ref),
        }),
        _ => None,
    };

    Ok(Submission {
        id: SubmissionId(id),
        kind,
        media: MediaRef(r.get("media_ref")),
        fingerprint: Fingerprint {
            histogram,
            perceptual_hash: PerceptualHash::new(r.get::<String, _>("perceptual_hash")),
        },
        submitted_by: UserId(r.get("submitted_by")),
        submitted_at: r.get("submitted_at"),
        caption: r.get("caption"),
        outcome,
        has_error: r.get::<i32, _>("has_error") != 0,
        deleted: r.get::<i32, _>("deleted") != 0,
    })
}

#[async_trait]
impl ContentStore for Database {
    async fn insert(&self, submission: &NewSubmission) -> Result<SubmissionId> {
        self.insert_with_timestamp(submission, chrono::Utc::now().timestamp())
            .await
    }

    async fn find_by_reference(&self, media: &MediaRef) -> Result<Submission> {
        self.fetch_one_where("media_ref", &media.0)
            .await?
            .ok_or_else(|| AutopostError::NotFound(format!("media {}", media)))
    }

    async fn find_by_external_ref(&self, external: &ExternalMessageRef) -> Result<Submission> {
        self.fetch_one_where("external_ref", &external.0)
            .await?
            .ok_or_else(|| AutopostError::NotFound(format!("message {}", external)))
    }

    async fn candidates_by_histogram_range(
        &self,
        range: &HistogramRange,
    ) -> Result<Vec<Submission>> {
        let query = format!(
            r#"
            SELECT {}
            FROM submissions
            WHERE histogram_average BETWEEN ? AND ?
              AND histogram_sum BETWEEN ? AND ?
            "#,
            COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(range.avg_low)
            .bind(range.avg_high)
            .bind(range.sum_low)
            .bind(range.sum_high)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_submission).collect()
    }

    async fn update_caption(&self, id: SubmissionId, caption: &str) -> Result<()> {
        let query = format!("UPDATE submissions SET caption = ? WHERE id = ? AND {}", PENDING);
        let result = sqlx::query(&query)
            .bind(caption)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
            return Err(AutopostError::InvalidInput(format!(
                "submission {} is no longer pending, its caption cannot change",
                id
            )));
        }

        Ok(())
    }

    async fn mark_posted(&self, id: SubmissionId, outcome: &PostOutcome) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE submissions SET posted_at = ?, external_ref = ?
            WHERE id = ? AND posted_at IS NULL AND deleted = 0
            "#,
        )
        .bind(outcome.posted_at)
        .bind(&outcome.external_ref.0)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
        }
        Ok(())
    }

    async fn mark_errored(&self, id: SubmissionId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE submissions SET has_error = 1
            WHERE id = ? AND posted_at IS NULL AND deleted = 0
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
        }
        Ok(())
    }

    async fn mark_deleted(&self, id: SubmissionId) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET deleted = 1 WHERE id = ? AND deleted = 0")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
        }
        Ok(())
    }

    async fn queue_length(&self) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM submissions WHERE {}", PENDING);
        let (count,): (i64,) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(count.max(0) as u64)
    }

    async fn next_pending(&self) -> Result<Option<Submission>> {
        Ok(self.list_pending(1).await?.into_iter().next())
    }

    async fn position_of(&self, id: SubmissionId) -> Result<u64> {
        let query = format!(
            "SELECT submitted_at FROM submissions WHERE id = ? AND {}",
            PENDING
        );
        let row: Option<(i64,)> = sqlx::query_as(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let (submitted_at,) = row.ok_or_else(|| {
            AutopostError::NotFound(format!("submission {} is not in the queue", id))
        })?;

        let query = format!(
            r#"
            SELECT COUNT(*) FROM submissions
            WHERE {}
              AND (submitted_at < ? OR (submitted_at = ? AND id < ?))
            "#,
            PENDING
        );
        let (ahead,): (i64,) = sqlx::query_as(&query)
            .bind(submitted_at)
            .bind(submitted_at)
            .bind(id.0)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(ahead.max(0) as u64 + 1)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Submission>> {
        let query = format!(
            r#"
            SELECT {}
            FROM submissions
            WHERE {}
            ORDER BY submitted_at ASC, id ASC
            LIMIT ?
            "#,
            COLUMNS, PENDING
        );

        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_submission).collect()
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let (pending, posted, errored, deleted): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN deleted = 0 AND posted_at IS NULL AND has_error = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted = 0 AND posted_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted = 0 AND posted_at IS NULL AND has_error = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted = 1 THEN 1 ELSE 0 END), 0)
            FROM submissions
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(QueueCounts {
            pending: pending.max(0) as u64,
            posted: posted.max(0) as u64,
            errored: errored.max(0) as u64,
            deleted: deleted.max(0) as u64,
        })
    }
}
