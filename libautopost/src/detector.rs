//! Near-duplicate detection
//!
//! Two passes: a cheap numeric pre-filter on the derived histogram features,
//! served by an indexed range query, followed by a perceptual-hash Hamming
//! distance check on the few candidates that survive it.

use tracing::debug;

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::fingerprint::{Fingerprint, HistogramRange};
use crate::store::ContentStore;
use crate::types::Submission;

#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    /// Relative tolerance on the histogram sum, in (0, 1)
    approximation: f64,
    /// Maximum Hamming distance still considered a match
    similarity_threshold: u32,
}

impl DuplicateDetector {
    pub fn new(approximation: f64, similarity_threshold: u32) -> Self {
        Self {
            approximation,
            similarity_threshold,
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.approximation, config.similarity_threshold)
    }

    /// Look for a stored submission that matches `fingerprint`
    ///
    /// Every state is searched, posted and deleted entries included. The
    /// first candidate within the threshold wins; candidates come back from
    /// the store in no particular order.
    ///
    /// # Errors
    ///
    /// `InvalidFingerprint` for an unusable fingerprint, `Persistence` when
    /// the range query fails. A failed query never reports "no duplicate".
    pub async fn is_duplicate(
        &self,
        store: &dyn ContentStore,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Submission>> {
        fingerprint.validate()?;

        let range = HistogramRange::around(fingerprint, self.approximation);
        let candidates = store.candidates_by_histogram_range(&range).await?;

        debug!(
            candidates = candidates.len(),
            avg_low = range.avg_low,
            avg_high = range.avg_high,
            sum_low = range.sum_low,
            sum_high = range.sum_high,
            "Histogram pre-filter done"
        );

        let found = candidates.into_iter().find(|candidate| {
            candidate
                .fingerprint
                .perceptual_hash
                .distance(&fingerprint.perceptual_hash)
                .is_some_and(|distance| distance <= self.similarity_threshold)
        });

        if let Some(existing) = &found {
            debug!(submission_id = %existing.id, "Perceptual hash match");
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::AutopostError;
    use crate::mock::FaultyStore;
    use crate::types::{MediaKind, MediaRef, NewSubmission, UserId};
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    async fn store(db: &Database, media: &str, fingerprint: Fingerprint) {
        db.insert(&NewSubmission {
            kind: MediaKind::Image,
            media: MediaRef(media.to_string()),
            fingerprint,
            submitted_by: UserId(1),
            caption: String::new(),
        })
        .await
        .unwrap();
    }

    /// Histogram with the given average over four bins
    fn histogram(average: f64) -> Vec<f64> {
        vec![average; 4]
    }

    #[tokio::test]
    async fn test_near_candidate_passes_prefilter() {
        let (_temp, db) = setup_test_db().await;
        // A = 10, S = 40; stored entry at A + 0.5, sum 42 is within 5%
        store(&db, "near", Fingerprint::new(histogram(10.5), "ff00")).await;

        let detector = DuplicateDetector::new(0.05, 0);
        let found = detector
            .is_duplicate(&db, &Fingerprint::new(histogram(10.0), "ff00"))
            .await
            .unwrap();

        assert_eq!(found.unwrap().media.0, "near");
    }

    #[tokio::test]
    async fn test_far_candidate_is_filtered_even_with_identical_hash() {
        let (_temp, db) = setup_test_db().await;
        store(&db, "far", Fingerprint::new(histogram(15.0), "ff00")).await;

        let detector = DuplicateDetector::new(0.5, 64);
        let found = detector
            .is_duplicate(&db, &Fingerprint::new(histogram(10.0), "ff00"))
            .await
            .unwrap();

        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let (_temp, db) = setup_test_db().await;
        // "00" vs "07" differ by 3 bits
        store(&db, "three-bits", Fingerprint::new(histogram(10.0), "07")).await;

        let query = Fingerprint::new(histogram(10.0), "00");

        let at_threshold = DuplicateDetector::new(0.05, 3);
        assert!(at_threshold.is_duplicate(&db, &query).await.unwrap().is_some());

        let below = DuplicateDetector::new(0.05, 2);
        assert!(below.is_duplicate(&db, &query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hashes_of_different_length_never_match() {
        let (_temp, db) = setup_test_db().await;
        store(&db, "long-hash", Fingerprint::new(histogram(10.0), "0000")).await;

        let detector = DuplicateDetector::new(0.05, 64);
        let found = detector
            .is_duplicate(&db, &Fingerprint::new(histogram(10.0), "00"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_invalid_fingerprint_is_rejected_before_querying() {
        let (_temp, db) = setup_test_db().await;
        let faulty = FaultyStore::new(db);
        faulty.fail_range_query(true);

        let detector = DuplicateDetector::new(0.05, 8);
        let result = detector
            .is_duplicate(&faulty, &Fingerprint::new(vec![], "ff"))
            .await;
        assert!(matches!(result, Err(AutopostError::InvalidFingerprint(_))));
    }

    #[tokio::test]
    async fn test_range_query_failure_fails_closed() {
        let (_temp, db) = setup_test_db().await;
        let faulty = FaultyStore::new(db);
        faulty.fail_range_query(true);

        let detector = DuplicateDetector::new(0.05, 8);
        let result = detector
            .is_duplicate(&faulty, &Fingerprint::new(histogram(10.0), "ff"))
            .await;
        assert!(matches!(result, Err(AutopostError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_matches_posted_and_deleted_entries() {
        let (_temp, db) = setup_test_db().await;
        store(&db, "gone", Fingerprint::new(histogram(3.0), "abcd")).await;
        let existing = db.find_by_reference(&MediaRef("gone".into())).await.unwrap();
        db.mark_deleted(existing.id).await.unwrap();

        let detector = DuplicateDetector::new(0.05, 0);
        let found = detector
            .is_duplicate(&db, &Fingerprint::new(histogram(3.0), "abcd"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, existing.id);
    }
}
