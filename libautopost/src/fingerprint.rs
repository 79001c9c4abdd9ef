//! Media fingerprints and the numeric features derived from them
//!
//! A fingerprint is produced by the external analysis service. The histogram
//! average and sum are never stored alongside the histogram in memory: they
//! are recomputed from it whenever they are needed.

use serde::{Deserialize, Serialize};

use crate::error::{AutopostError, Result};

/// Perceptual hash as a hex-encoded bit string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerceptualHash(String);

impl PerceptualHash {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn nibbles(&self) -> Option<Vec<u8>> {
        self.0
            .chars()
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect()
    }

    /// Hamming distance to another hash
    ///
    /// Returns `None` when either hash is malformed or the lengths differ:
    /// hashes from different algorithms are not comparable.
    pub fn distance(&self, other: &PerceptualHash) -> Option<u32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let a = self.nibbles()?;
        let b = other.nibbles()?;
        Some(a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum())
    }
}

impl std::fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub histogram: Vec<f64>,
    pub perceptual_hash: PerceptualHash,
}

impl Fingerprint {
    pub fn new(histogram: Vec<f64>, perceptual_hash: &str) -> Self {
        Self {
            histogram,
            perceptual_hash: PerceptualHash::new(perceptual_hash),
        }
    }

    pub fn histogram_sum(&self) -> f64 {
        self.histogram.iter().sum()
    }

    pub fn histogram_average(&self) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram_sum() / self.histogram.len() as f64
    }

    /// Reject fingerprints that cannot take part in duplicate detection
    pub fn validate(&self) -> Result<()> {
        if self.histogram.is_empty() {
            return Err(AutopostError::InvalidFingerprint(
                "histogram is empty".to_string(),
            ));
        }
        if self.histogram.iter().any(|bin| !bin.is_finite()) {
            return Err(AutopostError::InvalidFingerprint(
                "histogram contains a non-finite bin".to_string(),
            ));
        }
        if self.perceptual_hash.is_empty() {
            return Err(AutopostError::InvalidFingerprint(
                "perceptual hash is empty".to_string(),
            ));
        }
        if self.perceptual_hash.nibbles().is_none() {
            return Err(AutopostError::InvalidFingerprint(format!(
                "perceptual hash '{}' is not hexadecimal",
                self.perceptual_hash
            )));
        }
        Ok(())
    }
}

/// Closed intervals on the histogram average and sum used as a pre-filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramRange {
    pub avg_low: f64,
    pub avg_high: f64,
    pub sum_low: f64,
    pub sum_high: f64,
}

impl HistogramRange {
    /// Band around a fingerprint: ±1 absolute on the average, ±`tolerance`
    /// relative on the sum, widened outwards to whole numbers.
    pub fn around(fingerprint: &Fingerprint, tolerance: f64) -> Self {
        let average = fingerprint.histogram_average();
        let sum = fingerprint.histogram_sum();
        let spread = (sum * tolerance).abs();

        Self {
            avg_low: (average - 1.0).floor(),
            avg_high: (average + 1.0).ceil(),
            sum_low: (sum - spread).floor(),
            sum_high: (sum + spread).ceil(),
        }
    }
}
