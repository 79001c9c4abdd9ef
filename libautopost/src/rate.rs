//! Posting rate policies ("editions")
//!
//! A policy maps the current queue length to the interval between two post
//! attempts. Every policy must be non-increasing in the queue length (a
//! longer backlog never slows posting down) and must return `None` for an
//! empty queue so the scheduling engine leaves its timer disarmed.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{invalid, Edition, RateConfig, TierConfig};
use crate::error::Result;

pub trait RatePolicy: Send + Sync {
    /// Edition name, shown in status reports
    fn name(&self) -> &str;

    /// Interval until the next attempt, or `None` when there is nothing to post
    fn interval_for_queue_length(&self, queue_length: u64) -> Option<Duration>;

    /// Advisory wait between the next scheduled attempt and the one that
    /// reaches `position` (1 = next), assuming the current interval holds.
    fn estimated_wait_for_position(&self, position: u64, queue_length: u64) -> Duration {
        let Some(interval) = self.interval_for_queue_length(queue_length) else {
            return Duration::ZERO;
        };
        let steps = u32::try_from(position.saturating_sub(1)).unwrap_or(u32::MAX);
        interval.saturating_mul(steps)
    }
}

/// Spread the whole queue over a fixed window, within floor/ceiling bounds
#[derive(Debug, Clone)]
pub struct SteadyPolicy {
    window: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl SteadyPolicy {
    pub fn new(window: Duration, floor: Duration, ceiling: Duration) -> Self {
        Self {
            window,
            floor,
            ceiling: ceiling.max(floor),
        }
    }
}

impl RatePolicy for SteadyPolicy {
    fn name(&self) -> &str {
        "steady"
    }

    fn interval_for_queue_length(&self, queue_length: u64) -> Option<Duration> {
        if queue_length == 0 {
            return None;
        }
        let share = Duration::from_secs(self.window.as_secs() / queue_length);
        Some(share.clamp(self.floor, self.ceiling))
    }
}

#[derive(Debug, Clone)]
struct Tier {
    up_to: Option<u64>,
    interval: Duration,
}

/// Step table on the queue length
#[derive(Debug, Clone)]
pub struct TieredPolicy {
    tiers: Vec<Tier>,
}

impl TieredPolicy {
    /// Build from configuration, rejecting tables that are unordered,
    /// increasing, or missing the catch-all tier.
    pub fn from_config(tiers: &[TierConfig]) -> Result<Self> {
        if tiers.is_empty() {
            return Err(invalid("rate.tiers", "at least one tier is required"));
        }

        let mut previous: Option<&TierConfig> = None;
        for (index, tier) in tiers.iter().enumerate() {
            let is_last = index == tiers.len() - 1;
            if tier.up_to.is_none() && !is_last {
                return Err(invalid("rate.tiers", "only the last tier may omit up_to"));
            }
            if tier.interval.is_zero() {
                return Err(invalid("rate.tiers", "intervals must be greater than zero"));
            }
            if let Some(prev) = previous {
                if let (Some(a), Some(b)) = (prev.up_to, tier.up_to) {
                    if b <= a {
                        return Err(invalid("rate.tiers", "up_to must be strictly increasing"));
                    }
                }
                if tier.interval > prev.interval {
                    return Err(invalid(
                        "rate.tiers",
                        "intervals must not increase with queue length",
                    ));
                }
            }
            previous = Some(tier);
        }

        Ok(Self {
            tiers: tiers
                .iter()
                .map(|t| Tier {
                    up_to: t.up_to,
                    interval: t.interval,
                })
                .collect(),
        })
    }
}

impl RatePolicy for TieredPolicy {
    fn name(&self) -> &str {
        "tiered"
    }

    fn interval_for_queue_length(&self, queue_length: u64) -> Option<Duration> {
        if queue_length == 0 {
            return None;
        }
        self.tiers
            .iter()
            .find(|tier| tier.up_to.map_or(true, |limit| queue_length <= limit))
            .or_else(|| self.tiers.last())
            .map(|tier| tier.interval)
    }
}

/// Constant cadence regardless of backlog
#[derive(Debug, Clone)]
pub struct FixedPolicy {
    interval: Duration,
}

impl FixedPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RatePolicy for FixedPolicy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn interval_for_queue_length(&self, queue_length: u64) -> Option<Duration> {
        (queue_length > 0).then_some(self.interval)
    }
}

/// Build the configured edition
pub fn build_policy(config: &RateConfig) -> Result<Arc<dyn RatePolicy>> {
    let policy: Arc<dyn RatePolicy> = match config.edition {
        Edition::Steady => Arc::new(SteadyPolicy::new(config.window, config.floor, config.ceiling)),
        Edition::Tiered => Arc::new(TieredPolicy::from_config(&config.tiers)?),
        Edition::Fixed => Arc::new(FixedPolicy::new(config.interval)),
    };
    Ok(policy)
}
