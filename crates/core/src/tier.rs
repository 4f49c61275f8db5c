//! Subscription tiers and the free-tier grace policy.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier of a user profile.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionTier {
    #[serde(rename = "free_user")]
    Free,
    #[serde(rename = "premium_user")]
    Premium,
}

impl SubscriptionTier {
    pub fn is_premium(self) -> bool {
        matches!(self, SubscriptionTier::Premium)
    }
}

/// Outcome of checking a completed job against the grace period.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GraceDecision {
    /// The grace window has elapsed; the result may be archived.
    Eligible,
    /// Still inside the window; check again after `remaining`.
    Defer { remaining: StdDuration },
}

/// Fixed window after completion during which free-tier results stay hot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GracePolicy {
    grace: Duration,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            grace: Duration::minutes(5),
        }
    }
}

impl GracePolicy {
    pub fn new(grace: StdDuration) -> Self {
        Self {
            grace: Duration::from_std(grace).unwrap_or(Duration::MAX),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Has the window elapsed at `now`?
    ///
    /// The boundary is inclusive: a job completed exactly `grace` ago is
    /// eligible. The deferral is rounded up to whole seconds and never zero,
    /// since lease extensions have second granularity.
    pub fn evaluate(&self, complete_time: DateTime<Utc>, now: DateTime<Utc>) -> GraceDecision {
        let elapsed = now - complete_time;
        if elapsed >= self.grace {
            return GraceDecision::Eligible;
        }

        // Saturates when `complete_time` lies far in the future.
        let remaining = self.grace.checked_sub(&elapsed).unwrap_or(Duration::MAX);
        let remaining_ms = remaining.num_milliseconds().max(0) as u64;
        let secs = remaining_ms.div_ceil(1000).max(1);
        GraceDecision::Defer {
            remaining: StdDuration::from_secs(secs),
        }
    }

    pub fn has_expired(&self, complete_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        matches!(self.evaluate(complete_time, now), GraceDecision::Eligible)
    }
}
