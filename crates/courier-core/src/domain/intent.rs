//! Claim intents and the tie-break rule.
//!
//! An intent is a small record a worker publishes under
//! `claims/<work_id>/<worker_id>.json` to announce "I want this order". After a
//! sync every participant sees the same set of intents and applies the same
//! comparator, so they all agree on a single winner without talking to each
//! other.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{WorkId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimIntent {
    pub work_id: WorkId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

impl ClaimIntent {
    pub fn new(work_id: WorkId, worker_id: WorkerId, claimed_at: DateTime<Utc>) -> Self {
        Self {
            work_id,
            worker_id,
            claimed_at,
        }
    }

    /// Tie-break comparator: earlier `claimed_at` first, then the
    /// lexicographically smaller `worker_id`.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.claimed_at
            .cmp(&other.claimed_at)
            .then_with(|| self.worker_id.cmp(&other.worker_id))
    }

    /// Older than `ttl` relative to `now`; such intents belong to dead workers.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.claimed_at > ttl
    }
}

/// Pick the winning intent for one work order.
///
/// The result depends only on the set of intents, never on their order.
pub fn resolve_winner<'a, I>(intents: I) -> Option<&'a ClaimIntent>
where
    I: IntoIterator<Item = &'a ClaimIntent>,
{
    intents.into_iter().min_by(|a, b| a.precedence(b))
}
