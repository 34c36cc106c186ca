//! Work order status and the buckets that hold each status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a work order.
///
/// State transitions:
/// - Available -> Claimed -> Active -> Completed -> Archived
/// - Active -> Failed -> Available (promotion, while attempts remain)
/// - Active -> Failed -> PermanentlyFailed (attempt ceiling reached)
/// - Claimed/Active -> Available (stale claim revoked by the orchestrator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting in `available/` for a worker.
    Available,

    /// Moved into `active/` by the claim winner, executor not started yet.
    Claimed,

    /// Executor is running on the owning worker.
    Active,

    /// Finished successfully; result attached.
    Completed,

    /// Last attempt failed; waiting in `retry/` for promotion.
    Failed,

    /// Attempt ceiling reached; never claimable again.
    PermanentlyFailed,

    /// Compressed into `archive/`, read-only.
    Archived,
}

impl WorkStatus {
    /// The one bucket a record with this status may live in.
    pub fn bucket(self) -> Bucket {
        match self {
            WorkStatus::Available => Bucket::Available,
            WorkStatus::Claimed | WorkStatus::Active => Bucket::Active,
            WorkStatus::Completed => Bucket::Completed,
            WorkStatus::Failed => Bucket::Retry,
            WorkStatus::PermanentlyFailed => Bucket::Failed,
            WorkStatus::Archived => Bucket::Archive,
        }
    }

    /// Does this status require a `claim` on the record?
    pub fn holds_claim(self) -> bool {
        matches!(self, WorkStatus::Claimed | WorkStatus::Active)
    }

    /// Terminal statuses take no further worker-driven transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::PermanentlyFailed | WorkStatus::Archived
        )
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkStatus::Available => "available",
            WorkStatus::Claimed => "claimed",
            WorkStatus::Active => "active",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::PermanentlyFailed => "permanently_failed",
            WorkStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// A named partition of the shared store (one directory in the repository).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Available,
    Active,
    Completed,
    Retry,
    Failed,
    Archive,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Available,
        Bucket::Active,
        Bucket::Completed,
        Bucket::Retry,
        Bucket::Failed,
        Bucket::Archive,
    ];

    /// Directory name inside the repository.
    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Available => "available",
            Bucket::Active => "active",
            Bucket::Completed => "completed",
            Bucket::Retry => "retry",
            Bucket::Failed => "failed",
            Bucket::Archive => "archive",
        }
    }

    /// Archived records are stored compressed.
    pub fn is_compressed(self) -> bool {
        matches!(self, Bucket::Archive)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(WorkStatus::Available, Bucket::Available)]
    #[case(WorkStatus::Claimed, Bucket::Active)]
    #[case(WorkStatus::Active, Bucket::Active)]
    #[case(WorkStatus::Completed, Bucket::Completed)]
    #[case(WorkStatus::Failed, Bucket::Retry)]
    #[case(WorkStatus::PermanentlyFailed, Bucket::Failed)]
    #[case(WorkStatus::Archived, Bucket::Archive)]
    fn every_status_maps_to_one_bucket(#[case] status: WorkStatus, #[case] bucket: Bucket) {
        assert_eq!(status.bucket(), bucket);
    }

    #[test]
    fn only_claimed_and_active_hold_claims() {
        let holders: Vec<_> = [
            WorkStatus::Available,
            WorkStatus::Claimed,
            WorkStatus::Active,
            WorkStatus::Completed,
            WorkStatus::Failed,
            WorkStatus::PermanentlyFailed,
            WorkStatus::Archived,
        ]
        .into_iter()
        .filter(|s| s.holds_claim())
        .collect();
        assert_eq!(holders, vec![WorkStatus::Claimed, WorkStatus::Active]);
    }
}
