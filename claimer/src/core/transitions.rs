//! Ledger-owned status transitions for claim records.
//!
//! Every status change the engine makes goes through [`apply_observation`], so
//! the monotonic rules live in one place:
//!
//! - `claimed` is never replaced by any other status;
//! - an owned offer that previously `failed` becomes `manual`;
//! - `last_updated` moves only when the status actually changes, and never
//!   before `first_seen`.

use chrono::{DateTime, Utc};

use crate::core::types::{ClaimRecord, ClaimStatus};

/// What the state machine concluded about an offer during this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Driver reported `in-library` or `purchased`.
    Owned,
    /// Claim action completed.
    Claimed,
    /// Claim attempt or classification did not complete.
    Failed,
    /// Dry-run or declined confirmation.
    Skipped,
    /// Offer refused in this region.
    RegionLocked,
    /// Dependent offer whose base game could not be obtained.
    BaseGameMissing,
}

/// Result of applying an observation to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Status reported for this run's notification event.
    pub reported: ClaimStatus,
    /// Status stored in the record after the transition.
    pub stored: ClaimStatus,
    /// Whether the stored status differs from before.
    pub changed: bool,
}

/// Apply `observation` to `record`, returning what changed.
pub fn apply_observation(
    record: &mut ClaimRecord,
    observation: Observation,
    now: DateTime<Utc>,
) -> Transition {
    let prev = record.status;
    let (stored, reported) = next_status(prev, observation);
    let changed = prev != Some(stored);
    record.status = Some(stored);
    if changed {
        record.last_updated = now.max(record.first_seen);
    }
    Transition {
        reported,
        stored,
        changed,
    }
}

fn next_status(prev: Option<ClaimStatus>, observation: Observation) -> (ClaimStatus, ClaimStatus) {
    if prev == Some(ClaimStatus::Claimed) {
        let reported = match observation {
            // Already owned: a failed check this run is not a failed claim.
            Observation::Owned | Observation::Claimed | Observation::Failed => {
                ClaimStatus::Existed
            }
            Observation::Skipped => ClaimStatus::Skipped,
            Observation::RegionLocked => ClaimStatus::UnavailableRegion,
            Observation::BaseGameMissing => ClaimStatus::RequiresBaseGame,
        };
        return (ClaimStatus::Claimed, reported);
    }

    match observation {
        Observation::Owned => match prev {
            Some(ClaimStatus::Failed) => (ClaimStatus::Manual, ClaimStatus::Manual),
            Some(ClaimStatus::Manual) => (ClaimStatus::Manual, ClaimStatus::Existed),
            _ => (ClaimStatus::Existed, ClaimStatus::Existed),
        },
        Observation::Claimed => (ClaimStatus::Claimed, ClaimStatus::Claimed),
        Observation::Failed => (ClaimStatus::Failed, ClaimStatus::Failed),
        Observation::Skipped => (ClaimStatus::Skipped, ClaimStatus::Skipped),
        Observation::RegionLocked => (
            ClaimStatus::UnavailableRegion,
            ClaimStatus::UnavailableRegion,
        ),
        Observation::BaseGameMissing => {
            (ClaimStatus::RequiresBaseGame, ClaimStatus::RequiresBaseGame)
        }
    }
}

/// Drop the status so the offer is treated as freshly discovered.
pub fn reset_record(record: &mut ClaimRecord, now: DateTime<Utc>) -> Option<ClaimStatus> {
    let prev = record.status.take();
    if prev.is_some() {
        record.last_updated = now.max(record.first_seen);
    }
    prev
}
