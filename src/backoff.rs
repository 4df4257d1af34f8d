//! Backoff policy.
//!
//! Pure mapping from (failure reason, attempts so far) to the delay before
//! the item becomes claimable again. Rate limiting gets a long fixed
//! cooldown, transport problems a shorter one, and everything unexplained
//! escalates linearly up to a cap.

use std::time::Duration;

use crate::model::FailureReason;

/// Total delivery attempts before an item is given up as failed.
pub const MAX_ATTEMPTS: u32 = 3;

const RATE_LIMITED_SECS: u64 = 180;
const NETWORK_SECS: u64 = 60;
const LINEAR_STEP_SECS: u64 = 20;
const LINEAR_CAP_SECS: u64 = 300;

/// Delay before the next attempt, given the number of attempts made so far.
pub fn delay_for(reason: FailureReason, attempts_so_far: u32) -> Duration {
    let secs = match reason {
        FailureReason::RateLimited => RATE_LIMITED_SECS,
        FailureReason::Network => NETWORK_SECS,
        FailureReason::EmptyContent => 0,
        _ => LINEAR_CAP_SECS.min(LINEAR_STEP_SECS * u64::from(attempts_so_far)),
    };
    Duration::from_secs(secs)
}
