//! Outcome classification.
//!
//! Turns a raw [`DriverOutcome`] into the queue's verdict. Matching
//! channel-provided failure text by substring is brittle by nature, so
//! every pattern lives here and nowhere else; swapping the channel for a
//! structured protocol replaces this module without touching queue logic.

use crate::driver::DriverOutcome;
use crate::model::FailureReason;

/// What the queue should do with a finished delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Commit the item as sent. `confirmed` is false when success was
    /// inferred from side-channel evidence rather than an explicit ack.
    Sent { confirmed: bool },
    /// Route through the retry path with this reason.
    Retry(FailureReason),
}

const RATE_LIMIT_PATTERNS: &[&str] = &["too frequent", "try again later", "try later", "rate limit"];
const EMPTY_PATTERNS: &[&str] = &["content is empty", "empty content", "cannot be empty"];
const NETWORK_PATTERNS: &[&str] = &["network", "connection"];

/// Classify a delivery outcome.
pub fn classify(outcome: &DriverOutcome) -> Verdict {
    match outcome {
        DriverOutcome::Acknowledged { success: true, .. } => Verdict::Sent { confirmed: true },
        DriverOutcome::Acknowledged {
            success: false,
            message,
        } => Verdict::Retry(classify_rejection(message.as_deref())),
        DriverOutcome::Indeterminate {
            evidence: Some(_),
        } => Verdict::Sent { confirmed: false },
        DriverOutcome::Indeterminate { evidence: None } => Verdict::Retry(FailureReason::Timeout),
        DriverOutcome::Structural { .. } => Verdict::Retry(FailureReason::Structural),
    }
}

fn classify_rejection(message: Option<&str>) -> FailureReason {
    let msg = match message {
        Some(m) => m.to_lowercase(),
        None => return FailureReason::Unknown,
    };
    if contains_any(&msg, RATE_LIMIT_PATTERNS) {
        FailureReason::RateLimited
    } else if contains_any(&msg, EMPTY_PATTERNS) {
        FailureReason::EmptyContent
    } else if contains_any(&msg, NETWORK_PATTERNS) {
        FailureReason::Network
    } else {
        FailureReason::Unknown
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
