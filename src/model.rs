//! Core data model.
//!
//! A post item is a piece of text waiting to go out through the delivery
//! channel. It has identity, a lifecycle status with a closed transition
//! table, an approval flag, and retry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Post Item
// ---------------------------------------------------------------------------

/// A unit of content tracked by the queue store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostItem {
    /// Unique identifier, assigned monotonically by the store.
    pub id: PostId,

    /// The payload as received from upstream. May still contain markup;
    /// sanitization is an explicit step before delivery, not implicit on read.
    pub text: String,

    /// Normalized comparison form of the payload. Used only by the
    /// duplicate-suppression check, never delivered.
    pub canon: String,

    /// Current lifecycle status.
    pub status: Status,

    /// Cleared-for-publication flag set by the upstream reviewer.
    /// Claims require it.
    pub approved: bool,

    /// Number of failed delivery attempts so far. Only ever increases.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Set once, on terminal success.
    pub sent_at: Option<DateTime<Utc>>,

    /// Claim eligibility gate; None means eligible immediately.
    pub next_try_at: Option<DateTime<Utc>>,
}

/// Newtype for post item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId(pub i64);

impl std::fmt::Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a post item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for approval and/or a worker.
    Pending,
    /// Claimed by a worker; a delivery attempt is in flight.
    Processing,
    /// Delivered. Terminal.
    Sent,
    /// Exhausted retries or discarded. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    ///
    /// Processing is never a stable end state: every claim resolves to
    /// Sent, back to Pending (retry), or Failed.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Sent)
                | (Processing, Pending) // retry
                | (Processing, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Sent | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Sent => "sent",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "sent" => Ok(Status::Sent),
            "failed" => Ok(Status::Failed),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Reason
// ---------------------------------------------------------------------------

/// Why a delivery attempt did not succeed.
///
/// The classifier produces these; the backoff table and the commit path
/// consume them. `Duplicate` is non-retryable, everything else retries
/// until the attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Channel reported the account is posting too often.
    RateLimited,
    /// Channel reported a transport problem.
    Network,
    /// Nothing left to deliver after sanitization.
    EmptyContent,
    /// Identical content was already delivered.
    Duplicate,
    /// No acknowledgment and no success evidence inside the polling window.
    Timeout,
    /// The driver could not locate the composer or submit control.
    Structural,
    /// Channel rejected the attempt without a recognizable reason,
    /// or the driver faulted mid-attempt.
    Unknown,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Network => "network",
            FailureReason::EmptyContent => "empty_content",
            FailureReason::Duplicate => "duplicate",
            FailureReason::Timeout => "timeout",
            FailureReason::Structural => "structural",
            FailureReason::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
