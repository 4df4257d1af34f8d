//! Structured audit events recorded on every queue decision.
//!
//! The post rows are the source of truth for current state; the event
//! stream is the narrative of how they got there — enqueues, suppressions,
//! claims, and every commit outcome, in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FailureReason, PostId};

/// A structured event emitted by the queue store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Enqueued {
        id: PostId,
    },
    /// An enqueue was refused because `existing` already covers the text.
    Suppressed {
        existing: PostId,
    },
    Approved {
        id: PostId,
    },
    Claimed {
        id: PostId,
    },
    /// Terminal success. `confirmed` is false when success was inferred
    /// from side-channel evidence rather than an explicit acknowledgment.
    Delivered {
        id: PostId,
        confirmed: bool,
    },
    RetryScheduled {
        id: PostId,
        reason: FailureReason,
        attempt: u32,
        delay_secs: u64,
    },
    /// Retry budget exhausted; the item went to failed.
    Exhausted {
        id: PostId,
        reason: FailureReason,
        attempts: u32,
    },
    /// Non-retryable classification; failed without burning the budget.
    Discarded {
        id: PostId,
        reason: FailureReason,
    },
    /// Persisted payload this version no longer understands.
    Unknown {
        raw: String,
    },
}
