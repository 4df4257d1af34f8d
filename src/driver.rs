//! Delivery driver interface.
//!
//! The channel-specific automation (browser session, composer navigation,
//! toast scraping) lives outside this crate. The core consumes it through
//! this trait and only ever sees a typed [`DriverOutcome`] — structural
//! failure, channel-reported failure, and silence stay distinguishable
//! instead of collapsing into a bare boolean.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::PostId;

/// What a delivery attempt reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The channel explicitly confirmed or rejected the attempt.
    Acknowledged {
        success: bool,
        /// Channel-provided natural-language detail, when present.
        message: Option<String>,
    },
    /// No explicit acknowledgment inside the polling window.
    Indeterminate {
        /// Side-channel evidence that the attempt likely landed.
        evidence: Option<SuccessEvidence>,
    },
    /// The driver could not even locate the composer or submit control.
    Structural { detail: String },
}

/// Side-channel signals observed after submission. These are heuristics,
/// not confirmations; the classifier labels them as inferred success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessEvidence {
    /// The input surface no longer holds the submitted text.
    ComposerCleared,
    /// The composer surface (modal/dialog) closed on its own.
    SurfaceClosed,
}

/// A stateful delivery channel session.
///
/// One session supports at most one in-flight attempt; a worker owns
/// exactly one session for its lifetime.
#[async_trait]
pub trait DeliveryDriver: Send + Sync {
    type Session: Send;

    /// Acquire a channel session.
    async fn open(&self) -> Result<Self::Session>;

    /// Release a channel session. Infallible by design; drivers log their
    /// own teardown problems.
    async fn close(&self, session: Self::Session);

    /// Transmit `text` and observe the channel's reaction, bounded by the
    /// driver's own polling window. Errors here mean the driver itself
    /// faulted (lost connection, dead page); the worker folds them into an
    /// unknown failure rather than letting them escape the loop.
    async fn attempt(&self, session: &mut Self::Session, text: &str) -> Result<DriverOutcome>;

    /// Capture offline-debugging artifacts (screenshot, DOM dump) for a
    /// failed attempt. Best-effort; must not fail the caller.
    async fn capture_diagnostic(&self, session: &mut Self::Session, id: PostId, reason: &str);
}

/// Driver that acknowledges every attempt without transmitting anything.
///
/// Lets the binary run the full queue lifecycle when no real channel
/// automation is wired in.
#[derive(Debug, Default, Clone)]
pub struct DryRunDriver;

#[async_trait]
impl DeliveryDriver for DryRunDriver {
    type Session = ();

    async fn open(&self) -> Result<Self::Session> {
        tracing::info!("dry-run delivery driver: posts are acknowledged, not transmitted");
        Ok(())
    }

    async fn close(&self, _session: Self::Session) {}

    async fn attempt(&self, _session: &mut Self::Session, text: &str) -> Result<DriverOutcome> {
        tracing::info!(chars = text.chars().count(), "dry-run delivery");
        Ok(DriverOutcome::Acknowledged {
            success: true,
            message: None,
        })
    }

    async fn capture_diagnostic(&self, _session: &mut Self::Session, id: PostId, reason: &str) {
        tracing::debug!(%id, reason, "dry-run diagnostic capture");
    }
}
