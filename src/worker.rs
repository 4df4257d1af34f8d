//! Publish worker.
//!
//! Pull loop over the queue store: claim, deliver through the driver,
//! classify, commit. The channel is not push-capable, so the loop polls on
//! a fixed interval whenever nothing is eligible. One worker owns exactly
//! one driver session; running several workers means several sessions, and
//! the claim guard keeps them off each other's items.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::classify::{Verdict, classify};
use crate::driver::DeliveryDriver;
use crate::error::Result;
use crate::model::{FailureReason, PostItem, Status};
use crate::sanitize;
use crate::store::Store;

/// Tuning for the publish loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no eligible item exists.
    pub poll_interval: Duration,
    /// Outer bound on a single delivery attempt, wrapping the driver's own
    /// polling window.
    pub delivery_timeout: Duration,
    /// Posts claimed per cycle. They are still delivered one at a time.
    pub claim_batch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            delivery_timeout: Duration::from_secs(30),
            claim_batch: 1,
        }
    }
}

/// Cooperative stop signal.
///
/// Stopping prevents new claims; an attempt already delivering runs to
/// its commit, so no item is ever left in processing.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called, immediately if it already was.
    async fn stopped(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Drives approved posts through the delivery channel.
pub struct PublishWorker<D: DeliveryDriver> {
    store: Store,
    driver: D,
    config: WorkerConfig,
    stop: Arc<StopSignal>,
}

impl<D: DeliveryDriver> PublishWorker<D> {
    pub fn new(store: Store, driver: D, config: WorkerConfig) -> Self {
        Self {
            store,
            driver,
            config,
            stop: Arc::new(StopSignal::default()),
        }
    }

    /// Handle for stopping the loop from elsewhere (signal handler, tests).
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Run until stopped. Opens one driver session for the whole run and
    /// releases it on the way out. Cycle errors are logged and the loop
    /// keeps going; nothing escapes it.
    pub async fn run(&self) -> Result<()> {
        let mut session = self.driver.open().await?;
        info!("publish worker started");

        loop {
            if self.stop.is_stopped() {
                break;
            }
            match self.process_batch(&mut session).await {
                Ok(true) => {} // processed something; look again immediately
                Ok(false) => {
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "publish cycle error");
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!("publish worker stopping");
        self.driver.close(session).await;
        Ok(())
    }

    /// Claim and resolve up to one batch. Returns whether anything was
    /// claimed.
    async fn process_batch(&self, session: &mut D::Session) -> Result<bool> {
        let items = self.store.claim(self.config.claim_batch)?;
        if items.is_empty() {
            return Ok(false);
        }
        for item in items {
            self.deliver_one(session, item).await?;
        }
        Ok(true)
    }

    /// Resolve a single claimed item. Every path out of here commits the
    /// row; a claim never stays in processing.
    async fn deliver_one(&self, session: &mut D::Session, item: PostItem) -> Result<()> {
        let id = item.id;

        // The channel may have delivered this text under another row before
        // the suppression window let it back in.
        if self.store.was_sent(&item.canon, id)? {
            warn!(%id, "identical text already delivered, discarding");
            self.driver
                .capture_diagnostic(session, id, FailureReason::Duplicate.as_str())
                .await;
            self.store
                .commit_terminal_failure(id, FailureReason::Duplicate)?;
            return Ok(());
        }

        let clean = sanitize::sanitize(&item.text);
        if clean.is_empty() {
            let updated = self.store.commit_retry(id, FailureReason::EmptyContent)?;
            warn!(%id, attempts = updated.attempts, status = %updated.status,
                "nothing left after sanitization");
            return Ok(());
        }

        let verdict = match tokio::time::timeout(
            self.config.delivery_timeout,
            self.driver.attempt(session, &clean),
        )
        .await
        {
            Ok(Ok(outcome)) => classify(&outcome),
            Ok(Err(e)) => {
                // Driver faults stop at this boundary.
                warn!(%id, error = %e, "driver error during delivery");
                Verdict::Retry(FailureReason::Unknown)
            }
            Err(_) => Verdict::Retry(FailureReason::Timeout),
        };

        match verdict {
            Verdict::Sent { confirmed } => {
                self.store.commit_success(id, confirmed)?;
                info!(%id, confirmed, "delivered");
            }
            Verdict::Retry(reason) => {
                self.driver
                    .capture_diagnostic(session, id, reason.as_str())
                    .await;
                let updated = self.store.commit_retry(id, reason)?;
                match updated.status {
                    Status::Failed => {
                        warn!(%id, %reason, attempts = updated.attempts, "gave up on post")
                    }
                    _ => info!(%id, %reason, attempts = updated.attempts,
                        next_try_at = ?updated.next_try_at, "delivery failed, retry scheduled"),
                }
            }
        }
        Ok(())
    }
}
