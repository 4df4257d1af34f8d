//! End-to-end tests for the publish worker against a scripted driver.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use newsrelay::driver::{DeliveryDriver, DriverOutcome, SuccessEvidence};
use newsrelay::error::{Error, Result};
use newsrelay::event::EventKind;
use newsrelay::model::{PostId, Status};
use newsrelay::store::Store;
use newsrelay::worker::{PublishWorker, StopSignal, WorkerConfig};

// ---------------------------------------------------------------------------
// Scripted driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Outcome(DriverOutcome),
    /// The driver itself faults mid-attempt.
    Fault(String),
    /// Never respond; the worker's delivery timeout has to fire.
    Hang,
}

#[derive(Default)]
struct Inner {
    steps: Mutex<VecDeque<Step>>,
    delivered: Mutex<Vec<String>>,
    diagnostics: Mutex<Vec<(PostId, String)>>,
}

/// Driver that replays a fixed script of outcomes and records everything
/// the worker hands it.
#[derive(Clone, Default)]
struct ScriptedDriver(Arc<Inner>);

impl ScriptedDriver {
    fn scripted(steps: impl IntoIterator<Item = Step>) -> Self {
        let driver = Self::default();
        driver.0.steps.lock().unwrap().extend(steps);
        driver
    }

    fn delivered(&self) -> Vec<String> {
        self.0.delivered.lock().unwrap().clone()
    }

    fn diagnostics(&self) -> Vec<(PostId, String)> {
        self.0.diagnostics.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryDriver for ScriptedDriver {
    type Session = ();

    async fn open(&self) -> Result<Self::Session> {
        Ok(())
    }

    async fn close(&self, _session: Self::Session) {}

    async fn attempt(&self, _session: &mut Self::Session, text: &str) -> Result<DriverOutcome> {
        self.0.delivered.lock().unwrap().push(text.to_string());
        let step = self.0.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Outcome(outcome)) => Ok(outcome),
            Some(Step::Fault(message)) => Err(Error::Driver(message)),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Err(Error::Driver("script exhausted".to_string())),
        }
    }

    async fn capture_diagnostic(&self, _session: &mut Self::Session, id: PostId, reason: &str) {
        self.0
            .diagnostics
            .lock()
            .unwrap()
            .push((id, reason.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        delivery_timeout: Duration::from_millis(50),
        claim_batch: 1,
    }
}

fn spawn_worker(
    store: &Store,
    driver: ScriptedDriver,
) -> (Arc<StopSignal>, tokio::task::JoinHandle<Result<()>>) {
    let worker = PublishWorker::new(store.clone(), driver, fast_config());
    let stop = worker.stop_signal();
    let handle = tokio::spawn(async move { worker.run().await });
    (stop, handle)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the wait budget");
}

async fn stop_and_join(
    stop: Arc<StopSignal>,
    handle: tokio::task::JoinHandle<Result<()>>,
) {
    stop.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop in time")
        .expect("worker task panicked")
        .expect("worker returned an error");
}

fn enqueue_approved(store: &Store, text: &str) -> PostId {
    let id = store.enqueue(text).unwrap().unwrap();
    store.approve(id).unwrap();
    id
}

// ---------------------------------------------------------------------------
// Success paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_ack_drives_the_item_to_sent() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Outcome(DriverOutcome::Acknowledged {
        success: true,
        message: Some("published".to_string()),
    })]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().status == Status::Sent).await;
    stop_and_join(stop, handle).await;

    let item = store.get(id).unwrap();
    assert!(item.sent_at.is_some());
    assert_eq!(item.attempts, 0);
    assert_eq!(driver.delivered(), vec!["Token X listed".to_string()]);
    assert!(driver.diagnostics().is_empty());

    let delivered_events: Vec<_> = store
        .events_since(0)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::Delivered { .. }))
        .collect();
    assert_eq!(delivered_events.len(), 1);
    assert!(matches!(
        delivered_events[0].kind,
        EventKind::Delivered { confirmed: true, .. }
    ));
}

#[tokio::test]
async fn delivery_uses_the_sanitized_text() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Outcome(DriverOutcome::Acknowledged {
        success: true,
        message: None,
    })]);
    let id = enqueue_approved(&store, "<p>Breaking: Fees &amp; rewards up</p>");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().status == Status::Sent).await;
    stop_and_join(stop, handle).await;

    assert_eq!(driver.delivered(), vec!["Fees & rewards up".to_string()]);
}

#[tokio::test]
async fn inferred_success_is_committed_but_labeled_unconfirmed() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Outcome(DriverOutcome::Indeterminate {
        evidence: Some(SuccessEvidence::ComposerCleared),
    })]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver);
    wait_until(|| store.get(id).unwrap().status == Status::Sent).await;
    stop_and_join(stop, handle).await;

    let confirmed_flags: Vec<bool> = store
        .events_since(0)
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Delivered { confirmed, .. } => Some(confirmed),
            _ => None,
        })
        .collect();
    assert_eq!(confirmed_flags, vec![false]);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_rejection_gets_the_long_cooldown() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Outcome(DriverOutcome::Acknowledged {
        success: false,
        message: Some("Posting too frequent, try later".to_string()),
    })]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().attempts == 1).await;
    stop_and_join(stop, handle).await;

    let item = store.get(id).unwrap();
    assert_eq!(item.status, Status::Pending);
    let next_try = item.next_try_at.expect("cooldown must be set");
    assert!(next_try > Utc::now() + ChronoDuration::seconds(170));
    assert_eq!(
        driver.diagnostics(),
        vec![(id, "rate_limited".to_string())]
    );
}

#[tokio::test]
async fn delivery_timeout_is_classified_as_timeout() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Hang]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().attempts == 1).await;
    stop_and_join(stop, handle).await;

    let item = store.get(id).unwrap();
    assert_eq!(item.status, Status::Pending);
    assert!(item.next_try_at.is_some());
    assert_eq!(driver.diagnostics(), vec![(id, "timeout".to_string())]);
}

#[tokio::test]
async fn structural_failure_is_retried_as_structural() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Outcome(DriverOutcome::Structural {
        detail: "composer not found".to_string(),
    })]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().attempts == 1).await;
    stop_and_join(stop, handle).await;

    assert_eq!(store.get(id).unwrap().status, Status::Pending);
    assert_eq!(driver.diagnostics(), vec![(id, "structural".to_string())]);
}

#[tokio::test]
async fn driver_fault_folds_into_unknown() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Fault("page crashed".to_string())]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().attempts == 1).await;
    stop_and_join(stop, handle).await;

    assert_eq!(store.get(id).unwrap().status, Status::Pending);
    assert_eq!(driver.diagnostics(), vec![(id, "unknown".to_string())]);
}

#[tokio::test]
async fn empty_content_exhausts_the_retry_budget() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::default();
    // Markup only; nothing survives sanitization.
    let id = enqueue_approved(&store, "<p>&nbsp;</p>");

    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().status == Status::Failed).await;
    stop_and_join(stop, handle).await;

    let item = store.get(id).unwrap();
    assert_eq!(item.attempts, 3);
    // The driver is never consulted for empty payloads.
    assert!(driver.delivered().is_empty());
}

#[tokio::test]
async fn duplicate_at_delivery_time_is_discarded() {
    let store = Store::in_memory().unwrap();
    let text = "Solar flare disrupts satellites";

    // The same text went out yesterday-and-then-some, so the suppression
    // window lets it back into the queue.
    let t_past = Utc::now() - ChronoDuration::hours(25);
    let old = store.enqueue_at(text, t_past).unwrap().unwrap();
    store.approve(old).unwrap();
    store.claim_at(1, t_past).unwrap();
    store.commit_success_at(old, true, t_past).unwrap();

    let id = store.enqueue(text).unwrap().expect("window has lapsed");
    store.approve(id).unwrap();

    let driver = ScriptedDriver::default();
    let (stop, handle) = spawn_worker(&store, driver.clone());
    wait_until(|| store.get(id).unwrap().status == Status::Failed).await;
    stop_and_join(stop, handle).await;

    let item = store.get(id).unwrap();
    assert_eq!(item.attempts, 0, "discard must not burn the retry budget");
    assert!(driver.delivered().is_empty());
    assert_eq!(driver.diagnostics(), vec![(id, "duplicate".to_string())]);
    assert!(
        store
            .events_since(0)
            .unwrap()
            .iter()
            .any(|e| matches!(e.kind, EventKind::Discarded { id: d, .. } if d == id))
    );
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_on_an_idle_worker_exits_promptly() {
    let store = Store::in_memory().unwrap();
    let (stop, handle) = spawn_worker(&store, ScriptedDriver::default());

    tokio::time::sleep(Duration::from_millis(30)).await;
    stop_and_join(stop, handle).await;
}

#[tokio::test]
async fn stop_during_delivery_still_commits_the_item() {
    let store = Store::in_memory().unwrap();
    let driver = ScriptedDriver::scripted([Step::Hang]);
    let id = enqueue_approved(&store, "Token X listed");

    let (stop, handle) = spawn_worker(&store, driver);
    // Stop as soon as the claim lands; the attempt is still in flight
    // unless the bounded window already expired it.
    wait_until(|| {
        let item = store.get(id).unwrap();
        item.status == Status::Processing || item.attempts == 1
    })
    .await;
    stop_and_join(stop, handle).await;

    // The in-flight attempt ran to its bounded end and committed; nothing
    // is stranded in processing.
    let item = store.get(id).unwrap();
    assert_ne!(item.status, Status::Processing);
    assert_eq!(item.status, Status::Pending);
    assert_eq!(item.attempts, 1);
}
