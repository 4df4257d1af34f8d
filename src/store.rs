//! SQLite queue store.
//!
//! Single source of truth for post state. Folds three concerns into one
//! table: duplicate suppression on the enqueue path, the conditional-update
//! claim that keeps concurrent workers off the same row, and the guarded
//! commits that resolve every claim. WAL mode for concurrent readers; the
//! connection is shared behind a mutex so clones of the store can serve
//! several workers.
//!
//! Every mutating operation has an `*_at` variant taking the clock instant
//! explicitly; the plain form passes `Utc::now()`. Scheduling logic stays
//! deterministic under test that way.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::backoff::{self, MAX_ATTEMPTS};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{FailureReason, PostId, PostItem, Status};
use crate::sanitize;

/// How long a delivered text keeps suppressing identical re-enqueues.
const SENT_SUPPRESSION_HOURS: i64 = 24;

const COLUMNS: &str = "id, text, canon, status, approved, attempts, created_at, sent_at, next_try_at";

/// Queue store handle. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Enqueue raw upstream text.
    ///
    /// The text is canonicalized for comparison only; the row stores the
    /// original. Returns `None` (suppressed) when an identical canonical
    /// text is already pending, or was sent within the last 24 hours.
    /// New rows start pending, unapproved, with zero attempts.
    pub fn enqueue(&self, raw: &str) -> Result<Option<PostId>> {
        self.enqueue_at(raw, Utc::now())
    }

    pub fn enqueue_at(&self, raw: &str, now: DateTime<Utc>) -> Result<Option<PostId>> {
        let canon = sanitize::canonicalize(raw);
        let cutoff = ts(now - ChronoDuration::hours(SENT_SUPPRESSION_HOURS));
        self.with_tx(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM posts
                     WHERE canon = ?1
                       AND (status = 'pending'
                            OR (status = 'sent' AND sent_at IS NOT NULL AND sent_at >= ?2))
                     LIMIT 1",
                    params![canon, cutoff],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing) = existing {
                record_event_on(
                    conn,
                    now,
                    &EventKind::Suppressed {
                        existing: PostId(existing),
                    },
                )?;
                return Ok(None);
            }

            conn.execute(
                "INSERT INTO posts (text, canon, status, approved, attempts, created_at)
                 VALUES (?1, ?2, 'pending', 0, 0, ?3)",
                params![raw, canon, ts(now)],
            )?;
            let id = PostId(conn.last_insert_rowid());
            record_event_on(conn, now, &EventKind::Enqueued { id })?;
            Ok(Some(id))
        })
    }

    /// Clear a post for publication. Idempotent; a no-op on already
    /// approved or terminal rows.
    pub fn approve(&self, id: PostId) -> Result<()> {
        let now = Utc::now();
        self.with_tx(|conn| {
            let row: Option<(String, bool)> = conn
                .query_row(
                    "SELECT status, approved FROM posts WHERE id = ?1",
                    params![id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (status, approved) = row.ok_or(Error::NotFound(id))?;
            let status: Status = status.parse()?;
            if approved || status.is_terminal() {
                return Ok(());
            }
            conn.execute("UPDATE posts SET approved = 1 WHERE id = ?1", params![id.0])?;
            record_event_on(conn, now, &EventKind::Approved { id })?;
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Claim up to `max` eligible posts, oldest first.
    ///
    /// Eligible means pending, approved, and past any retry cooldown. Each
    /// candidate is taken with a conditional update guarded on
    /// `status = 'pending'`; only rows where the update applied are
    /// returned. That guard is the sole concurrency primitive — a race
    /// between two claimers on the same row has at most one winner, and no
    /// other row is touched.
    pub fn claim(&self, max: usize) -> Result<Vec<PostItem>> {
        self.claim_at(max, Utc::now())
    }

    pub fn claim_at(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<PostItem>> {
        let now_s = ts(now);
        self.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM posts
                 WHERE status = 'pending' AND approved = 1
                   AND (next_try_at IS NULL OR next_try_at <= ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let candidates = stmt
                .query_map(params![now_s, max as i64], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut claimed = Vec::with_capacity(candidates.len());
            for raw_id in candidates {
                let applied = conn.execute(
                    "UPDATE posts SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                    params![raw_id],
                )?;
                if applied == 1 {
                    let id = PostId(raw_id);
                    record_event_on(conn, now, &EventKind::Claimed { id })?;
                    claimed.push(get_post_on(conn, id)?);
                }
            }
            Ok(claimed)
        })
    }

    // -----------------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------------

    /// Resolve a claim as delivered: processing -> sent.
    ///
    /// `confirmed` records whether the channel explicitly acknowledged or
    /// success was inferred from side-channel evidence.
    pub fn commit_success(&self, id: PostId, confirmed: bool) -> Result<PostItem> {
        self.commit_success_at(id, confirmed, Utc::now())
    }

    pub fn commit_success_at(
        &self,
        id: PostId,
        confirmed: bool,
        now: DateTime<Utc>,
    ) -> Result<PostItem> {
        self.with_tx(|conn| {
            let current = get_post_on(conn, id)?;
            ensure_transition(current.status, Status::Sent)?;
            conn.execute(
                "UPDATE posts SET status = 'sent', sent_at = ?1, next_try_at = NULL
                 WHERE id = ?2 AND status = 'processing'",
                params![ts(now), id.0],
            )?;
            record_event_on(conn, now, &EventKind::Delivered { id, confirmed })?;
            get_post_on(conn, id)
        })
    }

    /// Resolve a claim as a retryable failure.
    ///
    /// Bumps the attempt count by exactly one. Under the cap the row goes
    /// back to pending with a cooldown from the backoff table; at the cap
    /// it goes to failed for good.
    pub fn commit_retry(&self, id: PostId, reason: FailureReason) -> Result<PostItem> {
        self.commit_retry_at(id, reason, Utc::now())
    }

    pub fn commit_retry_at(
        &self,
        id: PostId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<PostItem> {
        self.with_tx(|conn| {
            let current = get_post_on(conn, id)?;
            let attempts = current.attempts + 1;

            if attempts >= MAX_ATTEMPTS {
                ensure_transition(current.status, Status::Failed)?;
                conn.execute(
                    "UPDATE posts SET status = 'failed', attempts = ?1
                     WHERE id = ?2 AND status = 'processing'",
                    params![attempts, id.0],
                )?;
                record_event_on(
                    conn,
                    now,
                    &EventKind::Exhausted {
                        id,
                        reason,
                        attempts,
                    },
                )?;
            } else {
                ensure_transition(current.status, Status::Pending)?;
                let delay = backoff::delay_for(reason, attempts);
                // Zero delay means eligible immediately, same as a fresh row.
                let next_try = if delay.as_secs() == 0 {
                    None
                } else {
                    Some(ts(now + ChronoDuration::seconds(delay.as_secs() as i64)))
                };
                conn.execute(
                    "UPDATE posts SET status = 'pending', attempts = ?1, next_try_at = ?2
                     WHERE id = ?3 AND status = 'processing'",
                    params![attempts, next_try, id.0],
                )?;
                record_event_on(
                    conn,
                    now,
                    &EventKind::RetryScheduled {
                        id,
                        reason,
                        attempt: attempts,
                        delay_secs: delay.as_secs(),
                    },
                )?;
            }
            get_post_on(conn, id)
        })
    }

    /// Resolve a claim as non-retryable: processing -> failed without
    /// touching the attempt count. Used for duplicate-at-delivery and
    /// other classifications where retrying cannot help.
    pub fn commit_terminal_failure(&self, id: PostId, reason: FailureReason) -> Result<PostItem> {
        self.commit_terminal_failure_at(id, reason, Utc::now())
    }

    pub fn commit_terminal_failure_at(
        &self,
        id: PostId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<PostItem> {
        self.with_tx(|conn| {
            let current = get_post_on(conn, id)?;
            ensure_transition(current.status, Status::Failed)?;
            conn.execute(
                "UPDATE posts SET status = 'failed' WHERE id = ?1 AND status = 'processing'",
                params![id.0],
            )?;
            record_event_on(conn, now, &EventKind::Discarded { id, reason })?;
            get_post_on(conn, id)
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Was this canonical text ever delivered by a row other than
    /// `excluding`? The delivery-time duplicate guard.
    pub fn was_sent(&self, canon: &str, excluding: PostId) -> Result<bool> {
        let conn = self.lock()?;
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM posts
                 WHERE canon = ?1 AND status = 'sent' AND sent_at IS NOT NULL AND id <> ?2
                 LIMIT 1",
                params![canon, excluding.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Get a post by ID.
    pub fn get(&self, id: PostId) -> Result<PostItem> {
        let conn = self.lock()?;
        get_post_on(&conn, id)
    }

    /// List posts, optionally filtered by status, oldest first.
    pub fn list(&self, status: Option<Status>, limit: i64) -> Result<Vec<PostItem>> {
        let conn = self.lock()?;
        let mut rows = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM posts WHERE status = ?1
                     ORDER BY created_at ASC, id ASC LIMIT ?2"
                ))?;
                let mapped = stmt.query_map(params![status.to_string(), limit], PostRow::from_row)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM posts ORDER BY created_at ASC, id ASC LIMIT ?1"
                ))?;
                let mapped = stmt.query_map(params![limit], PostRow::from_row)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
        }
        rows.into_iter().map(PostRow::into_post).collect()
    }

    /// Get events after a sequence number, in order.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let seq: i64 = row.get(0)?;
                let timestamp: String = row.get(1)?;
                let kind_str: String = row.get(2)?;
                Ok((seq, timestamp, kind_str))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        events
            .into_iter()
            .map(|(seq, timestamp, kind_str)| {
                Ok(Event {
                    seq: seq as u64,
                    timestamp: parse_ts(&timestamp)?,
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("store mutex poisoned".to_string()))
    }

    /// Execute a closure within a transaction: commits on Ok, rolls back
    /// on Err.
    ///
    /// Immediate mode takes the write lock upfront. Every caller here
    /// writes, and read-then-upgrade under WAL can fail with a stale
    /// snapshot when independent connections race on the same file.
    fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn init(conn: &Connection) -> Result<()> {
    // WAL for concurrent readers; busy timeout so independent handles on
    // the same file queue up instead of failing fast.
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS posts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            text        TEXT NOT NULL,
            canon       TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending',
            approved    INTEGER NOT NULL DEFAULT 0,
            attempts    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            sent_at     TEXT,
            next_try_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_posts_canon ON posts(canon);
        CREATE INDEX IF NOT EXISTS idx_posts_claimable ON posts(created_at ASC, id ASC)
            WHERE status = 'pending';

        CREATE TABLE IF NOT EXISTS events (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp   TEXT NOT NULL,
            kind        TEXT NOT NULL
        );
        ",
    )?;

    Ok(())
}

fn ensure_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {s:?}: {e}")))
}

fn get_post_on(conn: &Connection, id: PostId) -> Result<PostItem> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM posts WHERE id = ?1"),
            params![id.0],
            PostRow::from_row,
        )
        .optional()?;
    row.ok_or(Error::NotFound(id))?.into_post()
}

fn record_event_on(conn: &Connection, now: DateTime<Utc>, kind: &EventKind) -> Result<()> {
    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![ts(now), serde_json::to_string(kind).unwrap_or_default()],
    )?;
    Ok(())
}

/// Internal row shape before timestamp/status parsing.
struct PostRow {
    id: i64,
    text: String,
    canon: String,
    status: String,
    approved: bool,
    attempts: i64,
    created_at: String,
    sent_at: Option<String>,
    next_try_at: Option<String>,
}

impl PostRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            canon: row.get(2)?,
            status: row.get(3)?,
            approved: row.get(4)?,
            attempts: row.get(5)?,
            created_at: row.get(6)?,
            sent_at: row.get(7)?,
            next_try_at: row.get(8)?,
        })
    }

    fn into_post(self) -> Result<PostItem> {
        Ok(PostItem {
            id: PostId(self.id),
            text: self.text,
            canon: self.canon,
            status: self.status.parse()?,
            approved: self.approved,
            attempts: self.attempts as u32,
            created_at: parse_ts(&self.created_at)?,
            sent_at: self.sent_at.as_deref().map(parse_ts).transpose()?,
            next_try_at: self.next_try_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
