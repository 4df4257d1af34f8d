//! Typed configuration from environment variables.
//!
//! Loads once at startup. Everything has a sensible default; malformed
//! values fail fast instead of being silently ignored.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Worker poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Outer bound on a single delivery attempt.
    pub delivery_timeout: Duration,
    /// Posts claimed per worker cycle.
    pub claim_batch: usize,
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            db_path: PathBuf::from(
                std::env::var("NEWSRELAY_DB").unwrap_or_else(|_| "newsrelay.db".to_string()),
            ),
            poll_interval: Duration::from_secs(parsed_var("NEWSRELAY_POLL_SECS", 2)?),
            delivery_timeout: Duration::from_secs(parsed_var(
                "NEWSRELAY_DELIVERY_TIMEOUT_SECS",
                30,
            )?),
            claim_batch: parsed_var("NEWSRELAY_CLAIM_BATCH", 1)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has unparseable value {raw:?}"))),
        Err(_) => Ok(default),
    }
}
