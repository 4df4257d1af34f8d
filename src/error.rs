//! Error types for newsrelay.

use thiserror::Error;

use crate::model::{PostId, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("post not found: {0}")]
    NotFound(PostId),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
