use std::time::Duration;

use thiserror::Error;

use crate::models::{BookId, KeyMode};

/// Caller mistakes detected before the store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid book ID: {0}")]
    InvalidId(String),
}

#[derive(Debug, Error)]
pub enum PoolError<E> {
    #[error("no connection became available within {timeout:?}")]
    Exhausted { timeout: Duration },

    #[error("the connection pool has been closed")]
    Closed,

    #[error("the connection pool size must be at least 1")]
    EmptyPool,

    #[error("failed to open a new connection: {0}")]
    Connect(#[source] E),

    #[error("none of the {attempted} pool connections could be opened: {source}")]
    NoConnections {
        attempted: usize,
        #[source]
        source: E,
    },
}

pub type SqlitePoolError = PoolError<diesel::ConnectionError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("a book with ID {0} already exists")]
    Conflict(BookId),

    #[error("problem getting a connection from the connection pool: {0}")]
    Pool(#[from] SqlitePoolError),

    #[error("problem executing a statement against the DB: {0}")]
    Store(#[from] diesel::result::Error),

    #[error("the DB reported an unexpected result: {0}")]
    Integrity(String),
}

/// Reasons the service cannot come up. All of them end the process.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("could not initialize the connection pool: {0}")]
    Pool(#[from] SqlitePoolError),

    #[error("could not prepare the books table: {0}")]
    Schema(#[source] RepoError),

    #[error("the books table was created for {found} keys but {configured} keys are configured")]
    KeyModeMismatch { configured: KeyMode, found: KeyMode },

    #[error("could not bind the HTTP listener: {0}")]
    Bind(#[from] std::io::Error),
}
