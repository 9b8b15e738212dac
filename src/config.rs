use std::net::SocketAddr;

use clap::builder::RangedU64ValueParser;
use clap::Parser;

use crate::models::KeyMode;

/// Book catalog HTTP service.
///
/// Every option can also be set through the environment or a `.env` file.
#[derive(Parser, Debug, Clone)]
#[command(name = "bookshelf_api", version)]
pub struct Config {
    /// SQLite database file (created if missing)
    #[arg(long, env = "DATABASE_URL", default_value = "books.db")]
    pub database_url: String,

    /// Address the HTTP listener binds to
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: SocketAddr,

    /// Number of pooled database connections
    #[arg(
        long,
        env = "POOL_SIZE",
        default_value_t = 5,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub pool_size: usize,

    /// How long a request waits for a free connection before failing with 503
    #[arg(long, env = "POOL_TIMEOUT_MS", default_value_t = 5_000)]
    pub pool_timeout_ms: u64,

    /// How long a statement waits on a locked database file
    #[arg(long, env = "BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    pub busy_timeout_ms: u64,

    /// Whether book IDs are assigned by the store or supplied by callers
    #[arg(long, env = "BOOK_KEY_MODE", value_enum, default_value_t = KeyMode::Surrogate)]
    pub key_mode: KeyMode,
}

impl Config {
    /// Defaults for everything except the database location.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Config {
            database_url: database_url.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            pool_size: 5,
            pool_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            key_mode: KeyMode::Surrogate,
        }
    }
}
