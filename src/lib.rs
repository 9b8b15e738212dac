pub mod api;
pub mod config;
pub mod cors;
pub mod database;
pub mod error;
pub mod models;
pub mod pool;
pub mod repo;
pub mod schema;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{serve::Serve, Router};
use tokio::net::TcpListener;
use tracing::info;

use api::build_app;
use config::Config;
use database::{create_db_pool, DatabaseBookRepo, SqlitePool};
use error::StartupError;

/// A bound server that has not started accepting requests yet.
pub struct Server {
    local_addr: SocketAddr,
    pool: Arc<SqlitePool>,
    serve: Serve<TcpListener, Router, Router>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &Arc<SqlitePool> {
        &self.pool
    }

    /// Serves requests until `shutdown` resolves, lets in-flight requests
    /// finish, then closes the pooled connections.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let result = self.serve.with_graceful_shutdown(shutdown).await;
        self.pool.close();
        result
    }
}

pub async fn start_server(config: &Config) -> Result<Server, StartupError> {
    let pool = Arc::new(create_db_pool(config)?);
    let repo = DatabaseBookRepo::new(pool.clone(), config.key_mode)?;

    let router = build_app(repo);

    let listener = TcpListener::bind(config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Listening on {}", local_addr);

    Ok(Server {
        local_addr,
        pool,
        serve: axum::serve(listener, router),
    })
}
