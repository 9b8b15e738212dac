//! A small blocking connection pool.
//!
//! Handles are checked out through [`PooledConnection`] guards and go back
//! into the idle set when the guard drops, so every exit path of a caller
//! returns its handle exactly once. When nothing is idle and the pool is at
//! capacity, callers wait up to `acquire_timeout` for a handle to come back.

use std::error::Error;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::PoolError;

/// Opens and checks connections for a [`ConnectionPool`].
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: Error + Send + Sync + 'static;

    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Checked on return. Broken connections are closed instead of reused.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Handles in existence, idle or checked out
    pub connections: usize,
    pub idle_connections: usize,
}

struct Slots<C> {
    idle: Vec<C>,
    connections: usize,
    closed: bool,
}

pub struct ConnectionPool<M: ConnectionManager> {
    manager: M,
    max_size: usize,
    acquire_timeout: Duration,
    slots: Mutex<Slots<M::Connection>>,
    returned: Condvar,
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Eagerly opens `max_size` connections.
    ///
    /// A connection that fails to open is logged and skipped; the pool will
    /// try again on demand later. Only a pool with no live connections at
    /// all is an error.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, PoolError<M::Error>> {
        let max_size = config.max_size;
        if max_size == 0 {
            return Err(PoolError::EmptyPool);
        }
        let mut idle = Vec::with_capacity(max_size);
        let mut last_error = None;

        for n in 1..=max_size {
            match manager.connect() {
                Ok(conn) => idle.push(conn),
                Err(e) => {
                    warn!("Error creating connection {} of {} for pool: {}", n, max_size, e);
                    last_error = Some(e);
                }
            }
        }

        if let (true, Some(source)) = (idle.is_empty(), last_error) {
            return Err(PoolError::NoConnections {
                attempted: max_size,
                source,
            });
        }

        info!("Connection pool created with {} of {} connections", idle.len(), max_size);

        Ok(ConnectionPool {
            manager,
            max_size,
            acquire_timeout: config.acquire_timeout,
            slots: Mutex::new(Slots {
                connections: idle.len(),
                idle,
                closed: false,
            }),
            returned: Condvar::new(),
        })
    }

    /// Takes an idle connection, opening a new one if the pool is below
    /// capacity, or waits for one to be returned.
    pub fn acquire(&self) -> Result<PooledConnection<'_, M>, PoolError<M::Error>> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut slots = self.lock_slots();

        loop {
            if slots.closed {
                return Err(PoolError::Closed);
            }

            if let Some(conn) = slots.idle.pop() {
                debug!(idle = slots.idle.len(), "Checked out pooled connection");
                return Ok(PooledConnection::new(self, conn));
            }

            if slots.connections < self.max_size {
                // Reserve the slot before connecting so concurrent callers
                // cannot overshoot max_size while the lock is released.
                slots.connections += 1;
                drop(slots);
                return self.open_reserved();
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Connection pool exhausted after waiting {:?}", self.acquire_timeout);
                return Err(PoolError::Exhausted {
                    timeout: self.acquire_timeout,
                });
            }

            let (guard, _) = self
                .returned
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slots = guard;
        }
    }

    pub fn state(&self) -> PoolState {
        let slots = self.lock_slots();
        PoolState {
            connections: slots.connections,
            idle_connections: slots.idle.len(),
        }
    }

    /// Closes every idle connection. Connections still checked out are
    /// closed as their guards drop, and later `acquire` calls fail.
    pub fn close(&self) {
        let drained: Vec<M::Connection> = {
            let mut slots = self.lock_slots();
            slots.closed = true;
            slots.connections -= slots.idle.len();
            slots.idle.drain(..).collect()
        };
        self.returned.notify_all();

        info!("Closed {} idle pool connections", drained.len());
        drop(drained);
    }

    fn open_reserved(&self) -> Result<PooledConnection<'_, M>, PoolError<M::Error>> {
        match self.manager.connect() {
            Ok(conn) => {
                info!("Opened a new pool connection on demand");
                Ok(PooledConnection::new(self, conn))
            }
            Err(e) => {
                self.lock_slots().connections -= 1;
                self.returned.notify_one();
                Err(PoolError::Connect(e))
            }
        }
    }

    fn release(&self, mut conn: M::Connection) {
        let broken = self.manager.has_broken(&mut conn);
        let mut slots = self.lock_slots();

        if broken || slots.closed {
            slots.connections -= 1;
            drop(slots);
            if broken {
                warn!("Discarded a broken pool connection");
            }
            drop(conn);
        } else {
            slots.idle.push(conn);
            debug!(idle = slots.idle.len(), "Returned connection to pool");
            drop(slots);
        }

        self.returned.notify_one();
    }

    // Every critical section is a single push, pop or counter update, so a
    // panic elsewhere can never leave the slots half-written.
    fn lock_slots(&self) -> MutexGuard<'_, Slots<M::Connection>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one pooled connection. Returned to the pool on drop.
pub struct PooledConnection<'a, M: ConnectionManager> {
    pool: &'a ConnectionPool<M>,
    conn: Option<M::Connection>,
}

impl<'a, M: ConnectionManager> PooledConnection<'a, M> {
    fn new(pool: &'a ConnectionPool<M>, conn: M::Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until the guard drops")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until the guard drops")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
