//! Bounded, FIFO-fair connection pool.
//!
//! Every connection is owned either by the pool's available queue or
//! by exactly one borrower; residence changes atomically under a
//! single mutex whose critical section never suspends.

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::types::TransactionStatus;
use crate::row::Row;

/// Successive validation failures tolerated before a borrow gives up.
const MAX_VALIDATION_FAILURES: u32 = 3;

/// Message delivered to a suspended borrower.
enum Wake {
    /// A connection became available.
    Ready(Connection),
    /// The would-be connection was closed; retry (a slot is free now).
    Retry,
}

/// Fate of a returned connection, decided under the pool lock.
enum Verdict {
    Pooled,
    Discard(Connection),
    RejectClose(Connection),
    RejectKeep(Connection),
}

struct PoolState {
    available: VecDeque<Connection>,
    waiters: VecDeque<oneshot::Sender<Wake>>,
    /// Connections alive: available + borrowed + being created.
    live: usize,
    closed: bool,
}

struct PoolInner {
    config: Config,
    state: Mutex<PoolState>,
}

/// Observable pool counters, for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections in the pool
    pub available: usize,
    /// Connections alive (idle + borrowed + in creation)
    pub live: usize,
    /// Suspended borrowers
    pub waiters: usize,
    /// Whether the pool has been closed
    pub closed: bool,
}

/// Outcome of an explicit return to the pool.
#[derive(Debug)]
pub enum Checkin {
    /// Accepted: reinserted or handed to the oldest waiter.
    Pooled,
    /// The connection was broken or mid-transaction and was closed.
    Discarded,
    /// The pool is closed; the connection was closed per
    /// `close_returned_on_closed_pool`.
    RejectedClosed,
    /// The pool is closed; the configuration keeps returned
    /// connections open, so it is handed back.
    RejectedOpen(Connection),
}

impl Checkin {
    /// True when the return was refused because the pool had already
    /// been closed.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Checkin::RejectedClosed | Checkin::RejectedOpen(_))
    }
}

/// Bounded pool of ready connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool. With `connect_eagerly` set, all `size`
    /// connections are established before this returns.
    pub async fn new(config: Config) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    available: VecDeque::new(),
                    waiters: VecDeque::new(),
                    live: 0,
                    closed: false,
                }),
                config,
            }),
        };

        if pool.inner.config.pool.connect_eagerly {
            for _ in 0..pool.inner.config.pool.size {
                match Connection::connect(pool.inner.config.clone()).await {
                    Ok(conn) => {
                        let mut state = pool.state();
                        state.live += 1;
                        state.available.push_back(conn);
                    }
                    Err(error) => {
                        pool.close().await;
                        return Err(error);
                    }
                }
            }
        }

        Ok(pool)
    }

    /// Create a pool from a URL or prebuilt config.
    pub async fn connect<C: TryInto<Config>>(config: C) -> Result<Self>
    where
        Error: From<C::Error>,
    {
        Self::new(config.try_into()?).await
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current pool counters.
    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        PoolStatus {
            available: state.available.len(),
            live: state.live,
            waiters: state.waiters.len(),
            closed: state.closed,
        }
    }

    /// Borrow a connection, waiting at most `timeout` (the configured
    /// borrow timeout when `None`).
    ///
    /// Fails with `PoolClosed` on a closed pool and `BorrowTimeout`
    /// when no connection frees up in time. Waiters are served in FIFO
    /// order.
    pub async fn borrow(&self, timeout: Option<std::time::Duration>) -> Result<PooledConn> {
        let timeout = timeout.unwrap_or(self.inner.config.pool.borrow_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut validation_failures = 0u32;

        loop {
            enum Plan {
                Take(Connection),
                Create,
                Wait(oneshot::Receiver<Wake>),
            }

            let plan = {
                let mut state = self.state();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(conn) = state.available.pop_front() {
                    Plan::Take(conn)
                } else if state.live < self.inner.config.pool.size {
                    // Reserve the slot before suspending to connect.
                    state.live += 1;
                    Plan::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
            };

            let reused = match plan {
                Plan::Take(conn) => conn,
                Plan::Create => match Connection::connect(self.inner.config.clone()).await {
                    Ok(conn) => return Ok(self.guard(conn)),
                    Err(error) => {
                        let waiter = {
                            let mut state = self.state();
                            state.live -= 1;
                            state.waiters.pop_front()
                        };
                        // Don't strand the next borrower on a slot that
                        // just freed up.
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Wake::Retry);
                        }
                        return Err(error);
                    }
                },
                Plan::Wait(rx) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(Ok(Wake::Ready(conn))) => conn,
                    Ok(Ok(Wake::Retry)) => continue,
                    Ok(Err(_)) => return Err(Error::PoolClosed),
                    Err(_) => return Err(Error::BorrowTimeout),
                },
            };

            match self.validate(reused, deadline).await {
                Ok(conn) => return Ok(self.guard(conn)),
                Err(ValidationOutcome::Failed) => {
                    validation_failures += 1;
                    if validation_failures >= MAX_VALIDATION_FAILURES {
                        return Err(Error::ValidationFailed);
                    }
                }
                Err(ValidationOutcome::TimedOut) => return Err(Error::BorrowTimeout),
            }
        }
    }

    /// Run the validation query on a reused connection.
    async fn validate(
        &self,
        mut conn: Connection,
        deadline: tokio::time::Instant,
    ) -> core::result::Result<Connection, ValidationOutcome> {
        let Some(sql) = self.inner.config.pool.validation_query.clone() else {
            return Ok(conn);
        };

        let checked = tokio::time::timeout_at(deadline, async {
            conn.query(&sql).await?.into_result().map(|_| ())
        })
        .await;

        match checked {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "pooled connection failed validation");
                self.discard(conn).await;
                Err(ValidationOutcome::Failed)
            }
            Err(_) => {
                self.discard(conn).await;
                Err(ValidationOutcome::TimedOut)
            }
        }
    }

    /// Close a connection and release its slot, nudging a waiter.
    async fn discard(&self, mut conn: Connection) {
        conn.terminate().await;
        let waiter = {
            let mut state = self.state();
            state.live -= 1;
            state.waiters.pop_front()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Wake::Retry);
        }
    }

    fn guard(&self, conn: Connection) -> PooledConn {
        PooledConn {
            conn: ManuallyDrop::new(conn),
            pool: self.clone(),
        }
    }

    /// Borrow a connection, run `body` on it, and return it when the
    /// body's future completes (success or failure). The body's result
    /// is propagated.
    pub async fn with_connection<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnOnce(PooledConn) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.borrow(None).await?;
        body(conn).await
    }

    /// Convenience: run a simple query on a pooled connection and
    /// collect all rows.
    pub async fn query_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let mut conn = self.borrow(None).await?;
        conn.query_rows(sql).await
    }

    /// Explicitly return a borrowed connection.
    ///
    /// Broken or non-idle connections are closed instead of
    /// reinserted. Returns to a closed pool are rejected; whether the
    /// connection is closed follows `close_returned_on_closed_pool`.
    pub async fn checkin(&self, conn: PooledConn) -> Checkin {
        let conn = PooledConn::take(conn);
        self.release(conn).await
    }

    /// The locked half of a return: update accounting and decide the
    /// connection's fate. Never suspends.
    fn settle(&self, mut conn: Connection) -> Verdict {
        let unusable = conn.is_broken()
            || conn.is_closed()
            || conn.transaction_status() != TransactionStatus::Idle;

        let mut state = self.state();
        if state.closed {
            state.live -= 1;
            if self.inner.config.pool.close_returned_on_closed_pool {
                Verdict::RejectClose(conn)
            } else {
                Verdict::RejectKeep(conn)
            }
        } else if unusable {
            state.live -= 1;
            if let Some(waiter) = state.waiters.pop_front() {
                let _ = waiter.send(Wake::Retry);
            }
            Verdict::Discard(conn)
        } else {
            // Oldest waiter first; a receiver that timed out hands
            // the connection back for the next one.
            loop {
                match state.waiters.pop_front() {
                    Some(waiter) => match waiter.send(Wake::Ready(conn)) {
                        Ok(()) => break Verdict::Pooled,
                        Err(Wake::Ready(returned)) => conn = returned,
                        Err(Wake::Retry) => unreachable!("only Ready is sent here"),
                    },
                    None => {
                        state.available.push_back(conn);
                        break Verdict::Pooled;
                    }
                }
            }
        }
    }

    async fn release(&self, conn: Connection) -> Checkin {
        match self.settle(conn) {
            Verdict::Pooled => Checkin::Pooled,
            Verdict::Discard(mut conn) => {
                conn.terminate().await;
                Checkin::Discarded
            }
            Verdict::RejectClose(mut conn) => {
                conn.terminate().await;
                Checkin::RejectedClosed
            }
            Verdict::RejectKeep(conn) => Checkin::RejectedOpen(conn),
        }
    }

    /// Release on the synchronous drop path. When a runtime is present
    /// the polite Terminate of discarded connections runs on a task;
    /// without one the socket simply closes with the value.
    fn release_sync(&self, conn: Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move {
                    let _ = pool.release(conn).await;
                });
            }
            Err(_) => match self.settle(conn) {
                Verdict::Pooled => {}
                Verdict::Discard(conn)
                | Verdict::RejectClose(conn)
                | Verdict::RejectKeep(conn) => drop(conn),
            },
        }
    }

    /// Close the pool: mark it closed, close every idle connection,
    /// and wake all waiters with `PoolClosed`.
    pub async fn close(&self) {
        let (conns, waiters) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.live -= state.available.len();
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.waiters),
            )
        };

        // Dropping the senders resolves every waiter with PoolClosed.
        drop(waiters);

        for mut conn in conns {
            conn.terminate().await;
        }
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("Pool")
            .field("size", &self.inner.config.pool.size)
            .field("status", &status)
            .finish()
    }
}

enum ValidationOutcome {
    Failed,
    TimedOut,
}

/// A borrowed connection that returns itself to the pool on drop.
///
/// The borrower holds sole ownership until release; dropping the guard
/// hands the connection back on every exit path.
pub struct PooledConn {
    conn: ManuallyDrop<Connection>,
    pool: Pool,
}

impl PooledConn {
    fn take(guard: PooledConn) -> Connection {
        let mut guard = ManuallyDrop::new(guard);
        // SAFETY: the guard's Drop never runs; each field is moved out
        // exactly once and never touched again.
        let conn = unsafe { ManuallyDrop::take(&mut guard.conn) };
        let _pool = unsafe { std::ptr::read(&guard.pool) };
        conn
    }

    /// Detach the connection from the pool, releasing its slot.
    pub fn detach(guard: PooledConn) -> Connection {
        let pool = guard.pool.clone();
        let conn = Self::take(guard);
        let mut state = pool.state();
        state.live -= 1;
        if let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.send(Wake::Retry);
        }
        conn
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        // SAFETY: conn is never accessed after this
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release_sync(conn);
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &*self.conn)
            .finish()
    }
}
