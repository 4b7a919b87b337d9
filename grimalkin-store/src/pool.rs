//! Typed connection pool
//!
//! - dials lazily: the first checkout (and any checkout that finds no idle
//!   connection) dials a new one, so sizing is unbounded on demand
//! - a checkout is a [`PooledConnection`] guard; dropping it returns the
//!   connection, on success, error and cancellation paths alike
//! - connections that timed out or report themselves broken are discarded
//! - at most `max_idle` connections are kept for reuse

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use grimalkin_core::RequestContext;
use tracing::{debug, warn};

use crate::backend::{BackendError, BatchKind, Connection, Connector, Row, Statement};
use crate::error::{Result, StoreError};

/// Default number of idle connections retained.
pub const DEFAULT_MAX_IDLE: usize = 16;

struct PoolInner<C: Connector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    max_idle: usize,
    target: String,
}

impl<C: Connector> PoolInner<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<C::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of connections of one concrete type; cheap to clone.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, max_idle: usize) -> Self {
        let target = connector.describe();
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(Vec::new()),
                max_idle,
                target,
            }),
        }
    }

    /// Check out a connection, dialing one if none is idle.
    ///
    /// # Errors
    ///
    /// `Unavailable` when dialing or authentication fails,
    /// `DeadlineExceeded` when the request deadline passes first.
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<PooledConnection<C>> {
        if ctx.is_expired() {
            return Err(StoreError::DeadlineExceeded {
                context: "acquiring a connection".to_string(),
            });
        }

        let reused = self.inner.idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!(endpoint = %self.inner.target, "No idle connection, dialing");
                within_deadline(ctx, self.inner.connector.connect())
                    .await
                    .ok_or_else(|| StoreError::DeadlineExceeded {
                        context: format!("dialing {}", self.inner.target),
                    })?
                    .map_err(|source| StoreError::Unavailable {
                        target: self.inner.target.clone(),
                        source,
                    })?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            discard: false,
        })
    }

    /// Return a connection early; equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<C>) {
        drop(conn);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    /// Connection target with credentials stripped.
    pub fn target(&self) -> &str {
        &self.inner.target
    }
}

/// A checked-out connection.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    discard: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Drop the connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Run one statement under the request deadline.
    pub async fn execute(
        &mut self,
        ctx: &RequestContext,
        context: &str,
        statement: Statement,
    ) -> Result<Vec<Row>> {
        let conn = self.live(ctx, context)?;
        let outcome = within_deadline(ctx, conn.execute(statement)).await;
        self.settle(context, outcome)
    }

    /// Run one batch under the request deadline.
    pub async fn execute_batch(
        &mut self,
        ctx: &RequestContext,
        context: &str,
        kind: BatchKind,
        statements: Vec<Statement>,
    ) -> Result<()> {
        let conn = self.live(ctx, context)?;
        let outcome = within_deadline(ctx, conn.execute_batch(kind, statements)).await;
        self.settle(context, outcome)
    }

    fn live(&mut self, ctx: &RequestContext, context: &str) -> Result<&mut C::Connection> {
        if ctx.is_expired() {
            return Err(StoreError::DeadlineExceeded {
                context: context.to_string(),
            });
        }
        self.conn.as_mut().ok_or_else(|| StoreError::Unavailable {
            target: self.pool.target.clone(),
            source: BackendError::Refused {
                reason: "connection already released".to_string(),
            },
        })
    }

    fn settle<T>(
        &mut self,
        context: &str,
        outcome: Option<std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        match outcome {
            None => {
                self.discard = true;
                Err(StoreError::DeadlineExceeded {
                    context: context.to_string(),
                })
            }
            Some(Err(source)) => {
                if source.breaks_connection() {
                    self.discard = true;
                }
                Err(StoreError::storage(context, source))
            }
            Some(Ok(value)) => Ok(value),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.discard || !conn.is_reusable() {
            warn!(endpoint = %self.pool.target, "Discarding unusable connection");
            return;
        }
        let mut idle = self.pool.idle();
        if idle.len() < self.pool.max_idle {
            idle.push(conn);
        }
    }
}

/// `None` when the context deadline passed before `fut` finished.
async fn within_deadline<F: Future>(ctx: &RequestContext, fut: F) -> Option<F::Output> {
    match ctx.deadline() {
        Some(deadline) => {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
                .await
                .ok()
        }
        None => Some(fut.await),
    }
}
