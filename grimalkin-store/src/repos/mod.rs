//! Store implementations
//!
//! Each repository borrows the pool and owns a disjoint set of tables:
//! - every call checks out one connection and returns it when done
//! - multi-row writes go out as one batch, never row by row
//! - no read-after-write checks; a write acknowledgement is trusted

pub mod likes;
pub mod questions;
pub mod users;

pub use likes::LikesRepo;
pub use questions::QuestionRepo;
pub use users::{FollowCounts, UserRepo};

use grimalkin_core::RequestContext;

use crate::backend::{was_applied, BatchKind, Connector, Row, Statement};
use crate::error::Result;
use crate::pool::Pool;

/// Run one statement on a freshly checked-out connection.
pub(crate) async fn run<C: Connector>(
    pool: &Pool<C>,
    ctx: &RequestContext,
    context: &str,
    statement: Statement,
) -> Result<Vec<Row>> {
    let mut conn = pool.acquire(ctx).await?;
    conn.execute(ctx, context, statement).await
}

/// Run a conditional write; true when it changed a row.
pub(crate) async fn run_conditional<C: Connector>(
    pool: &Pool<C>,
    ctx: &RequestContext,
    context: &str,
    statement: Statement,
) -> Result<bool> {
    let rows = run(pool, ctx, context, statement).await?;
    Ok(was_applied(&rows)?)
}

/// Run one batch on a freshly checked-out connection.
pub(crate) async fn run_batch<C: Connector>(
    pool: &Pool<C>,
    ctx: &RequestContext,
    context: &str,
    kind: BatchKind,
    statements: Vec<Statement>,
) -> Result<()> {
    let mut conn = pool.acquire(ctx).await?;
    conn.execute_batch(ctx, context, kind, statements).await
}
