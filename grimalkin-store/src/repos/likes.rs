//! Likes store
//!
//! One counter row per answered question in `q_and_a_likes`. The counter
//! is only ever moved by deltas, so concurrent likes commute in the store
//! and nothing here reads before writing. There is no floor: unliking a
//! question nobody liked drives it negative.

use grimalkin_core::RequestContext;
use tracing::debug;
use uuid::Uuid;

use super::run;
use crate::backend::{Cell, Connector, Select, Statement, Value};
use crate::error::Result;
use crate::pool::Pool;
use crate::schema::Q_AND_A_LIKES;

/// Likes store
pub struct LikesRepo<'a, C: Connector> {
    pool: &'a Pool<C>,
}

impl<'a, C: Connector> LikesRepo<'a, C> {
    pub fn new(pool: &'a Pool<C>) -> Self {
        Self { pool }
    }

    /// Create the counter row at zero. Safe to repeat.
    pub async fn create_likes_entry(&self, ctx: &RequestContext, question_id: Uuid) -> Result<()> {
        self.add(ctx, question_id, 0, "initialising likes counter").await
    }

    pub async fn like(&self, ctx: &RequestContext, question_id: Uuid) -> Result<()> {
        self.add(ctx, question_id, 1, "liking answer").await
    }

    pub async fn unlike(&self, ctx: &RequestContext, question_id: Uuid) -> Result<()> {
        self.add(ctx, question_id, -1, "unliking answer").await
    }

    /// Current like count; a question without a counter row has zero.
    pub async fn get_likes(&self, ctx: &RequestContext, question_id: Uuid) -> Result<i64> {
        let rows = run(
            self.pool,
            ctx,
            "reading likes",
            Statement::Select(Select::partition(&Q_AND_A_LIKES, key(question_id))),
        )
        .await?;
        match rows.first() {
            Some(row) => Ok(row.counter("likes")?),
            None => Ok(0),
        }
    }

    pub async fn delete_likes_entry(&self, ctx: &RequestContext, question_id: Uuid) -> Result<()> {
        run(
            self.pool,
            ctx,
            "deleting likes counter",
            Statement::Delete {
                table: &Q_AND_A_LIKES,
                key: key(question_id),
            },
        )
        .await?;
        Ok(())
    }

    async fn add(
        &self,
        ctx: &RequestContext,
        question_id: Uuid,
        delta: i64,
        context: &str,
    ) -> Result<()> {
        run(
            self.pool,
            ctx,
            context,
            Statement::CounterAdd {
                table: &Q_AND_A_LIKES,
                key: key(question_id),
                column: "likes",
                delta,
            },
        )
        .await?;
        debug!(%question_id, delta, "Applied likes delta");
        Ok(())
    }
}

fn key(question_id: Uuid) -> Vec<Cell> {
    vec![("question_id", Value::uuid(question_id))]
}

#[cfg(test)]
mod tests {
    use grimalkin_core::new_time_uuid;

    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryConnector};
    use crate::schema::provision;

    async fn setup() -> (MemoryCluster, Pool<MemoryConnector>) {
        let cluster = MemoryCluster::new();
        let pool = Pool::new(cluster.connector("main", "t"), 4);
        provision(&pool).await.unwrap();
        (cluster, pool)
    }

    #[tokio::test]
    async fn never_liked_reads_zero() {
        let (_cluster, pool) = setup().await;
        let likes = LikesRepo::new(&pool);
        let count = likes
            .get_likes(&RequestContext::background(), new_time_uuid())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn init_twice_stays_zero() {
        let (cluster, pool) = setup().await;
        let likes = LikesRepo::new(&pool);
        let ctx = RequestContext::background();
        let id = new_time_uuid();

        likes.create_likes_entry(&ctx, id).await.unwrap();
        likes.create_likes_entry(&ctx, id).await.unwrap();
        assert_eq!(likes.get_likes(&ctx, id).await.unwrap(), 0);
        assert_eq!(cluster.rows("main", "q_and_a_likes").len(), 1);
    }

    // Known property: there is no floor on the counter.
    #[tokio::test]
    async fn double_unlike_goes_negative() {
        let (_cluster, pool) = setup().await;
        let likes = LikesRepo::new(&pool);
        let ctx = RequestContext::background();
        let id = new_time_uuid();

        likes.unlike(&ctx, id).await.unwrap();
        likes.unlike(&ctx, id).await.unwrap();
        assert_eq!(likes.get_likes(&ctx, id).await.unwrap(), -2);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (cluster, pool) = setup().await;
        let likes = LikesRepo::new(&pool);
        let ctx = RequestContext::background();
        let id = new_time_uuid();

        likes.like(&ctx, id).await.unwrap();
        likes.delete_likes_entry(&ctx, id).await.unwrap();
        assert!(cluster.rows("main", "q_and_a_likes").is_empty());
        assert_eq!(likes.get_likes(&ctx, id).await.unwrap(), 0);
    }
}
