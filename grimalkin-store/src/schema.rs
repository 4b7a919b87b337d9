//! Table definitions and startup provisioning
//!
//! Every table is created with "if not exists" semantics, so provisioning
//! is safe to run on each start. Tables are split into four groups that
//! share no table; each group runs on its own task and connection, and
//! [`provision`] returns only once all of them finished.

use grimalkin_core::RequestContext;
use tracing::info;

use crate::backend::{Column, ColumnKind, Connector, Statement, TableSchema};
use crate::error::{Result, StoreError};
use crate::pool::Pool;

use ColumnKind::{Boolean, Counter, Text, TimeUuid, Timestamp};

/// Pending questions, one partition per asked user.
pub static QUESTIONS_BY_USER: TableSchema = TableSchema {
    name: "questions_by_user",
    columns: &[
        Column::new("asked", Text),
        Column::new("question_id", TimeUuid),
        Column::new("asker", Text),
        Column::new("is_anon", Boolean),
        Column::new("question", Text),
    ],
    partition_key: &["asked"],
    clustering_key: &["question_id"],
};

/// Owner copies of answered questions.
pub static Q_AND_A_USERS: TableSchema = TableSchema {
    name: "q_and_a_users",
    columns: &[
        Column::new("asked", Text),
        Column::new("question_id", TimeUuid),
        Column::new("asker", Text),
        Column::new("is_anon", Boolean),
        Column::new("question", Text),
        Column::new("answer", Text),
        Column::new("answered_on", Timestamp),
    ],
    partition_key: &["asked"],
    clustering_key: &["question_id"],
};

/// Home feeds: one row per (follower, answered question).
pub static Q_AND_A_FOLLOWERS: TableSchema = TableSchema {
    name: "q_and_a_followers",
    columns: &[
        Column::new("follower", Text),
        Column::new("question_id", TimeUuid),
        Column::new("asked", Text),
        Column::new("asker", Text),
        Column::new("is_anon", Boolean),
        Column::new("question", Text),
        Column::new("answer", Text),
        Column::new("answered_on", Timestamp),
    ],
    partition_key: &["follower"],
    clustering_key: &["question_id"],
};

pub static Q_AND_A_LIKES: TableSchema = TableSchema {
    name: "q_and_a_likes",
    columns: &[
        Column::new("question_id", TimeUuid),
        Column::new("likes", Counter),
    ],
    partition_key: &["question_id"],
    clustering_key: &[],
};

pub static USERS: TableSchema = TableSchema {
    name: "users",
    columns: &[
        Column::new("username", Text),
        Column::new("email", Text),
        Column::new("first_name", Text),
        Column::new("last_name", Text),
        Column::new("password", Text),
        Column::new("created_on", TimeUuid),
    ],
    partition_key: &["username"],
    clustering_key: &[],
};

/// Follow edges, partitioned by the followed user.
pub static FOLLOWERS_BY_USER: TableSchema = TableSchema {
    name: "followers_by_user",
    columns: &[
        Column::new("followed", Text),
        Column::new("follower", Text),
    ],
    partition_key: &["followed"],
    clustering_key: &["follower"],
};

pub static FOLLOWERS_OF_USER_COUNTER: TableSchema = TableSchema {
    name: "followers_of_user_counter",
    columns: &[
        Column::new("username", Text),
        Column::new("followers", Counter),
    ],
    partition_key: &["username"],
    clustering_key: &[],
};

pub static FOLLOWED_BY_USER_COUNTER: TableSchema = TableSchema {
    name: "followed_by_user_counter",
    columns: &[
        Column::new("username", Text),
        Column::new("following", Counter),
    ],
    partition_key: &["username"],
    clustering_key: &[],
};

/// A set of tables created sequentially on one connection.
#[derive(Debug, Clone, Copy)]
pub struct TableGroup {
    pub name: &'static str,
    pub tables: &'static [&'static TableSchema],
}

pub static TABLE_GROUPS: [TableGroup; 4] = [
    TableGroup {
        name: "questions",
        tables: &[&QUESTIONS_BY_USER, &Q_AND_A_USERS],
    },
    TableGroup {
        name: "feeds and likes",
        tables: &[&Q_AND_A_FOLLOWERS, &Q_AND_A_LIKES],
    },
    TableGroup {
        name: "users",
        tables: &[&USERS, &FOLLOWERS_BY_USER],
    },
    TableGroup {
        name: "follow counters",
        tables: &[&FOLLOWERS_OF_USER_COUNTER, &FOLLOWED_BY_USER_COUNTER],
    },
];

/// Create the keyspace and every table, if absent.
///
/// Any failure is reported with the group it happened in; callers treat it
/// as fatal to startup.
pub async fn provision<C: Connector>(pool: &Pool<C>) -> Result<()> {
    let ctx = RequestContext::background();
    {
        let mut conn = pool.acquire(&ctx).await.map_err(|e| in_group("keyspace", e))?;
        conn.execute(&ctx, "creating keyspace", Statement::CreateKeyspace)
            .await
            .map_err(|e| in_group("keyspace", e))?;
    }

    let tasks: Vec<_> = TABLE_GROUPS
        .iter()
        .map(|group| {
            let pool = pool.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { create_group(&pool, &ctx, group).await })
        })
        .collect();

    // Join every task before reporting so no DDL is still in flight.
    let mut first_failure = None;
    for (group, outcome) in TABLE_GROUPS.iter().zip(futures::future::join_all(tasks).await) {
        let result = match outcome {
            Ok(result) => result,
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(join) => Err(in_group(
                group.name,
                StoreError::Cancelled {
                    context: format!("creating tables ({join})"),
                },
            )),
        };
        if let Err(err) = result {
            first_failure.get_or_insert(err);
        }
    }
    if let Some(err) = first_failure {
        return Err(err);
    }

    info!(groups = TABLE_GROUPS.len(), endpoint = %pool.target(), "Schema provisioned");
    Ok(())
}

async fn create_group<C: Connector>(
    pool: &Pool<C>,
    ctx: &RequestContext,
    group: &'static TableGroup,
) -> Result<()> {
    let mut conn = pool.acquire(ctx).await.map_err(|e| in_group(group.name, e))?;
    for &table in group.tables {
        conn.execute(ctx, table.name, Statement::CreateTable(table))
            .await
            .map_err(|e| in_group(group.name, e))?;
    }
    info!(group = group.name, tables = group.tables.len(), "Created table group");
    Ok(())
}

fn in_group(table_group: &'static str, source: StoreError) -> StoreError {
    StoreError::SchemaProvisioning {
        table_group,
        source: Box::new(source),
    }
}

pub fn all_tables() -> impl Iterator<Item = &'static TableSchema> {
    TABLE_GROUPS.iter().flat_map(|g| g.tables.iter().copied())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::backend::memory::MemoryCluster;

    #[test]
    fn groups_cover_every_table_once() {
        let names: Vec<&str> = all_tables().map(|t| t.name).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), 8);
        assert_eq!(unique.len(), 8);
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let cluster = MemoryCluster::new();
        let pool = Pool::new(cluster.connector("main", "t"), 8);
        provision(&pool).await.unwrap();
        provision(&pool).await.unwrap();
        for table in all_tables() {
            assert!(cluster.has_table("main", table.name), "{} missing", table.name);
        }
    }

    #[tokio::test]
    async fn groups_run_on_their_own_connections() {
        let cluster = MemoryCluster::new();
        cluster.set_latency(Some(std::time::Duration::from_millis(10)));
        let pool = Pool::new(cluster.connector("main", "t"), 8);
        provision(&pool).await.unwrap();
        // the keyspace connection is reused by one group, the other three dial
        assert_eq!(cluster.dials(), 4);
    }

    #[tokio::test]
    async fn dial_failure_names_the_group() {
        let cluster = MemoryCluster::new();
        cluster.refuse_connections(true);
        let pool = Pool::new(cluster.connector("main", "t"), 8);
        let err = provision(&pool).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaProvisioning {
                table_group: "keyspace",
                ..
            }
        ));
        assert!(matches!(err.root(), StoreError::Unavailable { .. }));
    }
}
