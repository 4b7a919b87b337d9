//! grimalkin-store: the Q&A data-access core.
//!
//! - [`backend`]: typed wide-column statements and the Postgres and
//!   in-memory engines that execute them
//! - [`pool`]: lazily dialed, typed connection pool
//! - [`schema`]: table definitions and idempotent startup provisioning
//! - [`repos`]: the questions, likes and users stores
//! - [`service`]: the answer workflow and other multi-store operations

pub mod backend;
pub mod error;
pub mod pool;
pub mod repos;
pub mod schema;
pub mod service;

pub use backend::memory::{MemoryCluster, MemoryConnector};
pub use backend::postgres::PgConnector;
pub use backend::{BackendError, Connector};
pub use error::{Result, StoreError};
pub use pool::{Pool, PooledConnection};
pub use repos::{FollowCounts, LikesRepo, QuestionRepo, UserRepo};
pub use schema::provision;
pub use service::{AnswerStage, QuestionsService};

use grimalkin_core::StoreConfig;

/// Pool over a Postgres store described by `config`.
///
/// Nothing is dialed until the first checkout.
pub fn postgres_pool(config: &StoreConfig) -> Result<Pool<PgConnector>> {
    let connector = PgConnector::from_config(config).map_err(|source| StoreError::Unavailable {
        target: config.scheme(),
        source,
    })?;
    Ok(Pool::new(connector, config.max_idle))
}

/// Pool over an in-process cluster, using the keyspace and token from
/// `config`.
pub fn memory_pool(cluster: &MemoryCluster, config: &StoreConfig) -> Pool<MemoryConnector> {
    Pool::new(
        cluster.connector(config.keyspace.as_str(), config.bearer_token.as_str()),
        config.max_idle,
    )
}
