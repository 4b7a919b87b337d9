//! Users and social graph store
//!
//! Owns `users`, the `followers_by_user` edge table and the two follow
//! counter tables. Edges are partitioned by the followed user, so "who
//! follows me" is one partition scan.

use futures::future::{join, join3};
use grimalkin_core::models::validation::require_username;
use grimalkin_core::{
    decode, new_time_uuid, NewUser, RequestContext, User, ValidationError, Validator,
};
use serde::Serialize;
use tracing::info;

use super::{run, run_batch, run_conditional};
use crate::backend::{BatchKind, Cell, Connector, Row, Select, Statement, Value};
use crate::error::{Result, StoreError};
use crate::pool::Pool;
use crate::schema::{FOLLOWED_BY_USER_COUNTER, FOLLOWERS_BY_USER, FOLLOWERS_OF_USER_COUNTER, USERS};

/// Follower and following totals for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FollowCounts {
    pub followers: i64,
    pub following: i64,
}

/// Users store
pub struct UserRepo<'a, C: Connector> {
    pool: &'a Pool<C>,
    validator: &'a dyn Validator,
}

impl<'a, C: Connector> UserRepo<'a, C> {
    pub fn new(pool: &'a Pool<C>, validator: &'a dyn Validator) -> Self {
        Self { pool, validator }
    }

    /// Register a user and zero both follow counters.
    ///
    /// Both counters are written first, concurrently, and both are awaited
    /// before the first failure is returned. The user row goes in last and
    /// only if absent, so a failed registration leaves no user behind and
    /// can simply be retried.
    pub async fn register(&self, ctx: &RequestContext, user: NewUser) -> Result<User> {
        self.validator.validate_registration(&user)?;
        if self.does_user_exist(ctx, &user.username).await? {
            return Err(already_registered(user.username));
        }

        let user = User::from_new(new_time_uuid(), user);
        let (followers, following) = join(
            run(
                self.pool,
                ctx,
                "initialising followers counter",
                followers_delta(&user.username, 0),
            ),
            run(
                self.pool,
                ctx,
                "initialising following counter",
                following_delta(&user.username, 0),
            ),
        )
        .await;
        followers.and(following)?;

        let inserted = run_conditional(
            self.pool,
            ctx,
            "inserting user",
            Statement::InsertIfAbsent {
                table: &USERS,
                row: user_row(&user),
            },
        )
        .await?;
        if !inserted {
            return Err(already_registered(user.username));
        }

        info!(username = %user.username, "User registered");
        Ok(user)
    }

    pub async fn does_user_exist(&self, ctx: &RequestContext, username: &str) -> Result<bool> {
        Ok(self.lookup(ctx, username).await?.is_some())
    }

    pub async fn get_user(&self, ctx: &RequestContext, username: &str) -> Result<User> {
        self.lookup(ctx, username)
            .await?
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    /// Check a username and password pair.
    ///
    /// An unknown user and a wrong password give the same error.
    pub async fn login(&self, ctx: &RequestContext, username: &str, password: &str) -> Result<User> {
        match self.lookup(ctx, username).await? {
            Some(user) if user.password == password => Ok(user),
            _ => Err(StoreError::not_found("user", username)),
        }
    }

    /// Replace the mutable fields of a user; `created_on` is kept.
    pub async fn update_login_details(&self, ctx: &RequestContext, user: NewUser) -> Result<User> {
        self.validator.validate_registration(&user)?;
        let existing = self.get_user(ctx, &user.username).await?;
        let updated = User::from_new(existing.created_on, user);

        run(
            self.pool,
            ctx,
            "updating user",
            Statement::Update {
                table: &USERS,
                key: user_key(&updated.username),
                set: vec![
                    ("email", Value::text(updated.email.as_str())),
                    ("first_name", Value::text(updated.first_name.as_str())),
                    ("last_name", Value::text(updated.last_name.as_str())),
                    ("password", Value::text(updated.password.as_str())),
                ],
            },
        )
        .await?;
        Ok(updated)
    }

    /// Remove the user row and both counter rows.
    ///
    /// All three deletes are awaited even when one fails.
    pub async fn delete_user(&self, ctx: &RequestContext, username: &str) -> Result<()> {
        require_username("username", username)?;
        let (user, followers, following) = join3(
            run(
                self.pool,
                ctx,
                "deleting user",
                Statement::Delete {
                    table: &USERS,
                    key: user_key(username),
                },
            ),
            run(
                self.pool,
                ctx,
                "deleting followers counter",
                Statement::Delete {
                    table: &FOLLOWERS_OF_USER_COUNTER,
                    key: user_key(username),
                },
            ),
            run(
                self.pool,
                ctx,
                "deleting following counter",
                Statement::Delete {
                    table: &FOLLOWED_BY_USER_COUNTER,
                    key: user_key(username),
                },
            ),
        )
        .await;
        user.and(followers).and(following)?;
        info!(username, "User deleted");
        Ok(())
    }

    /// Usernames of everyone following `username`.
    pub async fn find_followers_of_user(
        &self,
        ctx: &RequestContext,
        username: &str,
    ) -> Result<Vec<String>> {
        require_username("username", username)?;
        let rows = run(
            self.pool,
            ctx,
            "listing followers",
            Statement::Select(Select::partition(
                &FOLLOWERS_BY_USER,
                vec![("followed", Value::text(username))],
            )),
        )
        .await?;
        rows.iter()
            .map(|row| row.text("follower").map_err(StoreError::from))
            .collect()
    }

    /// Make `follower` follow `followed`.
    ///
    /// Returns false when the edge already existed. Counters only move for
    /// the call whose insert created the edge.
    pub async fn follow(&self, ctx: &RequestContext, follower: &str, followed: &str) -> Result<bool> {
        self.check_pair(ctx, follower, followed).await?;
        let created = run_conditional(
            self.pool,
            ctx,
            "inserting follow edge",
            Statement::InsertIfAbsent {
                table: &FOLLOWERS_BY_USER,
                row: Row::new()
                    .with("followed", Value::text(followed))
                    .with("follower", Value::text(follower)),
            },
        )
        .await?;
        if created {
            self.shift_counts(ctx, follower, followed, 1).await?;
            info!(follower, followed, "Followed");
        }
        Ok(created)
    }

    /// Remove the edge; returns false when there was none.
    pub async fn unfollow(
        &self,
        ctx: &RequestContext,
        follower: &str,
        followed: &str,
    ) -> Result<bool> {
        self.check_pair(ctx, follower, followed).await?;
        let removed = run_conditional(
            self.pool,
            ctx,
            "deleting follow edge",
            Statement::DeleteIfExists {
                table: &FOLLOWERS_BY_USER,
                key: edge_key(follower, followed),
            },
        )
        .await?;
        if removed {
            self.shift_counts(ctx, follower, followed, -1).await?;
            info!(follower, followed, "Unfollowed");
        }
        Ok(removed)
    }

    /// Registered users whose name starts with `prefix`, alphabetically.
    pub async fn search_usernames(
        &self,
        ctx: &RequestContext,
        prefix: &str,
        limit: u32,
    ) -> Result<Vec<User>> {
        require_username("prefix", prefix)?;
        let rows = run(
            self.pool,
            ctx,
            "searching usernames",
            Statement::Select(
                Select::partition(&USERS, Vec::new())
                    .starting_with("username", prefix)
                    .limit(Some(limit)),
            ),
        )
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn follow_counts(&self, ctx: &RequestContext, username: &str) -> Result<FollowCounts> {
        require_username("username", username)?;
        let (followers, following) = futures::future::try_join(
            run(
                self.pool,
                ctx,
                "reading followers counter",
                Statement::Select(Select::partition(
                    &FOLLOWERS_OF_USER_COUNTER,
                    user_key(username),
                )),
            ),
            run(
                self.pool,
                ctx,
                "reading following counter",
                Statement::Select(Select::partition(
                    &FOLLOWED_BY_USER_COUNTER,
                    user_key(username),
                )),
            ),
        )
        .await?;

        match (followers.first(), following.first()) {
            (Some(followers), Some(following)) => Ok(FollowCounts {
                followers: followers.counter("followers")?,
                following: following.counter("following")?,
            }),
            _ => Err(StoreError::not_found("follow counters", username)),
        }
    }

    async fn lookup(&self, ctx: &RequestContext, username: &str) -> Result<Option<User>> {
        require_username("username", username)?;
        let rows = run(
            self.pool,
            ctx,
            "reading user",
            Statement::Select(Select::partition(&USERS, user_key(username))),
        )
        .await?;
        rows.first().map(user_from_row).transpose()
    }

    async fn check_pair(&self, ctx: &RequestContext, follower: &str, followed: &str) -> Result<()> {
        require_username("follower", follower)?;
        require_username("followed", followed)?;
        if follower == followed {
            return Err(ValidationError::NotPermitted {
                user: follower.to_string(),
                reason: "cannot follow themselves",
            }
            .into());
        }
        for username in [follower, followed] {
            if !self.does_user_exist(ctx, username).await? {
                return Err(StoreError::not_found("user", username));
            }
        }
        Ok(())
    }

    async fn shift_counts(
        &self,
        ctx: &RequestContext,
        follower: &str,
        followed: &str,
        delta: i64,
    ) -> Result<()> {
        run_batch(
            self.pool,
            ctx,
            "updating follow counters",
            BatchKind::Counter,
            vec![followers_delta(followed, delta), following_delta(follower, delta)],
        )
        .await
    }
}

fn already_registered(username: String) -> StoreError {
    ValidationError::NotPermitted {
        user: username,
        reason: "is already registered",
    }
    .into()
}

fn user_key(username: &str) -> Vec<Cell> {
    vec![("username", Value::text(username))]
}

fn edge_key(follower: &str, followed: &str) -> Vec<Cell> {
    vec![
        ("followed", Value::text(followed)),
        ("follower", Value::text(follower)),
    ]
}

fn followers_delta(username: &str, delta: i64) -> Statement {
    Statement::CounterAdd {
        table: &FOLLOWERS_OF_USER_COUNTER,
        key: user_key(username),
        column: "followers",
        delta,
    }
}

fn following_delta(username: &str, delta: i64) -> Statement {
    Statement::CounterAdd {
        table: &FOLLOWED_BY_USER_COUNTER,
        key: user_key(username),
        column: "following",
        delta,
    }
}

fn user_row(user: &User) -> Row {
    Row::new()
        .with("username", Value::text(user.username.as_str()))
        .with("email", Value::text(user.email.as_str()))
        .with("first_name", Value::text(user.first_name.as_str()))
        .with("last_name", Value::text(user.last_name.as_str()))
        .with("password", Value::text(user.password.as_str()))
        .with("created_on", Value::uuid(user.created_on))
}

fn user_from_row(row: &Row) -> Result<User> {
    Ok(User {
        username: row.text("username")?,
        email: row.text("email")?,
        first_name: row.text("first_name")?,
        last_name: row.text("last_name")?,
        password: row.text("password")?,
        created_on: decode(row.storage_uuid("created_on")?)?,
    })
}
