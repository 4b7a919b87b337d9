//! Questions store
//!
//! Owns `questions_by_user` (pending), `q_and_a_users` (owner copies) and
//! `q_and_a_followers` (home feeds). Answering moves a question from the
//! pending table to the owner table under a new identifier; copying it
//! into follower feeds is a separate batched call.

use chrono::Utc;
use grimalkin_core::models::validation::require_username;
use grimalkin_core::{
    decode, new_time_uuid, Answer, NewQuestion, QAndA, Question, RequestContext, Validator,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{run, run_batch};
use crate::backend::{BatchKind, Cell, Connector, Row, Select, Statement, Value};
use crate::error::{Result, StoreError};
use crate::pool::Pool;
use crate::schema::{QUESTIONS_BY_USER, Q_AND_A_FOLLOWERS, Q_AND_A_USERS};
use crate::service::AnswerStage;

/// Questions store
pub struct QuestionRepo<'a, C: Connector> {
    pool: &'a Pool<C>,
    validator: &'a dyn Validator,
}

impl<'a, C: Connector> QuestionRepo<'a, C> {
    pub fn new(pool: &'a Pool<C>, validator: &'a dyn Validator) -> Self {
        Self { pool, validator }
    }

    /// Record a new pending question under a fresh time-ordered id.
    pub async fn ask(&self, ctx: &RequestContext, question: NewQuestion) -> Result<Question> {
        self.validator.validate_question(&question)?;
        let question = Question::from_new(new_time_uuid(), question);

        run(
            self.pool,
            ctx,
            "inserting pending question",
            Statement::Insert {
                table: &QUESTIONS_BY_USER,
                row: question_row(&question),
            },
        )
        .await?;

        info!(asked = %question.asked, question_id = %question.question_id, "Question asked");
        Ok(question)
    }

    /// Pending questions addressed to `asked`, oldest first.
    pub async fn unanswered_questions(
        &self,
        ctx: &RequestContext,
        asked: &str,
    ) -> Result<Vec<Question>> {
        require_username("asked", asked)?;
        let rows = run(
            self.pool,
            ctx,
            "listing pending questions",
            Statement::Select(Select::partition(
                &QUESTIONS_BY_USER,
                vec![("asked", Value::text(asked))],
            )),
        )
        .await?;
        rows.iter().map(question_from_row).collect()
    }

    /// One pending question.
    pub async fn find_question(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question_id: Uuid,
    ) -> Result<Question> {
        let rows = run(
            self.pool,
            ctx,
            "reading pending question",
            Statement::Select(Select::partition(
                &QUESTIONS_BY_USER,
                owner_key(asked, question_id),
            )),
        )
        .await?;
        match rows.first() {
            Some(row) => question_from_row(row),
            None => Err(StoreError::not_found("question", question_id)),
        }
    }

    /// Remove a pending question; deleting a missing row succeeds.
    pub async fn delete_question(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question_id: Uuid,
    ) -> Result<()> {
        run(
            self.pool,
            ctx,
            "deleting pending question",
            Statement::Delete {
                table: &QUESTIONS_BY_USER,
                key: owner_key(asked, question_id),
            },
        )
        .await?;
        Ok(())
    }

    /// Write the owner copy of an answered question.
    pub async fn insert_answer(&self, ctx: &RequestContext, qanda: &QAndA) -> Result<()> {
        run(
            self.pool,
            ctx,
            "inserting owner copy",
            Statement::Insert {
                table: &Q_AND_A_USERS,
                row: owner_row(qanda),
            },
        )
        .await?;
        Ok(())
    }

    /// Move a pending question to the answered table.
    ///
    /// The pending row is deleted first; if that fails nothing else is
    /// written. The owner copy gets a new identifier, distinct from
    /// `question_id`. Fan-out is not part of this call.
    ///
    /// # Errors
    ///
    /// [`StoreError::AnswerAborted`] at [`AnswerStage::Received`] when
    /// nothing was written, or at [`AnswerStage::PendingDeleted`] when the
    /// pending row is gone but the owner copy was not written.
    pub async fn answer_question(
        &self,
        ctx: &RequestContext,
        question_id: Uuid,
        answer: Answer,
    ) -> Result<QAndA> {
        use AnswerStage::{PendingDeleted, Received};

        self.validator
            .validate_answer(&answer)
            .map_err(StoreError::from)
            .map_err(StoreError::aborted(Received))?;
        let pending = self
            .find_question(ctx, &answer.asked, question_id)
            .await
            .map_err(StoreError::aborted(Received))?;
        self.delete_question(ctx, &answer.asked, question_id)
            .await
            .map_err(StoreError::aborted(Received))?;

        let qanda = QAndA::answering(pending, answer.answer, new_time_uuid(), Utc::now());
        self.insert_answer(ctx, &qanda)
            .await
            .map_err(StoreError::aborted(PendingDeleted))?;

        info!(
            asked = %qanda.asked,
            question_id = %question_id,
            answer_id = %qanda.question_id,
            "Question answered"
        );
        Ok(qanda)
    }

    /// Answered questions of `asked`, newest first.
    pub async fn answered_questions(&self, ctx: &RequestContext, asked: &str) -> Result<Vec<QAndA>> {
        require_username("asked", asked)?;
        let rows = run(
            self.pool,
            ctx,
            "listing answered questions",
            Statement::Select(
                Select::partition(&Q_AND_A_USERS, vec![("asked", Value::text(asked))])
                    .newest_first(),
            ),
        )
        .await?;
        rows.iter().map(qanda_from_row).collect()
    }

    /// One owner copy.
    pub async fn find_answer(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question_id: Uuid,
    ) -> Result<QAndA> {
        let rows = run(
            self.pool,
            ctx,
            "reading owner copy",
            Statement::Select(Select::partition(
                &Q_AND_A_USERS,
                owner_key(asked, question_id),
            )),
        )
        .await?;
        match rows.first() {
            Some(row) => qanda_from_row(row),
            None => Err(StoreError::not_found("answer", question_id)),
        }
    }

    /// Home feed of `follower`, newest first.
    pub async fn home_feed(
        &self,
        ctx: &RequestContext,
        follower: &str,
        limit: Option<u32>,
    ) -> Result<Vec<QAndA>> {
        require_username("follower", follower)?;
        let rows = run(
            self.pool,
            ctx,
            "reading home feed",
            Statement::Select(
                Select::partition(&Q_AND_A_FOLLOWERS, vec![("follower", Value::text(follower))])
                    .newest_first()
                    .limit(limit),
            ),
        )
        .await?;
        rows.iter().map(qanda_from_row).collect()
    }

    /// Copy an answered question into each follower's feed as one logged
    /// batch. The batch either lands for every follower or reports one
    /// error for all of them.
    pub async fn post_answer_to_followers_homefeed(
        &self,
        ctx: &RequestContext,
        qanda: &QAndA,
        followers: &[String],
    ) -> Result<()> {
        if followers.is_empty() {
            debug!(question_id = %qanda.question_id, "No followers, skipping fan-out");
            return Ok(());
        }
        let statements = followers
            .iter()
            .map(|follower| Statement::Insert {
                table: &Q_AND_A_FOLLOWERS,
                row: feed_row(follower, qanda),
            })
            .collect();

        run_batch(
            self.pool,
            ctx,
            "posting to follower feeds",
            BatchKind::Logged,
            statements,
        )
        .await?;
        info!(question_id = %qanda.question_id, followers = followers.len(), "Answer fanned out");
        Ok(())
    }

    /// Replace the answer text of an owner copy.
    ///
    /// Returns the stored record with the new text.
    pub async fn update_answer(&self, ctx: &RequestContext, qanda: &QAndA) -> Result<QAndA> {
        self.validator
            .validate_answer(&Answer::new(qanda.asked.as_str(), qanda.answer.as_str()))?;
        let mut stored = self.find_answer(ctx, &qanda.asked, qanda.question_id).await?;
        stored.answer = qanda.answer.clone();

        run(
            self.pool,
            ctx,
            "updating owner copy",
            Statement::Update {
                table: &Q_AND_A_USERS,
                key: owner_key(&stored.asked, stored.question_id),
                set: vec![("answer", Value::text(stored.answer.as_str()))],
            },
        )
        .await?;
        Ok(stored)
    }

    /// Rewrite the follower copies of `qanda` as one logged batch.
    ///
    /// Each copy is written in full, so a follower missing the row gets it.
    pub async fn update_answer_in_followers_homefeed(
        &self,
        ctx: &RequestContext,
        qanda: &QAndA,
        followers: &[String],
    ) -> Result<()> {
        if followers.is_empty() {
            return Ok(());
        }
        let statements = followers
            .iter()
            .map(|follower| Statement::Insert {
                table: &Q_AND_A_FOLLOWERS,
                row: feed_row(follower, qanda),
            })
            .collect();
        run_batch(
            self.pool,
            ctx,
            "updating follower feeds",
            BatchKind::Logged,
            statements,
        )
        .await
    }

    /// Delete the owner copy; deleting a missing row succeeds.
    pub async fn delete_q_and_a(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question_id: Uuid,
    ) -> Result<()> {
        require_username("asked", asked)?;
        run(
            self.pool,
            ctx,
            "deleting owner copy",
            Statement::Delete {
                table: &Q_AND_A_USERS,
                key: owner_key(asked, question_id),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn delete_answer_from_followers_homefeed(
        &self,
        ctx: &RequestContext,
        question_id: Uuid,
        followers: &[String],
    ) -> Result<()> {
        if followers.is_empty() {
            return Ok(());
        }
        let statements = followers
            .iter()
            .map(|follower| Statement::Delete {
                table: &Q_AND_A_FOLLOWERS,
                key: vec![
                    ("follower", Value::text(follower.as_str())),
                    ("question_id", Value::uuid(question_id)),
                ],
            })
            .collect();
        run_batch(
            self.pool,
            ctx,
            "deleting from follower feeds",
            BatchKind::Logged,
            statements,
        )
        .await
    }
}

fn owner_key(asked: &str, question_id: Uuid) -> Vec<Cell> {
    vec![
        ("asked", Value::text(asked)),
        ("question_id", Value::uuid(question_id)),
    ]
}

fn question_row(q: &Question) -> Row {
    Row::new()
        .with("asked", Value::text(q.asked.as_str()))
        .with("question_id", Value::uuid(q.question_id))
        .with("asker", Value::text(q.asker.as_str()))
        .with("is_anon", Value::Boolean(q.is_anon))
        .with("question", Value::text(q.question.as_str()))
}

fn owner_row(qanda: &QAndA) -> Row {
    Row::new()
        .with("asked", Value::text(qanda.asked.as_str()))
        .with("question_id", Value::uuid(qanda.question_id))
        .with("asker", Value::text(qanda.asker.as_str()))
        .with("is_anon", Value::Boolean(qanda.is_anon))
        .with("question", Value::text(qanda.question.as_str()))
        .with("answer", Value::text(qanda.answer.as_str()))
        .with("answered_on", Value::Timestamp(qanda.answered_on))
}

fn feed_row(follower: &str, qanda: &QAndA) -> Row {
    owner_row(qanda).with("follower", Value::text(follower))
}

fn question_from_row(row: &Row) -> Result<Question> {
    Ok(Question {
        question_id: decode(row.storage_uuid("question_id")?)?,
        asked: row.text("asked")?,
        asker: row.text("asker")?,
        is_anon: row.boolean("is_anon")?,
        question: row.text("question")?,
    })
}

fn qanda_from_row(row: &Row) -> Result<QAndA> {
    Ok(QAndA {
        question_id: decode(row.storage_uuid("question_id")?)?,
        asked: row.text("asked")?,
        asker: row.text("asker")?,
        is_anon: row.boolean("is_anon")?,
        question: row.text("question")?,
        answer: row.text("answer")?,
        answered_on: row.timestamp("answered_on")?,
    })
}

#[cfg(test)]
mod tests {
    use grimalkin_core::{NewQuestion, RuleValidator, ValidationError};

    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryConnector};
    use crate::schema::provision;

    async fn setup() -> (MemoryCluster, Pool<MemoryConnector>) {
        let cluster = MemoryCluster::new();
        let pool = Pool::new(cluster.connector("main", "t"), 4);
        provision(&pool).await.unwrap();
        (cluster, pool)
    }

    fn stage_of(err: &StoreError) -> AnswerStage {
        match err {
            StoreError::AnswerAborted { completed, .. } => *completed,
            other => panic!("expected AnswerAborted, got {other:?}"),
        }
    }

    fn question(asked: &str, text: &str) -> NewQuestion {
        NewQuestion {
            asked: asked.into(),
            asker: "ann".into(),
            is_anon: false,
            question: text.into(),
        }
    }

    #[tokio::test]
    async fn pending_questions_in_creation_order() {
        let (_cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();

        let first = repo.ask(&ctx, question("bob", "one?")).await.unwrap();
        let second = repo.ask(&ctx, question("bob", "two?")).await.unwrap();
        repo.ask(&ctx, question("cat", "other?")).await.unwrap();

        let pending = repo.unanswered_questions(&ctx, "bob").await.unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|q| q.question_id).collect();
        assert_eq!(ids, vec![first.question_id, second.question_id]);
    }

    #[tokio::test]
    async fn invalid_question_never_reaches_storage() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let err = repo
            .ask(&RequestContext::background(), question("bob", "   "))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::Empty { field: "question" })
        ));
        assert!(cluster.rows("main", "questions_by_user").is_empty());
    }

    #[tokio::test]
    async fn answering_moves_the_question() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();

        let asked = repo.ask(&ctx, question("bob", "hi?")).await.unwrap();
        let qanda = repo
            .answer_question(&ctx, asked.question_id, Answer::new("bob", "hey!"))
            .await
            .unwrap();

        assert_ne!(qanda.question_id, asked.question_id);
        assert_eq!(qanda.question, "hi?");
        assert!(cluster.rows("main", "questions_by_user").is_empty());
        let owner = repo.find_answer(&ctx, "bob", qanda.question_id).await.unwrap();
        assert_eq!(owner, qanda);
    }

    #[tokio::test]
    async fn answering_unknown_question_is_not_found() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let err = repo
            .answer_question(
                &RequestContext::background(),
                new_time_uuid(),
                Answer::new("bob", "hey!"),
            )
            .await
            .unwrap_err();
        assert_eq!(stage_of(&err), AnswerStage::Received);
        assert!(err.root().is_not_found());
        assert!(cluster.rows("main", "q_and_a_users").is_empty());
    }

    #[tokio::test]
    async fn failed_delete_writes_no_owner_copy() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();
        let asked = repo.ask(&ctx, question("bob", "hi?")).await.unwrap();

        cluster.fail_writes_to("questions_by_user");
        let err = repo
            .answer_question(&ctx, asked.question_id, Answer::new("bob", "hey!"))
            .await
            .unwrap_err();
        assert_eq!(stage_of(&err), AnswerStage::Received);
        assert!(matches!(err.root(), StoreError::Storage { .. }));
        assert!(cluster.rows("main", "q_and_a_users").is_empty());
        assert_eq!(cluster.rows("main", "questions_by_user").len(), 1);
    }

    #[tokio::test]
    async fn failed_owner_copy_reports_the_pending_row_gone() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();
        let asked = repo.ask(&ctx, question("bob", "hi?")).await.unwrap();

        cluster.fail_writes_to("q_and_a_users");
        let err = repo
            .answer_question(&ctx, asked.question_id, Answer::new("bob", "hey!"))
            .await
            .unwrap_err();
        assert_eq!(stage_of(&err), AnswerStage::PendingDeleted);
        assert!(cluster.rows("main", "questions_by_user").is_empty());
    }

    #[tokio::test]
    async fn feed_is_newest_first_and_limited() {
        let (_cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();
        let followers = vec!["x".to_string()];

        let mut posted = Vec::new();
        for text in ["a", "b", "c"] {
            let asked = repo.ask(&ctx, question("bob", text)).await.unwrap();
            let qanda = repo
                .answer_question(&ctx, asked.question_id, Answer::new("bob", text))
                .await
                .unwrap();
            repo.post_answer_to_followers_homefeed(&ctx, &qanda, &followers)
                .await
                .unwrap();
            posted.push(qanda.question_id);
        }

        let feed = repo.home_feed(&ctx, "x", Some(2)).await.unwrap();
        let ids: Vec<Uuid> = feed.iter().map(|q| q.question_id).collect();
        assert_eq!(ids, vec![posted[2], posted[1]]);
    }

    #[tokio::test]
    async fn update_and_delete_follow_the_owner_copy() {
        let (cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let ctx = RequestContext::background();
        let followers = vec!["x".to_string(), "y".to_string()];

        let asked = repo.ask(&ctx, question("bob", "hi?")).await.unwrap();
        let mut qanda = repo
            .answer_question(&ctx, asked.question_id, Answer::new("bob", "hey!"))
            .await
            .unwrap();
        repo.post_answer_to_followers_homefeed(&ctx, &qanda, &followers)
            .await
            .unwrap();

        qanda.answer = "hello!".into();
        let stored = repo.update_answer(&ctx, &qanda).await.unwrap();
        repo.update_answer_in_followers_homefeed(&ctx, &stored, &followers)
            .await
            .unwrap();
        for follower in &followers {
            let feed = repo.home_feed(&ctx, follower, None).await.unwrap();
            assert_eq!(feed[0].answer, "hello!");
        }

        repo.delete_q_and_a(&ctx, "bob", qanda.question_id).await.unwrap();
        repo.delete_answer_from_followers_homefeed(&ctx, qanda.question_id, &followers)
            .await
            .unwrap();
        assert!(cluster.rows("main", "q_and_a_users").is_empty());
        assert!(cluster.rows("main", "q_and_a_followers").is_empty());
    }

    #[tokio::test]
    async fn updating_missing_answer_is_not_found() {
        let (_cluster, pool) = setup().await;
        let repo = QuestionRepo::new(&pool, &RuleValidator);
        let qanda = QAndA {
            question_id: new_time_uuid(),
            asked: "bob".into(),
            asker: "ann".into(),
            is_anon: true,
            question: "hi?".into(),
            answer: "hey".into(),
            answered_on: Utc::now(),
        };
        let err = repo
            .update_answer(&RequestContext::background(), &qanda)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
