//! Orchestration of multi-store operations
//!
//! [`QuestionsService`] is the only place that calls more than one store
//! for a single request. Every workflow is strictly sequential and stops at
//! the first failure; nothing already written is rolled back.

use std::fmt;
use std::sync::Arc;

use grimalkin_core::{
    Answer, FanoutRepair, NewQuestion, QAndA, Question, RequestContext, ValidationError, Validator,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::Connector;
use crate::error::{Result, StoreError};
use crate::pool::Pool;
use crate::repos::{LikesRepo, QuestionRepo, UserRepo};

/// Progress of the answer workflow.
///
/// Each variant names the last step that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnswerStage {
    /// Nothing written yet
    Received,
    PendingDeleted,
    OwnerCopyWritten,
    FollowersResolved,
    FannedOut,
    CounterInitialized,
    Done,
}

impl fmt::Display for AnswerStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::PendingDeleted => "pending deleted",
            Self::OwnerCopyWritten => "owner copy written",
            Self::FollowersResolved => "followers resolved",
            Self::FannedOut => "fanned out",
            Self::CounterInitialized => "counter initialised",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Coordinates the questions, users and likes stores.
pub struct QuestionsService<C: Connector> {
    pool: Pool<C>,
    validator: Arc<dyn Validator>,
    repair: FanoutRepair,
}

impl<C: Connector> Clone for QuestionsService<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            validator: Arc::clone(&self.validator),
            repair: self.repair,
        }
    }
}

impl<C: Connector> QuestionsService<C> {
    pub fn new(pool: Pool<C>, validator: Arc<dyn Validator>, repair: FanoutRepair) -> Self {
        Self {
            pool,
            validator,
            repair,
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn questions(&self) -> QuestionRepo<'_, C> {
        QuestionRepo::new(&self.pool, self.validator.as_ref())
    }

    pub fn users(&self) -> UserRepo<'_, C> {
        UserRepo::new(&self.pool, self.validator.as_ref())
    }

    pub fn likes(&self) -> LikesRepo<'_, C> {
        LikesRepo::new(&self.pool)
    }

    /// Ask `asked` a question on behalf of the acting user.
    pub async fn ask(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question: &str,
        is_anon: bool,
    ) -> Result<Question> {
        let asker = ctx.acting_user()?;
        self.questions()
            .ask(
                ctx,
                NewQuestion {
                    asked: asked.to_string(),
                    asker: asker.to_string(),
                    is_anon,
                    question: question.to_string(),
                },
            )
            .await
    }

    /// Answer a pending question and publish it.
    ///
    /// Runs delete pending, write owner copy, resolve followers, fan out,
    /// init likes counter, in that order. The acting user must be the one
    /// the question was addressed to. The likes counter is keyed by the new
    /// answer id.
    ///
    /// # Errors
    ///
    /// Always [`StoreError::AnswerAborted`], naming the last stage that
    /// completed. Earlier stages stay applied.
    pub async fn answer_question(
        &self,
        ctx: &RequestContext,
        question_id: Uuid,
        answer: Answer,
    ) -> Result<QAndA> {
        use AnswerStage::*;

        let acting = ctx
            .acting_user()
            .map_err(StoreError::from)
            .map_err(StoreError::aborted(Received))?;
        if acting != answer.asked {
            return Err(StoreError::aborted(Received)(
                ValidationError::NotPermitted {
                    user: acting.to_string(),
                    reason: "can only answer questions addressed to them",
                }
                .into(),
            ));
        }

        let qanda = self
            .questions()
            .answer_question(ctx, question_id, answer)
            .await?;

        let followers = self
            .users()
            .find_followers_of_user(ctx, &qanda.asked)
            .await
            .map_err(StoreError::aborted(OwnerCopyWritten))?;

        self.fan_out(ctx, &qanda, &followers)
            .await
            .map_err(StoreError::aborted(FollowersResolved))?;

        self.likes()
            .create_likes_entry(ctx, qanda.question_id)
            .await
            .map_err(StoreError::aborted(FannedOut))?;

        info!(
            asked = %qanda.asked,
            question_id = %question_id,
            answer_id = %qanda.question_id,
            followers = followers.len(),
            "Answer published"
        );
        Ok(qanda)
    }

    /// Change the answer text of one of the acting user's answers, in the
    /// owner copy and every follower copy.
    pub async fn update_answer(&self, ctx: &RequestContext, qanda: &QAndA) -> Result<QAndA> {
        require_owner(ctx, &qanda.asked)?;
        let questions = self.questions();

        let stored = questions.update_answer(ctx, qanda).await?;
        let followers = self.users().find_followers_of_user(ctx, &stored.asked).await?;
        questions
            .update_answer_in_followers_homefeed(ctx, &stored, &followers)
            .await
            .map_err(|source| partial_fanout(&stored, &followers, source))?;

        info!(answer_id = %stored.question_id, followers = followers.len(), "Answer updated");
        Ok(stored)
    }

    /// Delete one of the acting user's answers, its follower copies and its
    /// likes counter.
    pub async fn delete_q_and_a(&self, ctx: &RequestContext, question_id: Uuid) -> Result<()> {
        let asked = ctx.acting_user()?;
        let questions = self.questions();

        questions.delete_q_and_a(ctx, asked, question_id).await?;
        let followers = self.users().find_followers_of_user(ctx, asked).await?;
        questions
            .delete_answer_from_followers_homefeed(ctx, question_id, &followers)
            .await?;
        self.likes().delete_likes_entry(ctx, question_id).await?;

        info!(answer_id = %question_id, followers = followers.len(), "Answer deleted");
        Ok(())
    }

    /// Rewrite every follower copy of an answer from its owner copy and the
    /// current follower set. Safe to repeat.
    ///
    /// Returns the number of feeds written.
    pub async fn reconcile_home_feeds(
        &self,
        ctx: &RequestContext,
        asked: &str,
        question_id: Uuid,
    ) -> Result<usize> {
        require_owner(ctx, asked)?;
        self.reconcile(ctx, asked, question_id).await
    }

    async fn reconcile(&self, ctx: &RequestContext, asked: &str, question_id: Uuid) -> Result<usize> {
        let questions = self.questions();
        let qanda = questions.find_answer(ctx, asked, question_id).await?;
        let followers = self.users().find_followers_of_user(ctx, asked).await?;
        questions
            .update_answer_in_followers_homefeed(ctx, &qanda, &followers)
            .await?;
        info!(answer_id = %question_id, followers = followers.len(), "Home feeds reconciled");
        Ok(followers.len())
    }

    /// Post to follower feeds, applying the configured repair policy once.
    async fn fan_out(&self, ctx: &RequestContext, qanda: &QAndA, followers: &[String]) -> Result<()> {
        let Err(source) = self
            .questions()
            .post_answer_to_followers_homefeed(ctx, qanda, followers)
            .await
        else {
            return Ok(());
        };

        let failure = partial_fanout(qanda, followers, source);
        match self.repair {
            FanoutRepair::Report => Err(failure),
            FanoutRepair::Reconcile => {
                warn!(error = %failure, "Fan-out failed, running one reconcile pass");
                match self.reconcile(ctx, &qanda.asked, qanda.question_id).await {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        warn!(error = %err, "Reconcile pass failed");
                        Err(failure)
                    }
                }
            }
        }
    }
}

fn require_owner(ctx: &RequestContext, owner: &str) -> Result<()> {
    let acting = ctx.acting_user()?;
    if acting != owner {
        return Err(ValidationError::NotPermitted {
            user: acting.to_string(),
            reason: "can only change their own answers",
        }
        .into());
    }
    Ok(())
}

fn partial_fanout(qanda: &QAndA, followers: &[String], source: StoreError) -> StoreError {
    StoreError::PartialFanout {
        question_id: qanda.question_id,
        followers: followers.len(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(AnswerStage::Received < AnswerStage::PendingDeleted);
        assert!(AnswerStage::FannedOut < AnswerStage::CounterInitialized);
        assert_eq!(AnswerStage::OwnerCopyWritten.to_string(), "owner copy written");
    }
}
