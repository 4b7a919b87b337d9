//! Command implementations for the grimalkin CLI

pub mod demo;

pub use demo::run_demo;

use anyhow::{Context, Result};
use grimalkin_core::{Answer, NewUser, RequestContext};
use grimalkin_store::schema::all_tables;
use grimalkin_store::{Connector, QuestionsService};
use serde_json::{json, Value};

use crate::Commands;

/// Run one store command and render its result.
pub async fn dispatch<C: Connector>(
    service: &QuestionsService<C>,
    ctx: &RequestContext,
    command: Commands,
) -> Result<Value> {
    let questions = service.questions();
    let users = service.users();
    let likes = service.likes();

    let value = match command {
        Commands::Provision => {
            let tables: Vec<_> = all_tables().map(|t| t.name).collect();
            json!({ "target": service.pool().target(), "tables": tables })
        }
        Commands::Ask {
            asked,
            question,
            anon,
        } => serde_json::to_value(service.ask(ctx, &asked, &question, anon).await?)?,
        Commands::Pending { user } => {
            serde_json::to_value(questions.unanswered_questions(ctx, &user).await?)?
        }
        Commands::Answer {
            question_id,
            answer,
        } => {
            let asked = ctx.acting_user()?.to_string();
            let qanda = service
                .answer_question(ctx, question_id, Answer::new(asked, answer))
                .await?;
            serde_json::to_value(qanda)?
        }
        Commands::Answers { user } => {
            serde_json::to_value(questions.answered_questions(ctx, &user).await?)?
        }
        Commands::Feed { user, limit } => {
            serde_json::to_value(questions.home_feed(ctx, &user, limit).await?)?
        }
        Commands::UpdateAnswer {
            question_id,
            answer,
        } => {
            let asked = ctx.acting_user()?;
            let mut qanda = questions
                .find_answer(ctx, asked, question_id)
                .await
                .context("Cannot update an answer that does not exist")?;
            qanda.answer = answer;
            serde_json::to_value(service.update_answer(ctx, &qanda).await?)?
        }
        Commands::DeleteAnswer { question_id } => {
            service.delete_q_and_a(ctx, question_id).await?;
            json!({ "deleted": question_id })
        }
        Commands::Reconcile { question_id } => {
            let asked = ctx.acting_user()?;
            let feeds = service.reconcile_home_feeds(ctx, asked, question_id).await?;
            json!({ "question_id": question_id, "feeds_written": feeds })
        }
        Commands::Like { question_id } => {
            likes.like(ctx, question_id).await?;
            json!({ "question_id": question_id, "likes": likes.get_likes(ctx, question_id).await? })
        }
        Commands::Unlike { question_id } => {
            likes.unlike(ctx, question_id).await?;
            json!({ "question_id": question_id, "likes": likes.get_likes(ctx, question_id).await? })
        }
        Commands::Likes { question_id } => {
            json!({ "question_id": question_id, "likes": likes.get_likes(ctx, question_id).await? })
        }
        Commands::Register {
            username,
            email,
            first_name,
            last_name,
            password,
        } => {
            let user = users
                .register(
                    ctx,
                    NewUser {
                        username,
                        email,
                        first_name,
                        last_name,
                        password,
                    },
                )
                .await?;
            serde_json::to_value(user)?
        }
        Commands::Follow { user } => {
            let follower = ctx.acting_user()?;
            let created = users.follow(ctx, follower, &user).await?;
            json!({ "follower": follower, "followed": user, "changed": created })
        }
        Commands::Unfollow { user } => {
            let follower = ctx.acting_user()?;
            let removed = users.unfollow(ctx, follower, &user).await?;
            json!({ "follower": follower, "followed": user, "changed": removed })
        }
        Commands::Followers { user } => {
            serde_json::to_value(users.find_followers_of_user(ctx, &user).await?)?
        }
        Commands::Counts { user } => serde_json::to_value(users.follow_counts(ctx, &user).await?)?,
        Commands::Search { prefix, limit } => {
            serde_json::to_value(users.search_usernames(ctx, &prefix, limit).await?)?
        }
        Commands::Demo => run_demo().await?,
    };
    Ok(value)
}
