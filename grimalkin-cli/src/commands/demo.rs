//! Demo command - the ask, answer and like scenarios on a memory store
//!
//! ann asks bob a question, bob answers it with two followers watching,
//! and one follower likes the answer three times and takes one back.

use std::sync::Arc;

use anyhow::{ensure, Result};
use grimalkin_core::{Answer, FanoutRepair, NewUser, RequestContext, RuleValidator, StoreConfig};
use grimalkin_store::{memory_pool, provision, MemoryCluster, MemoryConnector, QuestionsService};
use serde_json::{json, Value};
use tracing::info;

pub async fn run_demo() -> Result<Value> {
    let cluster = MemoryCluster::new();
    let config = StoreConfig::new("memory://demo", "demo");
    let pool = memory_pool(&cluster, &config);
    provision(&pool).await?;
    let service = QuestionsService::new(pool, Arc::new(RuleValidator), FanoutRepair::Report);

    for name in ["ann", "bob", "x", "y"] {
        register(&service, name).await?;
    }
    let users = service.users();
    let background = RequestContext::background();
    users.follow(&background, "x", "bob").await?;
    users.follow(&background, "y", "bob").await?;

    // A: ann asks, bob sees it pending
    let question = service
        .ask(&RequestContext::for_user("ann"), "bob", "hi?", false)
        .await?;
    let bob = RequestContext::for_user("bob");
    let pending = service.questions().unanswered_questions(&bob, "bob").await?;
    ensure!(
        pending.iter().any(|q| q.question_id == question.question_id),
        "asked question is missing from bob's pending list"
    );
    info!(question_id = %question.question_id, "Scenario A complete");

    // B: bob answers, both followers get the answer
    let qanda = service
        .answer_question(&bob, question.question_id, Answer::new("bob", "hey!"))
        .await?;
    let mut feeds = serde_json::Map::new();
    for follower in ["x", "y"] {
        let feed = service.questions().home_feed(&bob, follower, None).await?;
        ensure!(
            feed.iter().any(|item| item.same_payload(&qanda)),
            "answer did not reach {follower}'s feed"
        );
        feeds.insert(follower.to_string(), serde_json::to_value(feed)?);
    }
    info!(answer_id = %qanda.question_id, "Scenario B complete");

    // C: three likes, one unlike
    let likes = service.likes();
    let x = RequestContext::for_user("x");
    for _ in 0..3 {
        likes.like(&x, qanda.question_id).await?;
    }
    likes.unlike(&x, qanda.question_id).await?;
    let count = likes.get_likes(&x, qanda.question_id).await?;
    ensure!(count == 2, "expected 2 likes, found {count}");
    info!(likes = count, "Scenario C complete");

    Ok(json!({
        "asked": question,
        "pending": pending,
        "answered": qanda,
        "feeds": feeds,
        "likes": count,
        "counts": users.follow_counts(&background, "bob").await?,
    }))
}

async fn register(service: &QuestionsService<MemoryConnector>, name: &str) -> Result<()> {
    service
        .users()
        .register(
            &RequestContext::background(),
            NewUser {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                first_name: name.to_string(),
                last_name: "Demo".to_string(),
                password: "demo-password".to_string(),
            },
        )
        .await?;
    Ok(())
}
