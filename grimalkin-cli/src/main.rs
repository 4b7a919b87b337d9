//! grimalkin CLI - drive the Q&A store from the command line
//!
//! Every command provisions the schema first, runs against the store named
//! by the configuration, and prints its result as JSON on stdout:
//! - Questions: `ask`, `pending`, `answer`, `answers`, `update-answer`,
//!   `delete-answer`, `reconcile`
//! - Timelines and likes: `feed`, `like`, `unlike`, `likes`
//! - Social graph: `register`, `follow`, `unfollow`, `followers`, `counts`,
//!   `search`
//! - `demo` walks through the core scenarios on a throwaway in-memory store
//!
//! A `memory://` store lives only for the duration of one invocation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grimalkin_core::{RequestContext, RuleValidator, StoreConfig};
use grimalkin_store::{
    memory_pool, postgres_pool, provision, Connector, MemoryCluster, Pool, QuestionsService,
};
use tracing::debug;
use uuid::Uuid;

mod commands;
mod tracing_setup;

use tracing_setup::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "grimalkin",
    author,
    version,
    about = "Ask, answer and follow: the grimalkin Q&A store from the command line"
)]
struct Cli {
    /// TOML file overlaying the GRIMALKIN_* environment
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    debug: bool,

    /// Act as this user
    #[arg(long = "as", global = true, value_name = "USER", env = "GRIMALKIN_AS")]
    acting: Option<String>,

    /// Give up on the request after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Create the keyspace and every table (also done before any command)
    Provision,
    /// Ask a user a question
    Ask {
        /// Who the question is for
        asked: String,
        question: String,
        /// Hide the asker from the recipient
        #[arg(long)]
        anon: bool,
    },
    /// List a user's unanswered questions
    Pending { user: String },
    /// Answer one of your pending questions and publish it to your followers
    Answer { question_id: Uuid, answer: String },
    /// List a user's answered questions, newest first
    Answers { user: String },
    /// Show a user's home feed, newest first
    Feed {
        user: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Change the text of one of your answers everywhere it was published
    UpdateAnswer { question_id: Uuid, answer: String },
    /// Delete one of your answers, its feed copies and its likes
    DeleteAnswer { question_id: Uuid },
    /// Rewrite your followers' copies of an answer from your own copy
    Reconcile { question_id: Uuid },
    /// Like an answer
    Like { question_id: Uuid },
    /// Take back a like
    Unlike { question_id: Uuid },
    /// Show how many likes an answer has
    Likes { question_id: Uuid },
    /// Register a new user
    Register {
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, env = "GRIMALKIN_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Follow a user
    Follow { user: String },
    /// Stop following a user
    Unfollow { user: String },
    /// List who follows a user
    Followers { user: String },
    /// Show follower and following counts
    Counts { user: String },
    /// Find users by username prefix
    Search {
        prefix: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Run the ask, answer and like scenarios on a throwaway memory store
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug }).ok();

    let output = match cli.command {
        Commands::Demo => commands::run_demo().await?,
        command => {
            let config = StoreConfig::load(cli.config.as_deref())
                .context("Failed to load store configuration")?;
            debug!(?config, "Loaded configuration");

            let mut ctx = match cli.acting {
                Some(user) => RequestContext::for_user(user),
                None => RequestContext::background(),
            };
            if let Some(secs) = cli.timeout {
                ctx = ctx.with_timeout(Duration::from_secs(secs));
            }

            match config.scheme().as_str() {
                "memory" => {
                    let cluster = MemoryCluster::new();
                    execute(memory_pool(&cluster, &config), &config, &ctx, command).await?
                }
                "postgres" | "postgresql" => {
                    execute(postgres_pool(&config)?, &config, &ctx, command).await?
                }
                other => bail!("Unsupported store scheme '{other}' (expected memory or postgres)"),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn execute<C: Connector>(
    pool: Pool<C>,
    config: &StoreConfig,
    ctx: &RequestContext,
    command: Commands,
) -> Result<serde_json::Value> {
    provision(&pool)
        .await
        .with_context(|| format!("Schema provisioning failed for {}", pool.target()))?;

    let service = QuestionsService::new(pool, Arc::new(RuleValidator), config.fanout_repair);
    commands::dispatch(&service, ctx, command).await
}
