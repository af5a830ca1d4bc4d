use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use polyglot_press::config::Config;
use polyglot_press::content::{NewPost, PostId, PostStore};
use polyglot_press::queue::{EnqueueRequest, QueueStatus};
use polyglot_press::{init_tracing, serve, AppContext};

#[derive(Parser)]
#[command(name = "polyglot-press")]
#[command(author, version, about = "LLM-backed post translation service", long_about = None)]
struct Cli {
    /// Config file (TOML); defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "polyglot-press.toml")]
    config: PathBuf,

    /// Override the database path from the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the queue worker
    Serve,

    /// Import posts from a JSON file (an array of posts)
    Import {
        file: PathBuf,
    },

    /// Translate one post now and follow its progress
    Translate {
        post_id: PostId,

        /// Target language (repeatable); defaults to the configured list
        #[arg(short, long = "lang")]
        languages: Vec<String>,
    },

    /// Manage the translation queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show the translations of a source post
    Relations {
        post_id: PostId,
    },

    /// Show the translation log
    Logs {
        #[arg(long)]
        post: Option<PostId>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Add a post to the queue
    Add {
        post_id: PostId,

        #[arg(short, long = "lang")]
        languages: Vec<String>,

        /// 1 (lowest) to 9 (highest)
        #[arg(short, long)]
        priority: Option<u8>,

        /// Unix time before which the item is not picked up
        #[arg(long)]
        at: Option<i64>,
    },

    /// List queue items in pick order
    List {
        #[arg(long)]
        status: Option<QueueStatus>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Counts by status
    Stats,

    /// Stop handing out items
    Pause,

    /// Start handing out items again
    Resume,

    /// Requeue a failed item
    Retry {
        id: i64,
    },

    /// Remove finished items (completed and failed unless --status is given)
    Clear {
        #[arg(long)]
        status: Option<QueueStatus>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn languages_or_default(languages: Vec<String>, config: &Config) -> Vec<String> {
    if languages.is_empty() {
        config.translation.target_languages.clone()
    } else {
        languages
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(path) = cli.database {
        config.storage.database_path = path;
    }
    config.validate()?;

    if let Commands::Config { action: ConfigAction::Show } = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let ctx = AppContext::open(config)?;
    match cli.command {
        Commands::Serve => return serve(ctx).await,

        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let posts: Vec<NewPost> = serde_json::from_str(&raw).context("parsing posts")?;
            let mut ids = Vec::with_capacity(posts.len());
            for post in &posts {
                ids.push(ctx.posts.insert_post(post)?);
            }
            info!(count = ids.len(), "posts imported");
            print_json(&ids)?;
        }

        Commands::Translate { post_id, languages } => {
            let languages = languages_or_default(languages, &ctx.config);
            let engine = ctx.claude_engine()?;
            let progress_id = engine.spawn_translation(post_id, &languages)?;
            let mut since = 0;
            let snapshot = loop {
                let Some(snapshot) = ctx.progress.poll(&progress_id, since) else {
                    anyhow::bail!("progress record {progress_id} disappeared");
                };
                for event in &snapshot.events {
                    let status = format!("{:?}", event.status);
                    println!("{:>4} {:<10} {} {}", event.seq, status, event.step, event.message);
                }
                since = snapshot.next;
                if snapshot.finished {
                    break snapshot;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            };
            print_json(&engine.relationships().translations_of(post_id)?)?;
            println!("progress {progress_id}: {:?}", snapshot.status);
        }

        Commands::Queue { action } => match action {
            QueueAction::Add {
                post_id,
                languages,
                priority,
                at,
            } => {
                if ctx.posts.get_post(post_id)?.is_none() {
                    anyhow::bail!("post {post_id} not found");
                }
                let target_languages: BTreeSet<String> =
                    languages_or_default(languages, &ctx.config)
                        .into_iter()
                        .map(|l| l.trim().to_lowercase())
                        .collect();
                let item = ctx.queue.enqueue(&EnqueueRequest {
                    post_id,
                    target_languages,
                    priority: priority.unwrap_or(ctx.config.queue.default_priority),
                    scheduled_time: at,
                    max_attempts: ctx.config.queue.default_max_attempts,
                })?;
                print_json(&item)?;
            }
            QueueAction::List { status, limit } => print_json(&ctx.queue.list(status, limit)?)?,
            QueueAction::Stats => print_json(&ctx.queue.stats()?)?,
            QueueAction::Pause => {
                ctx.queue.pause()?;
                print_json(&ctx.queue.stats()?)?;
            }
            QueueAction::Resume => {
                ctx.queue.resume()?;
                print_json(&ctx.queue.stats()?)?;
            }
            QueueAction::Retry { id } => print_json(&ctx.queue.retry(id)?)?,
            QueueAction::Clear { status } => {
                let removed = ctx.queue.clear(status)?;
                println!("removed {removed}");
            }
        },

        Commands::Relations { post_id } => {
            print_json(&ctx.relationships.translations_of(post_id)?)?;
        }

        Commands::Logs { post, limit } => {
            let entries = match post {
                Some(post_id) => ctx.log.for_post(post_id, limit)?,
                None => ctx.log.recent(limit)?,
            };
            print_json(&entries)?;
        }

        // handled before the stores were opened
        Commands::Config { .. } => {}
    }

    if !ctx.log.flush().await {
        warn!("translation log could not be flushed");
    }
    Ok(())
}
