use anyhow::{Context, Result};
use deadpool_redis::{Config as RedisPoolConfig, Pool};
use owo_colors::OwoColorize;
use redis::AsyncCommands;

use crate::args::RedisArgs;

pub async fn init_redis(args: &RedisArgs) -> Result<Pool> {
    println!(
        "{}{}",
        "🔌 Connecting to Redis • url=".green(),
        args.url_redacted().green().dimmed(),
    );
    let pool = RedisPoolConfig::from_url(args.url())
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to create Redis pool")?;
    pool.get()
        .await
        .context("failed to connect to Redis")?
        .ping::<String>()
        .await
        .context("failed to ping Redis")?;
    Ok(pool)
}
