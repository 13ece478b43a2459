mod chain;
mod config;
mod server;

use anyhow::{Context, Result};
use chain::Chain;
use config::parse_args;
use server::Feed;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = parse_args()?;

    let mut chain = Chain::new(config.fork_every);
    chain.advance_to(config.history);
    tracing::info!(
        headers = chain.len(),
        head_slot = chain.head_slot(),
        fork_every = config.fork_every,
        "chain generated"
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!(listen = %config.listen, mode = ?config.mode, "chaingraph-feed listening");

    let feed = Arc::new(Feed::new(chain, config.mode, config.slots_per_chunk));
    server::serve(listener, feed, config.slot).await
}
