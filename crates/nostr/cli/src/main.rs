use clap::Parser;
use nostr_client::{BusEvent, RelayPool};
use nostr_feed::{AggregatedPost, AppConfig, FeedService, SortPolicy, load_config};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nostr-feed",
    about = "Follow an aggregated, ranked Nostr feed from many relays",
    version
)]
struct Opts {
    /// JSON config file; missing files fall back to defaults
    #[arg(long, default_value = "nostr-feed.json")]
    config: PathBuf,

    /// Relay to connect to (repeatable, replaces configured relays)
    #[arg(long = "relay", value_name = "URL")]
    relays: Vec<String>,

    /// Event kind to show as posts (repeatable)
    #[arg(long = "kind", value_name = "N")]
    kinds: Vec<u16>,

    /// Stored events requested from each relay
    #[arg(long, default_value_t = 100)]
    limit: u64,

    /// chronological or trending
    #[arg(long)]
    sort: Option<SortPolicy>,

    /// Pubkey whose likes are highlighted
    #[arg(long, value_name = "HEX")]
    viewer: Option<String>,

    /// Posts printed per update
    #[arg(long, default_value_t = 10)]
    top: usize,
}

impl Opts {
    fn apply(&self, config: &mut AppConfig) {
        if !self.relays.is_empty() {
            config.client.relays = self.relays.clone();
        }
        if !self.kinds.is_empty() {
            config.feed.post_kinds = self.kinds.clone();
        }
        if let Some(sort) = self.sort {
            config.feed.sort = sort;
        }
        if let Some(viewer) = &self.viewer {
            config.feed.viewer_pubkey = Some(viewer.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing();

    let mut config = load_config(&opts.config)?;
    opts.apply(&mut config);
    config.validate()?;

    let endpoints = config.client.endpoints();
    if endpoints.is_empty() {
        anyhow::bail!("no valid relay configured");
    }

    let pool = RelayPool::new(config.client.clone())?;
    let status_log = tokio::spawn(log_relay_events(pool.subscribe_events()));
    pool.connect(&endpoints);
    let supervisor = pool.spawn_supervisor();
    info!(relays = endpoints.len(), sort = %config.feed.sort, "feed starting");

    let feed = FeedService::start(pool.clone(), config.feed.clone())?;
    feed.subscribe_posts(Some(opts.limit));

    let mut view = feed.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, disconnecting");
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let posts = view.borrow_and_update().clone();
                print!("{}", render(&posts, opts.top));
            }
        }
    }

    feed.stop();
    pool.disconnect();
    supervisor.abort();
    status_log.abort();
    Ok(())
}

async fn log_relay_events(mut rx: tokio::sync::broadcast::Receiver<BusEvent>) {
    loop {
        match rx.recv().await {
            Ok(BusEvent::Status { relay, status }) => info!(%relay, %status, "relay status"),
            Ok(BusEvent::Notice { relay, message }) => warn!(%relay, "notice: {}", message),
            Ok(BusEvent::Closed {
                relay,
                subscription_id,
                message,
            }) => warn!(%relay, %subscription_id, "subscription closed: {}", message),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

fn render(posts: &[AggregatedPost], top: usize) -> String {
    let mut out = format!("\n== {} posts ==\n", posts.len());
    for (rank, post) in posts.iter().take(top).enumerate() {
        let content: String = post
            .event
            .content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .take(80)
            .collect();
        let liked = if post.liked_by_viewer { "*" } else { " " };
        out.push_str(&format!(
            "{:>3}. [{:>4} likes{}] {} @ {}: {}\n",
            rank + 1,
            post.like_count,
            liked,
            post.display_name(),
            post.created_at(),
            content
        ));
    }
    out
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
