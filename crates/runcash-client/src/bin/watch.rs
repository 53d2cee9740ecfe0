use clap::Parser;
use runcash_client::EventRouter;
use runcash_core::config::ClientConfig;
use runcash_core::types::WILDCARD_TOPIC;
use runcash_core::RelayEvent;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "runcash-watch", version, about = "Follow live roulette outcomes from a relay")]
struct Args {
    /// Config file (defaults to $RUNCASH_CONFIG, then ~/.runcash/runcash.toml).
    #[arg(long, short)]
    config: Option<String>,

    /// Game to follow; repeat for several. Omit to follow every game.
    #[arg(long = "game", short = 'g')]
    games: Vec<String>,

    #[arg(long)]
    socket_url: Option<String>,

    #[arg(long)]
    stream_url: Option<String>,

    #[arg(long)]
    poll_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runcash_client=info,runcash_watch=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = ClientConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        ClientConfig::default()
    });
    if let Some(url) = args.socket_url {
        cfg.socket_url = url;
    }
    if let Some(url) = args.stream_url {
        cfg.stream_url = url;
    }
    if let Some(url) = args.poll_url {
        cfg.poll_url = url;
    }

    let router = EventRouter::start(&cfg);
    let topics = if args.games.is_empty() {
        vec![WILDCARD_TOPIC.to_string()]
    } else {
        args.games
    };
    for topic in topics {
        info!(topic = %topic, "following");
        router.subscribe(topic, log_event);
    }

    let mut connectivity = router.connectivity();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let live = *connectivity.borrow_and_update();
                info!(connected = live, "connectivity");
            }
        }
    }

    router.stop().await;
    Ok(())
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::Outcome(o) => info!(
            game = %o.game_name,
            value = o.value,
            category = %o.category,
            at = %o.observed_at,
            "outcome"
        ),
        RelayEvent::Strategy(s) => info!(
            game = %s.game_name,
            state = %s.state,
            wins = s.wins,
            losses = s.losses,
            display = %s.display_text,
            "strategy"
        ),
    }
}
