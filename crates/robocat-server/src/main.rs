mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use robocat_core::api::Forge;
use robocat_core::config::Config;
use robocat_core::engine::Context;
use robocat_core::ingress::EventIngress;
use robocat_core::registry::{ActorRegistry, DEFAULT_IDLE_EVICTION, DEFAULT_PARALLELISM};
use robocat_core::types::{Event, EventKind};
use robocat_forge::{GitlabClient, JiraClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Seconds between reconciliation ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "robocat-server", about = "Merge-request workflow bot")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "robocat.yaml")]
    config: PathBuf,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Maximum MR evaluation cycles running in parallel.
    #[arg(long, short = 'p', default_value_t = DEFAULT_PARALLELISM)]
    parallelism: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "robocat_server={level},robocat_core={level},robocat_forge={level},tower_http=warn",
            level = cli.log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Startup failures below (unreadable config, unreachable forge) exit
    // non-zero via the error return.
    let config = Arc::new(Config::load(&cli.config)?);

    let forge_token = config.repo.resolve_token()?;
    let forge = Arc::new(GitlabClient::from_repo_url(
        &config.repo.url,
        forge_token,
        Duration::from_secs(config.jira.timeout),
    )?);
    let tracker_password = config.jira.resolve_password()?;
    let tracker = Arc::new(JiraClient::new(
        &config.jira.url,
        &config.jira.login,
        tracker_password,
        Duration::from_secs(config.jira.timeout),
        config.jira.retries,
    )?);

    // Boot probe: resolves the bot identity and proves the forge reachable.
    let bot = forge
        .current_user()
        .await
        .context("forge unreachable on boot")?;
    info!("connected to the forge as @{}", bot.username);

    let ctx = Arc::new(Context::new(Arc::clone(&config), forge, tracker, bot.clone())?);
    let shutdown = CancellationToken::new();
    let registry = ActorRegistry::new(Arc::clone(&ctx), cli.parallelism, shutdown.clone());
    let ingress = Arc::new(EventIngress::default());

    // Periodic reconciliation: evict idle actors, rediscover open MRs,
    // nudge live actors (deferred cycles retry here).
    {
        let registry = Arc::clone(&registry);
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await; // immediate first tick
            loop {
                registry.sweep_idle(DEFAULT_IDLE_EVICTION).await;
                match ctx.forge.list_open_mrs().await {
                    Ok(mrs) => {
                        for mr in mrs {
                            registry
                                .route(Event::new(mr, EventKind::TimerTick, serde_json::Value::Null))
                                .await;
                        }
                    }
                    Err(e) => warn!("reconciliation: listing open MRs failed: {e}"),
                }
                registry.tick_all().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
            }
        });
    }

    let state = routes::AppState {
        ingress,
        registry: Arc::clone(&registry),
        bot_handle: bot.username.clone(),
    };
    let app = routes::router(state);
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    tokio::select! {
        result = axum::serve(listener, app) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; letting actors finish their current action");
            shutdown.cancel();
        }
    }

    Ok(())
}
