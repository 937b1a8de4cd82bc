use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sb_domain::config::{Config, ConfigSeverity};
use sb_gateway::api;
use sb_gateway::cli::{self, Cli, Command, ConfigCommand};
use sb_gateway::runtime::lifecycle::LifecycleController;
use sb_gateway::runtime::log_sink::StoreLogSink;
use sb_gateway::runtime::pool::PoolManager;
use sb_gateway::runtime::registry::SessionRegistry;
use sb_gateway::runtime::spawn::SpawnWorker;
use sb_gateway::runtime::sweeper::{spawn_sweepers, Sweeper};
use sb_gateway::state::AppState;
use sb_gateway::token::TokenIssuer;
use sb_store::StateStore;
use sb_supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config(&cli.config)?;
            if !cli::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config(&cli.config)?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sb_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the orchestrator with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Switchboard starting");

    // ── Config validation (fail fast before accepting traffic) ──────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── State store ──────────────────────────────────────────────────
    let store = sb_store::create_store(&config.store, config.sessions.ttl_secs)
        .await
        .context("connecting to the state store")?;
    store
        .ping()
        .await
        .context("state store ping at boot")?;
    tracing::info!("state store ready");

    // ── Process supervisor (agent output mirrored into the store) ───
    let supervisor = Arc::new(Supervisor::new(Some(Arc::new(StoreLogSink::new(
        store.clone(),
    )))));
    tracing::info!("process supervisor ready");

    // ── Session registry ─────────────────────────────────────────────
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        supervisor.clone(),
        Duration::from_secs(config.agent.terminate_grace_secs),
    ));
    tracing::info!("session registry ready");

    // ── Spawn workers ────────────────────────────────────────────────
    let worker = Arc::new(SpawnWorker::new(
        store.clone(),
        registry.clone(),
        supervisor.clone(),
        config.clone(),
    ));
    let spawn_queue = SpawnWorker::start(worker);
    tracing::info!(
        concurrency = config.agent.spawn_concurrency,
        max_queue = config.agent.max_queue(),
        "spawn workers ready"
    );

    // ── Pool manager ─────────────────────────────────────────────────
    let pool = Arc::new(PoolManager::new(
        store.clone(),
        registry.clone(),
        spawn_queue.clone(),
        config.clone(),
    ));
    tracing::info!(target = config.pool.target_size, "pool manager ready");

    // ── Token issuer (secrets read once at startup) ──────────────────
    let tokens = Arc::new(TokenIssuer::new(
        config.media.api_key().context("media API key")?,
        config.media.api_secret().context("media API secret")?,
        config.media.token_ttl_secs,
    ));
    tracing::info!("token issuer ready");

    // ── Webhook secret (read once at startup) ────────────────────────
    let webhook_secret = config.media.webhook.secret().map(Arc::new);
    if webhook_secret.is_none() {
        tracing::warn!("webhook signature verification DISABLED — development only");
    }

    // ── Lifecycle controller ─────────────────────────────────────────
    let lifecycle = Arc::new(LifecycleController::new(
        store.clone(),
        registry.clone(),
        pool.clone(),
        spawn_queue.clone(),
        tokens.clone(),
        config.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        supervisor,
        registry: registry.clone(),
        pool: pool.clone(),
        spawn_queue,
        lifecycle,
        webhook_secret,
        tokens,
    };

    // ── Sweepers: pool refill, liveness probe, idle cleanup ─────────
    spawn_sweepers(Arc::new(Sweeper::new(
        store,
        registry,
        pool,
        config.clone(),
    )));
    tracing::info!(
        pool_refill_secs = config.sweep.pool_refill_secs,
        liveness_secs = config.sweep.liveness_secs,
        idle_sweep_secs = config.sweep.idle_sweep_secs,
        "sweepers started"
    );

    // ── Concurrency limit (backpressure protection) ─────────────────
    let max_concurrent = std::env::var("SB_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Bind ─────────────────────────────────────────────────────────
    let app = api::router(state)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Switchboard listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    tracing::info!("Switchboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
    } else {
        tracing::info!("shutdown signal received");
    }
}
