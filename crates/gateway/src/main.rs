use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ag_domain::config::{Config, ConfigSeverity};
use ag_gateway::api;
use ag_gateway::runtime::events::EventBroadcaster;
use ag_gateway::runtime::manager::AgentManager;
use ag_gateway::runtime::orchestrator::Orchestrator;
use ag_gateway::runtime::scheduler::BackgroundScheduler;
use ag_gateway::runtime::tickets::SseTicketManager;
use ag_gateway::state::AppState;
use ag_runtime::process::ProcessRuntimeFactory;
use ag_store::{Cache, Store, WriteQueue};

#[derive(Parser)]
#[command(name = "agora", about = "Multi-agent conversation backend")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "agora.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Config utilities.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config { command }) => {
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            match command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        println!("{issue}");
                    }
                    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                        std::process::exit(1);
                    }
                    println!("config OK");
                }
                ConfigCommand::Show => {
                    println!("{}", toml::to_string_pretty(&config)?);
                }
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("agora {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ag_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Agora starting");

    // ── Config validation ────────────────────────────────────────────
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

    // ── Store + write queue ──────────────────────────────────────────
    let store = Store::open(&config.database.path).context("opening store")?;
    let write_queue = Arc::new(WriteQueue::new(store.clone()));
    // The queue MUST be up before any write path is reachable.
    write_queue.start();
    tracing::info!("write queue ready");

    // ── Cache ────────────────────────────────────────────────────────
    let cache = Arc::new(Cache::new());
    tracing::info!("cache ready");

    // ── Streaming fabric ─────────────────────────────────────────────
    let broadcaster = Arc::new(EventBroadcaster::default());
    let tickets = Arc::new(SseTicketManager::new());
    tracing::info!("broadcaster + SSE tickets ready");

    // ── Runtime factory + agent manager ──────────────────────────────
    let factory = Arc::new(ProcessRuntimeFactory::new(
        config.runtime.command.clone(),
        config.runtime.args.clone(),
    ));
    let manager = Arc::new(AgentManager::new(factory));
    tracing::info!(
        command = %config.runtime.command,
        model = %config.runtime.model,
        "agent manager ready"
    );

    // ── Orchestrator ─────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        write_queue.clone(),
        cache.clone(),
        broadcaster.clone(),
        manager.clone(),
        config.clone(),
    ));
    tracing::info!(
        max_follow_up_rounds = config.orchestrator.max_follow_up_rounds,
        max_total_messages = config.orchestrator.max_total_messages,
        "orchestrator ready"
    );

    // ── Background scheduler ─────────────────────────────────────────
    let scheduler = Arc::new(BackgroundScheduler::new(
        store.clone(),
        cache.clone(),
        manager.clone(),
        orchestrator.clone(),
        config.scheduler.clone(),
    ));
    let scheduler_handle = scheduler.start();

    // ── Token signer ─────────────────────────────────────────────────
    let token_signer = Arc::new(api::auth::TokenSigner::from_config(&config.auth));
    tracing::info!("token signer ready");

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        store,
        write_queue: write_queue.clone(),
        cache,
        broadcaster: broadcaster.clone(),
        tickets,
        manager: manager.clone(),
        orchestrator: orchestrator.clone(),
        token_signer,
    };

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.allowed_origins);
    let app = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Agora listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // ── Graceful teardown ────────────────────────────────────────────
    tracing::info!("shutting down");
    scheduler_handle.abort();
    broadcaster.shutdown();
    manager.interrupt_all().await;
    manager.pool.shutdown_all().await;
    write_queue
        .stop(Duration::from_secs(config.database.drain_timeout_secs))
        .await;
    tracing::info!("Agora stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

/// Build a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows all origins (not recommended for production).
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static("x-api-key"),
            ]);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}
