use clap::Parser;
use gateway::backbone::RedisBackbone;
use gateway::config;
use gateway::delivery::{Delivery, DeliveryOptions};
use gateway::registry::{EventRegistry, forward_to_endpoint};
use gateway::router::Router;
use gateway::store::RedisStore;
use gateway::{GatewayState, api_router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateway", about = "Reliable WebSocket pub/sub gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/relaypub/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "gateway starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match RedisStore::connect(&cfg.redis.url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to connect store: {e}");
            std::process::exit(1);
        }
    };
    let backbone = match RedisBackbone::connect(&cfg.redis.url).await {
        Ok(backbone) => Arc::new(backbone),
        Err(e) => {
            eprintln!("FATAL: failed to connect backbone: {e}");
            std::process::exit(1);
        }
    };
    info!(url = %cfg.redis.url, "redis connected");

    let delivery = Arc::new(Delivery::new(
        store,
        DeliveryOptions {
            expire: cfg.delivery.expire,
            resend_interval: cfg.delivery.resend_interval,
        },
    ));

    // Registrations happen before the first subscription can arrive; the
    // registry freezes itself after that.
    let registry = Arc::new(EventRegistry::new());
    for name in &cfg.events {
        if let Err(e) = registry.register(name, None, forward_to_endpoint()) {
            eprintln!("FATAL: cannot register event {name}: {e}");
            std::process::exit(1);
        }
        info!(event = %name, "event registered");
    }

    let router = Router::new(backbone, Arc::clone(&delivery), Arc::clone(&registry));
    let state = GatewayState::new(router, delivery, registry);

    let listener = match tokio::net::TcpListener::bind(&cfg.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.server.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.server.bind, "gateway listening");
    if let Err(e) = axum::serve(listener, api_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
