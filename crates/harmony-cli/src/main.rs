// SPDX-License-Identifier: GPL-3.0-or-later
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use axum::serve;
use harmony_api::{router, ApiState};
use harmony_application::AppState;
use harmony_config::{load as load_config, AppConfig, HttpConfig};
use harmony_orchestrator::Orchestrator;
use harmony_providers::ProviderHealthMonitor;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path.as_deref())?;

    let pool = init_database(&config).await?;
    let state = AppState::new(config.clone(), pool)?;
    state.on_start();

    // provider health probes feed the /health endpoint
    let monitor = Arc::new(ProviderHealthMonitor::new(
        state.gateway.clone(),
        config.providers.health.clone(),
    ));
    let health_rx = monitor.subscribe();
    let (health_stop_tx, health_stop_rx) = watch::channel(false);
    let monitor_handle = monitor.start(health_stop_rx);

    let orchestrator_handle = Orchestrator::new(state.clone()).start();

    let listener = TcpListener::bind(bind_addr(&config.http)).await?;
    let addr = listener.local_addr()?;
    info!(target: "cli", "listening on {}", addr);

    let api_state = ApiState {
        app: state,
        health: Some(health_rx),
    };
    serve(listener, router(api_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // timer and scheduler stop before in-flight jobs are drained
    orchestrator_handle.shutdown().await;
    let _ = health_stop_tx.send(true);
    let _ = monitor_handle.await;

    Ok(())
}

fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(true).with_thread_names(true).with_level(true);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Connect to SQLite, normalizing the URL and creating parent directories,
/// then run migrations.
async fn init_database(config: &AppConfig) -> Result<SqlitePool> {
    info!(target: "cli", "initializing database");

    let db_url = if config.database.url.starts_with("sqlite://")
        && !config.database.url.starts_with("sqlite://:memory:")
    {
        let db_path = config.database.url.trim_start_matches("sqlite://");
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let path_str = absolute_path.to_string_lossy().replace('\\', "/");

        format!("sqlite://{}?mode=rwc", path_str)
    } else {
        config.database.url.clone()
    };

    info!(target: "cli", db_url = %config.database.url, "connecting to database");
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.pool_max_size)
        .connect(&db_url)
        .await?;

    info!(target: "cli", "running migrations");
    sqlx::migrate!("../../migrations").run(&pool).await?;

    info!(target: "cli", "database initialized");
    Ok(pool)
}

fn bind_addr(http: &HttpConfig) -> SocketAddr {
    let addr = format!("{}:{}", http.host, http.port);
    addr.parse().expect("valid listen address")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("install SIGINT handler");

    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");

    #[cfg(not(unix))]
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
    }

    #[cfg(not(unix))]
    {
        interrupt.await.expect("ctrl_c handler");
    }

    info!(target: "cli", "shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_parsing() {
        let http = HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 5160,
        };
        let addr = bind_addr(&http);
        assert_eq!(addr.port(), 5160);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_bind_addr_ipv6() {
        let http = HttpConfig {
            host: "[::1]".to_string(),
            port: 8080,
        };
        let addr = bind_addr(&http);
        assert_eq!(addr.port(), 8080);
        assert!(addr.is_ipv6());
    }
}
