use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use marketplace_sync::modules::access::core::access_guard::AccessGuard;
use marketplace_sync::shell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = shell::config::load_from_env()?;
    let composition = shell::compose(&config).await?;
    let workers = composition.spawn_workers(&config);
    reload_keys_on_hangup(composition.state.guard.clone());
    let app = shell::http::router(composition.state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "marketplace catalog listening, GraphQL at /graphql");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    workers.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

/// Re-read the configuration on SIGHUP and trust its signing keys.
#[cfg(unix)]
fn reload_keys_on_hangup(guard: Arc<AccessGuard>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(hangups) => hangups,
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGHUP, signing key reload disabled");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            let reloaded = shell::config::load_from_env().and_then(|config| shell::rotate_keys(&guard, &config.auth));
            if let Err(err) = reloaded {
                tracing::error!(error = %err, "signing key reload failed, keeping the current keys");
            }
        }
    });
}

#[cfg(not(unix))]
fn reload_keys_on_hangup(_guard: Arc<AccessGuard>) {}
