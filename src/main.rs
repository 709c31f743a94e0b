use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use identity_store::{config::Config, IdentityStore};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "identity-store starting");

    let config = Config::load()?;
    let store = IdentityStore::open(config.clone())?;
    info!(
        data_dir = %config.storage.data_dir,
        linearizable_aggregates = config.linearizable_aggregates,
        query_cache_enabled = config.query_cache_enabled,
        "Database opened"
    );

    let sweeper = store.start_sweeper();
    info!(
        interval_seconds = config.storage.cleanup_interval_seconds,
        "Expiration sweeper started"
    );

    shutdown_signal().await?;

    info!("Shutting down background tasks");
    sweeper.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => result?,
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    Ok(())
}
