use std::sync::Arc;

use anyhow::{Context, Result};
use quadlink_auth::Authenticator;
use quadlink_config::AppConfig;
use quadlink_database::{initialize_database, SqliteStore};
use quadlink_realtime::repositories::LogNotifier;
use quadlink_realtime::Hub;
use sqlx::SqlitePool;
use tracing::{info, warn};

pub mod telemetry {
    use anyhow::Result;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .with_target(true)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

#[derive(Clone)]
pub struct BackendServices {
    pub db_pool: SqlitePool,
    pub authenticator: Authenticator,
    pub store: Arc<SqliteStore>,
    pub hub: Hub,
}

impl BackendServices {
    pub async fn initialise(config: &AppConfig) -> Result<Self> {
        let db_pool = initialize_database(&config.database)
            .await
            .context("failed to initialise database")?;

        let authenticator = Authenticator::new(db_pool.clone(), config.auth.clone());
        match authenticator.purge_expired_sessions().await {
            Ok(_) => {}
            Err(error) => warn!(%error, "failed to purge expired sessions"),
        }

        let store = Arc::new(SqliteStore::new(db_pool.clone()));
        let hub = Hub::new(
            config.realtime.clone(),
            store.clone(),
            Arc::new(authenticator.clone()),
            Arc::new(LogNotifier),
        );

        info!(
            presence_grace_ms = config.realtime.presence_grace_ms,
            typing_ttl_ms = config.realtime.typing_ttl_ms,
            ringing_timeout_seconds = config.realtime.ringing_timeout_seconds,
            "realtime hub ready"
        );

        Ok(Self {
            db_pool,
            authenticator,
            store,
            hub,
        })
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(?error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
