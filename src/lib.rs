//! outlierwatch -- per-service anomaly detection over request metrics.
//!
//! Trains an outlier model per service from stored request metrics, scores
//! recent traffic (falling back to z-score statistics where no model exists),
//! correlates alert-worthy anomalies across their trace and publishes them to
//! an AMQP exchange.

pub mod api;
pub mod config;
pub mod detect;
pub mod orchestrator;
pub mod publisher;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat, LoggingConfig};
use crate::detect::model::IsolationForestModel;
use crate::orchestrator::Orchestrator;
use crate::publisher::{AmqpTransport, ResilientPublisher, RetryPolicy};
use crate::storage::{MetricsRepository, Pool, SqliteMetricsRepository, SqliteModelStore};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;
    let installed = match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

/// Everything a pass needs, wired from configuration.
pub struct Components {
    pub pool: Pool,
    pub metrics: SqliteMetricsRepository,
    pub publisher: ResilientPublisher,
    pub orchestrator: Arc<Orchestrator>,
}

/// Open the repository (fatal if unreachable), load saved models and build
/// the orchestrator. The publisher is created disconnected.
pub async fn build(config: &Config) -> Result<Components> {
    info!(path = %config.database.path, "opening metrics repository");
    let pool = storage::open_pool(&config.database.path)?;
    let metrics = SqliteMetricsRepository::new(pool.clone(), config.detection.excluded_services.clone());
    metrics.ping().await.context("metrics repository unreachable")?;

    let store = Arc::new(SqliteModelStore::new(pool.clone()));
    let model = Arc::new(IsolationForestModel::new(
        store,
        config.detection.contamination,
        config.detection.min_samples,
    ));
    let loaded = model.load_saved();
    info!(models = loaded, "loaded saved models");

    let policy = RetryPolicy {
        min_backoff: Duration::from_secs(config.broker.initial_backoff_secs),
        max_backoff: Duration::from_secs(config.broker.max_backoff_secs),
        ..RetryPolicy::default()
    };
    let transport = Arc::new(AmqpTransport::new(&config.broker.url, &config.broker.exchange));
    let publisher = ResilientPublisher::with_send_timeout(
        transport,
        policy,
        config.broker.buffer_capacity,
        Duration::from_secs(config.broker.send_timeout_secs),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(metrics.clone()),
        model,
        publisher.clone(),
        config.detection.clone(),
    ));
    orchestrator.initialize().await;

    Ok(Components {
        pool,
        metrics,
        publisher,
        orchestrator,
    })
}

/// First broker connect. A failure aborts startup when `required`;
/// otherwise reconnecting continues in the background.
pub async fn connect_publisher(publisher: &ResilientPublisher, required: bool) -> Result<()> {
    match publisher.connect().await {
        Ok(()) => Ok(()),
        Err(e) if required => Err::<(), _>(e).context("alert broker unreachable at startup"),
        Err(e) => {
            warn!(error = %e, "alert broker unreachable, buffering alerts until it returns");
            publisher.spawn_reconnect();
            Ok(())
        }
    }
}

/// Start the daemon: initial training, scheduler, and the HTTP API.
pub async fn serve(config: Config) -> Result<()> {
    let components = build(&config).await?;
    connect_publisher(&components.publisher, config.broker.require_on_startup).await?;

    let initial = components.orchestrator.train_all().await;
    info!(success = initial.success, message = %initial.message, "initial training finished");

    let scheduler = scheduler::start(Arc::clone(&components.orchestrator));

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let state = api::state::AppState {
        orchestrator: Arc::clone(&components.orchestrator),
        metrics: components.metrics.clone(),
        environment: config.server.environment.clone(),
    };
    let app = api::router(state);

    info!(%addr, "outlierwatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    info!("shutting down");
    scheduler.shutdown().await;
    components.publisher.shutdown().await;
    drop(components);

    if let Err(e) = served {
        bail!("http server failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
