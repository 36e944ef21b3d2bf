//! Mirror a remote append-only item feed into a PostgreSQL table.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mirror_common::feed::HttpFeed;
use mirror_common::health::HealthRegistry;
use mirror_common::metrics::{serve, setup_metrics_routes};
use mirror_common::retry::RetryPolicy;
use mirror_common::storage::{PgStorage, Storage};
use mirror_worker::config::Config;
use mirror_worker::discoverer::IdDiscoverer;
use mirror_worker::dispatcher::Dispatcher;
use mirror_worker::error::{DiscoveryError, WorkerError};
use mirror_worker::fetcher::ItemFetcher;
use mirror_worker::signals::wait_for_shutdown_signal;
use mirror_worker::sink::ItemSink;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let storage = PgStorage::new(
        config.table_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await?;
    storage.setup().await?;
    let storage: Arc<dyn Storage> = Arc::new(storage);

    let feed = Arc::new(HttpFeed::new(
        config.feed_url.as_str(),
        config.request_timeout.0,
    )?);

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let liveness = HealthRegistry::new("liveness");
    let discoverer_liveness = liveness.register("discoverer", config.liveness_deadline());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router =
        setup_metrics_routes(router).map_err(|e| WorkerError::Metrics(e.to_string()))?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics on {}: {}", bind, e);
        }
    });

    let discoverer = IdDiscoverer::new(
        feed.clone(),
        config.poll_interval.0,
        retry_policy.clone(),
        discoverer_liveness,
    );
    let dispatcher = Dispatcher::new(
        Arc::new(ItemFetcher::new(feed, retry_policy)),
        Arc::new(ItemSink::new(storage)),
        config.max_concurrent_items,
        config.shutdown_timeout.0,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));

    info!(
        feed_url = config.feed_url.as_str(),
        table = config.table_name.as_str(),
        "mirror worker starting, listening at {}",
        config.bind()
    );

    let discovery = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { discoverer.run(sender, shutdown).await }
    });
    let dispatch = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { dispatcher.run(receiver, shutdown).await }
    });

    let (discovery, dispatch) = futures::future::join(discovery, dispatch).await;
    dispatch.map_err(|_| WorkerError::Task("dispatcher"))?;
    match discovery.map_err(|_| WorkerError::Task("discoverer"))? {
        Ok(()) | Err(DiscoveryError::CancelledBeforeStart) => {}
        Err(e) => return Err(e.into()),
    }

    info!("exiting");
    Ok(())
}

pub async fn index() -> &'static str {
    "feed mirror worker"
}
