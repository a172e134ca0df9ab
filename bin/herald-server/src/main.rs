//! Herald ingress server.
//!
//! Accepts notification submissions, serves status queries, and exposes
//! health probes and Prometheus metrics. In dev mode the whole pipeline runs
//! embedded in this process: in-memory store and coordination, SQLite-backed
//! queues, and in-process dispatch worker pools.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;
use tracing::{info, warn};

use herald_common::Channel;
use herald_config::{AppConfig, ConfigLoader};
use herald_coord::{
    BreakerSettings, InMemoryCoordination, RateLimitSettings, RedisCoordination,
};
use herald_dispatch::{
    spawn_health_monitor, Dispatcher, DispatcherDeps, RetryScheduler, VendorHealthMonitor,
    VendorSelector, VendorSuccessTracker,
};
use herald_ingress::{router, ApiState, SubmissionService};
use herald_queue::sqlite::SqliteQueue;
use herald_queue::sqs::SqsQueue;
use herald_queue::{EmbeddedQueue, QueuePublisher};
use herald_store::{InMemoryStore, PgStore};
use herald_template::{TemplateCacheSettings, TemplateService};
use herald_vendor::{build_registry, CredentialResolver};

use herald_dispatch::settings::{
    breaker_settings, dispatch_settings, rate_limit_settings, retry_policy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_common::logging::init_logging("herald-server");

    let config = ConfigLoader::new().load().context("configuration")?;
    info!(
        dev_mode = config.dev_mode,
        queue_backend = %config.queue.backend,
        "Starting Herald ingress server"
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("prometheus recorder")?;

    let state = if config.dev_mode {
        build_dev(&config, prometheus).await?
    } else {
        build_production(&config, prometheus).await?
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Ingress server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install CTRL+C handler");
    }
    info!("Shutdown signal received");
}

/// Production wiring: Postgres store, Redis coordination, SQS queues.
async fn build_production(
    config: &AppConfig,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
) -> anyhow::Result<Arc<ApiState>> {
    let store = Arc::new(
        PgStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("postgres")?,
    );
    store.init_schema().await.context("postgres schema")?;
    info!("Connected to Postgres");

    let coord = Arc::new(
        RedisCoordination::connect(
            &config.redis.url,
            breaker_settings(config),
            rate_limit_settings(config),
        )
        .await
        .context("redis")?,
    );
    info!(url = %config.redis.url, "Connected to Redis");

    if config.queue.backend != "sqs" {
        warn!(
            backend = %config.queue.backend,
            "Production mode uses SQS queues; embedded queues are dev-mode only"
        );
    }
    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs = aws_sdk_sqs::Client::new(&aws);

    let mut publishers: HashMap<Channel, Arc<dyn QueuePublisher>> = HashMap::new();
    for channel in Channel::ALL {
        let name = channel.queue_name();
        let url = format!("{}/{}", config.queue.sqs.queue_url_prefix, name);
        publishers.insert(
            channel,
            Arc::new(SqsQueue::new(
                sqs.clone(),
                url,
                name,
                config.queue.visibility_timeout_seconds as i32,
            )),
        );
    }

    let templates = Arc::new(TemplateService::new(
        store.clone(),
        TemplateCacheSettings {
            ttl: Duration::from_secs(config.template_cache.ttl_seconds),
            negative_ttl: Duration::from_secs(config.template_cache.negative_ttl_seconds),
        },
    ));

    let submission = SubmissionService::new(store.clone(), templates, coord.clone(), publishers);

    Ok(Arc::new(ApiState {
        submission,
        store,
        limiter: coord,
        rate_limiting: config.feature_flags.rate_limiting,
        prometheus: Some(prometheus),
    }))
}

/// Dev wiring: everything embedded, including the dispatch worker pools.
async fn build_dev(
    config: &AppConfig,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
) -> anyhow::Result<Arc<ApiState>> {
    warn!("Dev mode: embedded store, coordination, queues, and workers");

    let store = Arc::new(InMemoryStore::new());
    let coord = Arc::new(InMemoryCoordination::new(
        breaker_settings(config),
        rate_limit_settings(config),
    ));

    std::fs::create_dir_all(&config.data_dir)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite://{}/herald-queue.db?mode=rwc", config.data_dir))
        .await
        .context("sqlite queue")?;

    let mut publishers: HashMap<Channel, Arc<dyn QueuePublisher>> = HashMap::new();
    let mut retry_publishers: HashMap<Channel, Arc<dyn QueuePublisher>> = HashMap::new();
    let mut consumers = Vec::new();

    for channel in Channel::ALL {
        let queue = Arc::new(SqliteQueue::new(
            pool.clone(),
            channel.queue_name(),
            config.queue.visibility_timeout_seconds,
        ));
        queue.init_schema().await?;

        let retry_queue = Arc::new(SqliteQueue::new(
            pool.clone(),
            channel.retry_queue_name(),
            config.queue.visibility_timeout_seconds,
        ));
        retry_queue.init_schema().await?;

        publishers.insert(channel, queue.clone() as Arc<dyn QueuePublisher>);
        retry_publishers.insert(channel, retry_queue.clone() as Arc<dyn QueuePublisher>);
        consumers.push((channel, queue, retry_queue));
    }

    let templates = Arc::new(TemplateService::new(
        store.clone(),
        TemplateCacheSettings {
            ttl: Duration::from_secs(config.template_cache.ttl_seconds),
            negative_ttl: Duration::from_secs(config.template_cache.negative_ttl_seconds),
        },
    ));

    // Embedded dispatch workers
    let resolver = CredentialResolver::env_only();
    let registry = Arc::new(
        build_registry(config, &resolver)
            .await
            .map_err(|e| anyhow::anyhow!("vendor registry: {e}"))?,
    );
    if registry.is_empty() {
        warn!("No vendors configured; queued notifications will fail terminal");
    }

    let selector = Arc::new(VendorSelector::new(config, store.clone()));
    let tracker = Arc::new(VendorSuccessTracker::new());
    let retry = Arc::new(RetryScheduler::new(retry_publishers, retry_policy(config)));

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherDeps {
            store: store.clone(),
            templates: templates.clone(),
            registry: registry.clone(),
            selector,
            breaker: coord.clone(),
            limiter: coord.clone(),
            retry,
            tracker: tracker.clone(),
        },
        dispatch_settings(config),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    for (channel, queue, retry_queue) in consumers {
        for consumer in [
            queue as Arc<dyn herald_queue::QueueConsumer>,
            retry_queue as Arc<dyn herald_queue::QueueConsumer>,
        ] {
            let pool = Arc::new(herald_dispatch::WorkerPool::new(
                channel,
                consumer,
                dispatcher.clone(),
                herald_dispatch::worker::WorkerSettings {
                    concurrency: config.worker.concurrency,
                    batch_size: config.queue.max_batch_size,
                    rate_limit_backoff: Duration::from_secs(
                        config.worker.rate_limit_backoff_seconds,
                    ),
                    error_redelivery_delay: Duration::from_secs(5),
                },
                shutdown_tx.clone(),
            ));
            tokio::spawn(pool.run());
        }
    }

    let monitor = VendorHealthMonitor::new(
        registry,
        store.clone(),
        tracker,
        Duration::from_secs(config.worker.health_check_interval_seconds),
    );
    spawn_health_monitor(monitor, shutdown_tx.clone());

    // Keep the shutdown channel alive for the lifetime of the process
    std::mem::forget(shutdown_tx);

    let submission = SubmissionService::new(store.clone(), templates, coord.clone(), publishers);

    Ok(Arc::new(ApiState {
        submission,
        store,
        limiter: coord,
        rate_limiting: config.feature_flags.rate_limiting,
        prometheus: Some(prometheus),
    }))
}
