//! Herald dispatch worker.
//!
//! Runs one worker pool per channel (plus one per retry queue), the vendor
//! health monitor, and a small operational HTTP surface (probes, stats,
//! Prometheus metrics). Shutdown is cooperative: pools finish in-flight
//! tasks; unacked messages redeliver after the visibility timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::{info, warn};

use herald_common::Channel;
use herald_config::ConfigLoader;
use herald_coord::RedisCoordination;
use herald_dispatch::{
    spawn_health_monitor, Dispatcher, DispatcherDeps, RetryScheduler, VendorHealthMonitor,
    VendorSelector, VendorSuccessTracker, WorkerPool, WorkerStats,
};
use herald_queue::sqs::SqsQueue;
use herald_queue::{QueueConsumer, QueuePublisher};
use herald_store::PgStore;
use herald_template::{TemplateCacheSettings, TemplateService};
use herald_vendor::{build_registry, CredentialResolver};

use herald_dispatch::settings::{
    breaker_settings, dispatch_settings, rate_limit_settings, retry_policy,
};

struct WorkerState {
    pools: Vec<Arc<WorkerPool>>,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_common::logging::init_logging("herald-worker");

    let config = ConfigLoader::new().load().context("configuration")?;
    if config.dev_mode {
        warn!("Dev mode is handled by herald-server's embedded workers; using production backends");
    }
    info!(
        concurrency = config.worker.concurrency,
        max_e2e_latency_seconds = config.worker.max_e2e_latency_seconds,
        "Starting Herald dispatch worker"
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("prometheus recorder")?;

    // Stores
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
            breaker_settings(&config),
            rate_limit_settings(&config),
        )
        .await
        .context("redis")?,
    );
    info!(url = %config.redis.url, "Connected to Redis");

    // Vendors
    let uses_aws_secrets = config
        .vendors
        .values()
        .any(|v| v.credentials.starts_with("aws-sm://"));
    let resolver = if uses_aws_secrets {
        CredentialResolver::with_aws().await
    } else {
        CredentialResolver::env_only()
    };
    let registry = Arc::new(
        build_registry(&config, &resolver)
            .await
            .map_err(|e| anyhow::anyhow!("vendor registry: {e}"))?,
    );
    info!(vendors = registry.len(), "Vendor registry built");

    // Queues
    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs = aws_sdk_sqs::Client::new(&aws);
    let queue = |name: String| -> Arc<SqsQueue> {
        let url = format!("{}/{}", config.queue.sqs.queue_url_prefix, name);
        Arc::new(
            SqsQueue::new(
                sqs.clone(),
                url,
                name,
                config.queue.visibility_timeout_seconds as i32,
            )
            .with_wait_time_seconds(config.queue.wait_time_seconds as i32),
        )
    };

    let mut retry_publishers: HashMap<Channel, Arc<dyn QueuePublisher>> = HashMap::new();
    let mut consumers: Vec<(Channel, Arc<SqsQueue>)> = Vec::new();
    for channel in Channel::ALL {
        let main_queue = queue(channel.queue_name());
        let retry_queue = queue(channel.retry_queue_name());
        retry_publishers.insert(channel, retry_queue.clone() as Arc<dyn QueuePublisher>);
        consumers.push((channel, main_queue));
        consumers.push((channel, retry_queue));
    }

    // Pipeline
    let templates = Arc::new(TemplateService::new(
        store.clone(),
        TemplateCacheSettings {
            ttl: Duration::from_secs(config.template_cache.ttl_seconds),
            negative_ttl: Duration::from_secs(config.template_cache.negative_ttl_seconds),
        },
    ));
    let selector = Arc::new(VendorSelector::new(&config, store.clone()));
    let tracker = Arc::new(VendorSuccessTracker::new());
    let retry = Arc::new(RetryScheduler::new(retry_publishers, retry_policy(&config)));

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherDeps {
            store: store.clone(),
            templates,
            registry: registry.clone(),
            selector,
            breaker: coord.clone(),
            limiter: coord.clone(),
            retry,
            tracker: tracker.clone(),
        },
        dispatch_settings(&config),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut pools = Vec::new();
    let mut pool_handles = Vec::new();
    for (channel, consumer) in consumers {
        let pool = Arc::new(WorkerPool::new(
            channel,
            consumer as Arc<dyn QueueConsumer>,
            dispatcher.clone(),
            herald_dispatch::worker::WorkerSettings {
                concurrency: config.worker.concurrency,
                batch_size: config.queue.max_batch_size,
                rate_limit_backoff: Duration::from_secs(config.worker.rate_limit_backoff_seconds),
                error_redelivery_delay: Duration::from_secs(5),
            },
            shutdown_tx.clone(),
        ));
        pools.push(pool.clone());
        pool_handles.push(tokio::spawn(pool.run()));
    }

    let monitor = VendorHealthMonitor::new(
        registry,
        store.clone(),
        tracker,
        Duration::from_secs(config.worker.health_check_interval_seconds),
    );
    let monitor_handle = spawn_health_monitor(monitor, shutdown_tx.clone());

    // Operational HTTP surface
    let state = Arc::new(WorkerState {
        pools: pools.clone(),
        prometheus,
    });
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(health_handler))
        .route("/health/ready", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    info!(?addr, "Worker HTTP surface starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = shutdown_tx.clone();
    let server = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service(),
        )
        .with_graceful_shutdown(async move {
            let mut rx = shutdown.subscribe();
            let _ = rx.recv().await;
        })
        .await;
    });

    // Wait for a shutdown signal, then drain
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install CTRL+C handler");
    }
    info!("Shutdown signal received, draining worker pools");
    let _ = shutdown_tx.send(());
    for pool in &pools {
        pool.stop();
    }
    for handle in pool_handles {
        let _ = handle.await;
    }
    let _ = monitor_handle.await;
    let _ = server.await;

    info!("Dispatch worker stopped");
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "UP"}))
}

async fn stats_handler(State(state): State<Arc<WorkerState>>) -> Json<Vec<WorkerStats>> {
    Json(state.pools.iter().map(|p| p.stats()).collect())
}

async fn metrics_handler(State(state): State<Arc<WorkerState>>) -> String {
    state.prometheus.render()
}
