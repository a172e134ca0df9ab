//! Background vendor health monitoring.
//!
//! Every interval (30 s) each registered adapter is probed with a 500 ms
//! budget. The probe result is blended with a moving average of live
//! delivery outcomes and written to the vendor-status table the selector
//! reads.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use herald_common::{VendorState, VendorStatus, HEALTHY_SUCCESS_RATE};
use herald_store::{VendorStatusStore, GLOBAL_TENANT};
use herald_vendor::{VendorRegistry, HEALTH_CHECK_BUDGET_MS};

/// Exponential moving average of per-vendor delivery outcomes, fed by the
/// dispatch pipeline. Lock-free reads for the monitor.
pub struct VendorSuccessTracker {
    rates: DashMap<String, f64>,
    alpha: f64,
}

impl VendorSuccessTracker {
    pub fn new() -> Self {
        Self::with_alpha(0.1)
    }

    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            rates: DashMap::new(),
            alpha,
        }
    }

    pub fn record(&self, vendor: &str, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        let mut entry = self.rates.entry(vendor.to_string()).or_insert(1.0);
        *entry = (1.0 - self.alpha) * *entry + self.alpha * sample;
    }

    /// Moving-average success rate; vendors with no samples report 1.0.
    pub fn rate(&self, vendor: &str) -> f64 {
        self.rates.get(vendor).map(|r| *r).unwrap_or(1.0)
    }
}

impl Default for VendorSuccessTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VendorHealthMonitor {
    registry: Arc<VendorRegistry>,
    store: Arc<dyn VendorStatusStore>,
    tracker: Arc<VendorSuccessTracker>,
    interval: Duration,
}

impl VendorHealthMonitor {
    pub fn new(
        registry: Arc<VendorRegistry>,
        store: Arc<dyn VendorStatusStore>,
        tracker: Arc<VendorSuccessTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            tracker,
            interval,
        }
    }

    /// Probe every adapter once and persist the snapshots.
    pub async fn tick(&self) {
        for (vendor, adapter) in self.registry.iter() {
            let budget = Duration::from_millis(HEALTH_CHECK_BUDGET_MS);
            let health = match tokio::time::timeout(budget, adapter.health()).await {
                Ok(health) => health,
                Err(_) => {
                    debug!(vendor = %vendor, "Health probe exceeded budget");
                    herald_vendor::VendorHealth::unhealthy(
                        HEALTH_CHECK_BUDGET_MS,
                        "health probe timed out",
                    )
                }
            };

            let success_rate = self.tracker.rate(vendor);
            let state = if !health.healthy {
                VendorState::Unhealthy
            } else if success_rate < HEALTHY_SUCCESS_RATE {
                VendorState::Degraded
            } else {
                VendorState::Healthy
            };

            let status = VendorStatus {
                vendor: vendor.clone(),
                channel: adapter.channel(),
                tenant_id: GLOBAL_TENANT.to_string(),
                state,
                success_rate,
                last_check: Utc::now(),
            };

            metrics::gauge!("herald.vendor.success_rate", "vendor" => vendor.clone())
                .set(success_rate);
            metrics::histogram!("herald.vendor.health_latency_ms", "vendor" => vendor.clone())
                .record(health.latency_ms as f64);

            if state != VendorState::Healthy {
                debug!(
                    vendor = %vendor,
                    state = state.as_str(),
                    success_rate = success_rate,
                    last_error = ?health.last_error,
                    "Vendor not healthy"
                );
            }

            if let Err(e) = self.store.upsert(&status).await {
                warn!(vendor = %vendor, error = %e, "Failed to persist vendor status");
            }
        }
    }
}

/// Spawn the monitor loop; exits on shutdown broadcast.
pub fn spawn_health_monitor(
    monitor: VendorHealthMonitor,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    monitor.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Vendor health monitor shutting down");
                    break;
                }
            }
        }
    })
}
