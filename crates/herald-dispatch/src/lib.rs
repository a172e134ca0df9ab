//! Herald dispatch pipeline.
//!
//! This crate is the delivery core:
//! - Dispatcher: drives one queued notification through the delivery state
//!   machine (rate gate, render, vendor select, breaker gate, deliver,
//!   record attempt, retry or terminal)
//! - WorkerPool: per-channel long-poll consumers with bounded concurrency
//! - VendorSelector: ordered, health-aware vendor choice with failover
//! - RetryScheduler: exponential backoff with jitter onto the retry queues
//! - VendorHealthMonitor: background health probes feeding the status table
//! - DispatchMetricsCollector: windowed success/latency metrics

pub mod health_monitor;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod selector;
pub mod settings;
pub mod worker;

pub use health_monitor::{spawn_health_monitor, VendorHealthMonitor, VendorSuccessTracker};
pub use metrics::{DispatchMetricsCollector, DispatchMetricsSnapshot};
pub use pipeline::{Dispatcher, DispatcherDeps, DispatchSettings, ProcessOutcome};
pub use retry::{RetryPolicy, RetryScheduler};
pub use selector::VendorSelector;
pub use worker::{WorkerPool, WorkerStats};
