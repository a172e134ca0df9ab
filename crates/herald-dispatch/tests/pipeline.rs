//! Dispatch pipeline tests over the in-memory store, coordination, and
//! scripted vendor adapters: happy path, failover, breaker trips, rate
//! limiting, render failures, retry exhaustion, and timeouts.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use herald_common::{
    AttemptStatus, Channel, DispatchError, DispatchJob, Notification, NotificationStatus,
    OpKind, Priority, TemplateContent, TEMPLATE_VENDOR,
};
use herald_config::AppConfig;
use herald_coord::{
    BreakerKey, BreakerSettings, BreakerState, CircuitBreaker, InMemoryCoordination,
    RateLimitSettings, RateWindow,
};
use herald_dispatch::{
    Dispatcher, DispatcherDeps, DispatchSettings, ProcessOutcome, RetryPolicy, RetryScheduler,
    VendorSelector, VendorSuccessTracker,
};
use herald_queue::{QueuePublisher, Result as QueueResult};
use herald_store::{InMemoryStore, NotificationStore};
use herald_template::{TemplateCacheSettings, TemplateService};
use herald_vendor::{
    MessageStatus, SendRequest, SendStatus, VendorAdapter, VendorHealth, VendorReceipt,
    VendorRegistry,
};

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Success,
    Unavailable,
    Rejected,
    RateLimited(u64),
    Slow(u64),
}

struct ScriptedAdapter {
    name: &'static str,
    channel: Channel,
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicU32,
}

impl ScriptedAdapter {
    fn new(name: &'static str, channel: Channel, script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            name,
            channel,
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VendorAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt, DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.script.lock().pop_front().unwrap_or(Scripted::Success);

        match step {
            Scripted::Success => Ok(VendorReceipt {
                message_id: format!("{}-m{}", self.name, call),
                status: SendStatus::Sent,
                vendor_response: serde_json::json!({"id": format!("m{call}")}),
                timestamp: Utc::now(),
            }),
            Scripted::Unavailable => Err(DispatchError::VendorUnavailable {
                vendor: self.name.to_string(),
                reason: "HTTP 503".to_string(),
            }),
            Scripted::Rejected => Err(DispatchError::InvalidPayload(format!(
                "{} rejected payload: HTTP 400",
                self.name
            ))),
            Scripted::RateLimited(retry_after) => Err(DispatchError::RateLimitedByVendor {
                vendor: self.name.to_string(),
                retry_after_secs: Some(retry_after),
            }),
            Scripted::Slow(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(VendorReceipt {
                    message_id: format!("{}-slow{}", self.name, call),
                    status: SendStatus::Sent,
                    vendor_response: serde_json::json!({"id": request.notification_id}),
                    timestamp: Utc::now(),
                })
            }
        }
    }

    async fn status(&self, _message_id: &str) -> Result<MessageStatus, DispatchError> {
        Ok(MessageStatus::unknown())
    }

    async fn health(&self) -> VendorHealth {
        VendorHealth::healthy(1, "ok")
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(DispatchJob, u32)>>,
}

impl RecordingPublisher {
    fn published(&self) -> Vec<(DispatchJob, u32)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    fn identifier(&self) -> &str {
        "recording-retry"
    }

    async fn publish(&self, job: DispatchJob) -> QueueResult<String> {
        self.published.lock().push((job, 0));
        Ok("ok".to_string())
    }

    async fn publish_delayed(&self, job: DispatchJob, delay_seconds: u32) -> QueueResult<String> {
        self.published.lock().push((job, delay_seconds));
        Ok("ok".to_string())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    coord: Arc<InMemoryCoordination>,
    dispatcher: Dispatcher,
    retry_publisher: Arc<RecordingPublisher>,
    template_id: Uuid,
}

struct HarnessOptions {
    adapters: Vec<Arc<ScriptedAdapter>>,
    email_vendors: Vec<&'static str>,
    settings: DispatchSettings,
    notification_limit: u64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            email_vendors: vec!["iterable", "sendgrid", "ses"],
            settings: DispatchSettings::default(),
            notification_limit: 1000,
        }
    }
}

async fn harness(options: HarnessOptions) -> Harness {
    let store = Arc::new(InMemoryStore::new());

    let mut windows = HashMap::new();
    windows.insert(
        OpKind::Notification,
        RateWindow {
            limit: options.notification_limit,
            window: Duration::from_secs(60),
            burst_multiplier: 1.5,
        },
    );
    let coord = Arc::new(InMemoryCoordination::new(
        BreakerSettings::default(),
        RateLimitSettings::new(windows),
    ));

    let mut registry = VendorRegistry::new();
    for adapter in &options.adapters {
        registry.register(adapter.clone());
    }

    let mut config = AppConfig::default();
    config.channels.get_mut("email").unwrap().vendors = options
        .email_vendors
        .iter()
        .map(|s| s.to_string())
        .collect();

    let selector = Arc::new(VendorSelector::new(&config, store.clone()));

    let templates = Arc::new(TemplateService::new(
        store.clone(),
        TemplateCacheSettings::default(),
    ));
    let template = templates
        .create(
            "acme",
            "welcome_email",
            TemplateContent::Email {
                subject: "Welcome {{name}}".to_string(),
                html: "<p>Hello {{name}}</p>".to_string(),
                text: "Hello {{name}}".to_string(),
            },
            HashMap::new(),
        )
        .await
        .unwrap();

    let retry_publisher = Arc::new(RecordingPublisher::default());
    let mut retry_publishers: HashMap<Channel, Arc<dyn QueuePublisher>> = HashMap::new();
    retry_publishers.insert(Channel::Email, retry_publisher.clone());
    let retry = Arc::new(RetryScheduler::new(
        retry_publishers,
        RetryPolicy {
            max_attempts: options.settings.max_attempts,
            ..RetryPolicy::default()
        },
    ));

    let deps = DispatcherDeps {
        store: store.clone(),
        templates,
        registry: Arc::new(registry),
        selector,
        breaker: coord.clone(),
        limiter: coord.clone(),
        retry,
        tracker: Arc::new(VendorSuccessTracker::new()),
    };

    Harness {
        store,
        coord,
        dispatcher: Dispatcher::new(deps, options.settings),
        retry_publisher,
        template_id: template.id,
    }
}

fn notification(template_id: Uuid) -> Notification {
    let mut context = serde_json::Map::new();
    context.insert("name".to_string(), serde_json::json!("Ada"));
    Notification {
        id: Uuid::new_v4(),
        tenant_id: "acme".to_string(),
        channel: Channel::Email,
        status: NotificationStatus::Queued,
        priority: Priority::Normal,
        recipient: "a@b.com".to_string(),
        template_id,
        context,
        attempt_count: 0,
        vendor_preference: None,
        batch_id: None,
        metadata: HashMap::new(),
        created_at: Utc::now(),
        queued_at: Some(Utc::now()),
        processing_started_at: None,
        completed_at: None,
    }
}

async fn submit(harness: &Harness) -> (Notification, DispatchJob) {
    let n = notification(harness.template_id);
    harness.store.insert(&n).await.unwrap();
    let job = DispatchJob::new(&n);
    (n, job)
}

/// Re-dispatch a notification the way the retry-queue consumer would.
async fn redispatch(harness: &Harness, id: Uuid) -> DispatchJob {
    let n = harness.store.get(id).await.unwrap().unwrap();
    DispatchJob::new(&n)
}

#[tokio::test]
async fn happy_path_email_delivers_on_primary() {
    let iterable = ScriptedAdapter::new("iterable", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone()],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;
    let outcome = harness.dispatcher.process(&job).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Delivered);

    let stored = harness.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored.completed_at.is_some());

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].vendor, "iterable");
    assert_eq!(attempts[0].status, AttemptStatus::Successful);

    assert_eq!(iterable.calls(), 1);
}

#[tokio::test]
async fn failed_vendor_is_excluded_on_retry_pass() {
    let iterable =
        ScriptedAdapter::new("iterable", Channel::Email, vec![Scripted::Unavailable]);
    let sendgrid = ScriptedAdapter::new("sendgrid", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), sendgrid.clone()],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;

    let outcome = harness.dispatcher.process(&job).await.unwrap();
    match outcome {
        ProcessOutcome::Retried { delay_secs } => assert!(delay_secs <= 2),
        other => panic!("expected retry, got {other:?}"),
    }
    assert_eq!(
        harness.store.get(n.id).await.unwrap().unwrap().status,
        NotificationStatus::Retrying
    );

    // The retry job carries the incremented attempt count
    let published = harness.retry_publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.attempt_count, 1);

    let retry_job = redispatch(&harness, n.id).await;
    let outcome = harness.dispatcher.process(&retry_job).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Delivered);

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].vendor, "iterable");
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[1].vendor, "sendgrid");
    assert_eq!(attempts[1].status, AttemptStatus::Successful);

    assert_eq!(iterable.calls(), 1);
    assert_eq!(sendgrid.calls(), 1);

    let summary = harness.store.get_status(n.id).await.unwrap().unwrap();
    assert_eq!(summary.status, NotificationStatus::Delivered);
    assert_eq!(summary.latest_vendor.as_deref(), Some("sendgrid"));
}

#[tokio::test]
async fn five_failures_trip_breaker_and_traffic_skips_vendor() {
    let iterable = ScriptedAdapter::new(
        "iterable",
        Channel::Email,
        vec![Scripted::Unavailable; 8],
    );
    let sendgrid = ScriptedAdapter::new("sendgrid", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), sendgrid.clone()],
        ..Default::default()
    })
    .await;

    // Five distinct notifications fail on the primary
    for _ in 0..5 {
        let (_, job) = submit(&harness).await;
        let outcome = harness.dispatcher.process(&job).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retried { .. }));
    }
    assert_eq!(iterable.calls(), 5);

    let key = BreakerKey::new("acme", Channel::Email, "iterable");
    let snapshot = harness.coord.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.state, BreakerState::Open);
    assert_eq!(snapshot.failure_count, 5);

    // Subsequent submissions skip the primary entirely
    for _ in 0..3 {
        let (n, job) = submit(&harness).await;
        let outcome = harness.dispatcher.process(&job).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Delivered);

        let attempts = harness.store.get_attempts(n.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].vendor, "sendgrid");
    }
    assert_eq!(iterable.calls(), 5, "open breaker must gate the vendor");
}

#[tokio::test]
async fn rate_limited_tenant_releases_message_untouched() {
    let iterable = ScriptedAdapter::new("iterable", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone()],
        // Burst ceiling = floor(1 * 1.5) = 1
        notification_limit: 1,
        ..Default::default()
    })
    .await;

    let (_, first_job) = submit(&harness).await;
    assert_eq!(
        harness.dispatcher.process(&first_job).await.unwrap(),
        ProcessOutcome::Delivered
    );

    let (n, second_job) = submit(&harness).await;
    let outcome = harness.dispatcher.process(&second_job).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::RateLimited { .. }));

    // The denied notification was not claimed or attempted
    let stored = harness.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Queued);
    assert!(harness.store.get_attempts(n.id).await.unwrap().is_empty());
    assert_eq!(iterable.calls(), 1);
}

#[tokio::test]
async fn missing_template_fails_terminally_with_template_attempt() {
    let iterable = ScriptedAdapter::new("iterable", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone()],
        ..Default::default()
    })
    .await;

    let mut n = notification(Uuid::new_v4()); // unknown template
    n.template_id = Uuid::new_v4();
    harness.store.insert(&n).await.unwrap();
    let job = DispatchJob::new(&n);

    let outcome = harness.dispatcher.process(&job).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::FailedTerminal);

    let stored = harness.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].vendor, TEMPLATE_VENDOR);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);

    assert_eq!(iterable.calls(), 0);
}

#[tokio::test]
async fn retry_exhaustion_walks_vendors_with_backoff() {
    let iterable =
        ScriptedAdapter::new("iterable", Channel::Email, vec![Scripted::Unavailable]);
    let sendgrid =
        ScriptedAdapter::new("sendgrid", Channel::Email, vec![Scripted::Unavailable]);
    let ses = ScriptedAdapter::new("ses", Channel::Email, vec![Scripted::Unavailable]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), sendgrid.clone(), ses.clone()],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;

    // Attempt 1: primary fails, retry in ~1s
    assert!(matches!(
        harness.dispatcher.process(&job).await.unwrap(),
        ProcessOutcome::Retried { .. }
    ));
    // Attempt 2: second vendor fails, retry in ~2s
    let job2 = redispatch(&harness, n.id).await;
    assert!(matches!(
        harness.dispatcher.process(&job2).await.unwrap(),
        ProcessOutcome::Retried { .. }
    ));
    // Attempt 3: last vendor fails, retries exhausted
    let job3 = redispatch(&harness, n.id).await;
    assert_eq!(
        harness.dispatcher.process(&job3).await.unwrap(),
        ProcessOutcome::FailedTerminal
    );

    let stored = harness.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.attempt_count, 3);

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    let vendors: Vec<&str> = attempts.iter().map(|a| a.vendor.as_str()).collect();
    assert_eq!(vendors, vec!["iterable", "sendgrid", "ses"]);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));

    // Exponential backoff with +/-10% jitter: ~1s then ~2s
    let published = harness.retry_publisher.published();
    assert_eq!(published.len(), 2);
    assert!(published[0].1 <= 1, "first delay ~1s, got {}", published[0].1);
    assert!(
        (1..=2).contains(&published[1].1),
        "second delay ~2s, got {}",
        published[1].1
    );

    // The last error is surfaced through the status aggregate
    let summary = harness.store.get_status(n.id).await.unwrap().unwrap();
    assert_eq!(summary.latest_vendor.as_deref(), Some("ses"));
    assert!(summary.last_error.as_deref().unwrap_or("").contains("ses"));
}

#[tokio::test]
async fn vendor_rate_limit_retries_same_vendor_after_hint() {
    let iterable = ScriptedAdapter::new(
        "iterable",
        Channel::Email,
        vec![Scripted::RateLimited(30)],
    );
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone()],
        email_vendors: vec!["iterable", "sendgrid"],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;
    let outcome = harness.dispatcher.process(&job).await.unwrap();
    match outcome {
        ProcessOutcome::Retried { delay_secs } => {
            assert_eq!(delay_secs, 30, "Retry-After hint must win over backoff")
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // 429 does not count against the breaker
    let key = BreakerKey::new("acme", Channel::Email, "iterable");
    assert_eq!(harness.coord.snapshot(&key).await.unwrap().failure_count, 0);

    // The same vendor serves the retry
    let retry_job = redispatch(&harness, n.id).await;
    assert_eq!(
        harness.dispatcher.process(&retry_job).await.unwrap(),
        ProcessOutcome::Delivered
    );
    assert_eq!(iterable.calls(), 2);

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.vendor == "iterable"));
}

#[tokio::test]
async fn slow_vendor_call_is_aborted_at_budget() {
    let iterable =
        ScriptedAdapter::new("iterable", Channel::Email, vec![Scripted::Slow(500)]);
    let sendgrid = ScriptedAdapter::new("sendgrid", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), sendgrid.clone()],
        settings: DispatchSettings {
            default_vendor_timeout: Duration::from_millis(50),
            ..DispatchSettings::default()
        },
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;
    let outcome = harness.dispatcher.process(&job).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Retried { .. }));

    let attempts = harness.store.get_attempts(n.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0]
        .error
        .as_deref()
        .unwrap_or("")
        .contains("Deadline exceeded"));

    // Timeouts count as breaker failures
    let key = BreakerKey::new("acme", Channel::Email, "iterable");
    assert_eq!(harness.coord.snapshot(&key).await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn vendor_payload_rejection_is_terminal_after_one_attempt() {
    let iterable =
        ScriptedAdapter::new("iterable", Channel::Email, vec![Scripted::Rejected]);
    let sendgrid = ScriptedAdapter::new("sendgrid", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), sendgrid.clone()],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;
    assert_eq!(
        harness.dispatcher.process(&job).await.unwrap(),
        ProcessOutcome::FailedTerminal
    );

    let stored = harness.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.attempt_count, 1);

    // Payload rejections never trip the breaker or fail over
    let key = BreakerKey::new("acme", Channel::Email, "iterable");
    assert_eq!(harness.coord.snapshot(&key).await.unwrap().failure_count, 0);
    assert_eq!(sendgrid.calls(), 0);
}

#[tokio::test]
async fn redelivered_terminal_notification_is_dropped() {
    let iterable = ScriptedAdapter::new("iterable", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone()],
        ..Default::default()
    })
    .await;

    let (n, job) = submit(&harness).await;
    assert_eq!(
        harness.dispatcher.process(&job).await.unwrap(),
        ProcessOutcome::Delivered
    );

    // At-least-once queues can redeliver; the second pass must not re-send
    assert_eq!(
        harness.dispatcher.process(&job).await.unwrap(),
        ProcessOutcome::Dropped
    );
    assert_eq!(iterable.calls(), 1);
    assert_eq!(
        harness.store.get(n.id).await.unwrap().unwrap().attempt_count,
        1
    );
}

#[tokio::test]
async fn vendor_preference_is_honored() {
    let iterable = ScriptedAdapter::new("iterable", Channel::Email, vec![]);
    let ses = ScriptedAdapter::new("ses", Channel::Email, vec![]);
    let harness = harness(HarnessOptions {
        adapters: vec![iterable.clone(), ses.clone()],
        ..Default::default()
    })
    .await;

    let mut n = notification(harness.template_id);
    n.vendor_preference = Some("ses".to_string());
    harness.store.insert(&n).await.unwrap();

    let outcome = harness
        .dispatcher
        .process(&DispatchJob::new(&n))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Delivered);
    assert_eq!(ses.calls(), 1);
    assert_eq!(iterable.calls(), 0);
}
