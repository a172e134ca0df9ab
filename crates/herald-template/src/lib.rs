//! Template service: cache-aside loading, rendering, and versioned updates.
//!
//! Templates are cached in-process with a 1 h TTL and 60 s negative caching
//! for lookups that miss. Updates go through a version compare-and-set in the
//! store and invalidate both the id- and name-keyed cache entries;
//! cross-host coherence is bounded by the TTL.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use herald_common::{
    DispatchError, RenderedPayload, Template, TemplateContent, MAX_TEMPLATE_BYTES,
};
use herald_store::{StoreError, TemplateStore};

pub mod render;

pub use render::{render_content, substitute, validate_content};

#[derive(Debug, Clone)]
pub struct TemplateCacheSettings {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for TemplateCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Id(Uuid),
    Name(String, String),
}

enum CacheEntry {
    Found(Template, Instant),
    NotFound(Instant),
}

pub struct TemplateService {
    store: Arc<dyn TemplateStore>,
    cache: DashMap<CacheKey, CacheEntry>,
    /// Single-flight guards: concurrent misses on a key queue behind one
    /// store load instead of stampeding it.
    load_locks: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    settings: TemplateCacheSettings,
}

impl TemplateService {
    pub fn new(store: Arc<dyn TemplateStore>, settings: TemplateCacheSettings) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            load_locks: DashMap::new(),
            settings,
        }
    }

    fn load_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached(&self, key: &CacheKey) -> Option<Result<Template, DispatchError>> {
        let entry = self.cache.get(key)?;
        match &*entry {
            CacheEntry::Found(template, inserted_at) => {
                if inserted_at.elapsed() < self.settings.ttl {
                    return Some(Ok(template.clone()));
                }
            }
            CacheEntry::NotFound(inserted_at) => {
                if inserted_at.elapsed() < self.settings.negative_ttl {
                    return Some(Err(DispatchError::TemplateNotFound(format!("{key:?}"))));
                }
            }
        }
        drop(entry);
        self.cache.remove(key);
        None
    }

    fn store_hit(&self, key: CacheKey, template: &Template) {
        self.cache
            .insert(key, CacheEntry::Found(template.clone(), Instant::now()));
    }

    fn store_miss(&self, key: CacheKey) {
        self.cache.insert(key, CacheEntry::NotFound(Instant::now()));
    }

    /// Fetch a template by id via cache-aside with single-flight loads.
    pub async fn get(&self, id: Uuid) -> Result<Template, DispatchError> {
        let key = CacheKey::Id(id);
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;
        // A concurrent loader may have filled the cache while we waited
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        match self.store.get(id).await.map_err(map_store_error)? {
            Some(template) => {
                self.store_hit(key, &template);
                Ok(template)
            }
            None => {
                self.store_miss(key);
                Err(DispatchError::TemplateNotFound(id.to_string()))
            }
        }
    }

    /// Latest active version for (tenant, name), cache-aside with
    /// single-flight loads.
    pub async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Template, DispatchError> {
        let key = CacheKey::Name(tenant_id.to_string(), name.to_string());
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;
        if let Some(cached) = self.cached(&key) {
            return cached;
        }

        match self
            .store
            .find_by_name(tenant_id, name)
            .await
            .map_err(map_store_error)?
        {
            Some(template) => {
                self.store_hit(CacheKey::Id(template.id), &template);
                self.store_hit(key, &template);
                Ok(template)
            }
            None => {
                self.store_miss(key);
                Err(DispatchError::TemplateNotFound(name.to_string()))
            }
        }
    }

    /// Render a template with the given context into a channel-shaped
    /// payload. Missing placeholders render empty and are counted.
    pub async fn render(
        &self,
        id: Uuid,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RenderedPayload, DispatchError> {
        let template = self.get(id).await?;
        let (payload, missing) = render_content(&template.content, context)?;

        if missing > 0 {
            debug!(
                template_id = %id,
                template_name = %template.name,
                missing = missing,
                "Render left placeholders unresolved"
            );
            metrics::counter!("herald.template.missing_placeholders").increment(missing as u64);
        }

        Ok(payload)
    }

    /// Create version 1 of a new template.
    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        content: TemplateContent,
        vendor_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Template, DispatchError> {
        validate_content(&content)?;
        check_size(&content)?;

        let template = Template {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            channel: content.channel(),
            version: 1,
            active: true,
            content,
            vendor_metadata,
            created_at: chrono::Utc::now(),
            updated_at: None,
        };

        self.store
            .create(&template)
            .await
            .map_err(map_store_error)?;

        // A fresh name may have a lingering negative entry
        self.cache
            .remove(&CacheKey::Name(tenant_id.to_string(), name.to_string()));

        Ok(template)
    }

    /// Versioned update: compare-and-set on the latest version, then
    /// invalidate the id- and name-keyed cache entries.
    pub async fn update(
        &self,
        tenant_id: &str,
        name: &str,
        expected_version: i32,
        content: TemplateContent,
        vendor_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Template, DispatchError> {
        validate_content(&content)?;
        check_size(&content)?;

        let previous_id = self
            .store
            .find_by_name(tenant_id, name)
            .await
            .map_err(map_store_error)?
            .map(|t| t.id);

        let updated = self
            .store
            .update(tenant_id, name, expected_version, content, vendor_metadata)
            .await
            .map_err(map_store_error)?;

        if let Some(id) = previous_id {
            self.cache.remove(&CacheKey::Id(id));
        }
        self.cache
            .remove(&CacheKey::Name(tenant_id.to_string(), name.to_string()));

        Ok(updated)
    }
}

fn check_size(content: &TemplateContent) -> Result<(), DispatchError> {
    let serialized = serde_json::to_vec(content)
        .map_err(|e| DispatchError::Internal(format!("template serialization: {e}")))?;
    if serialized.len() > MAX_TEMPLATE_BYTES {
        return Err(DispatchError::TemplateInvalid(format!(
            "serialized template exceeds {MAX_TEMPLATE_BYTES} bytes"
        )));
    }
    Ok(())
}

fn map_store_error(e: StoreError) -> DispatchError {
    match e {
        StoreError::VersionConflict { name, expected } => {
            DispatchError::VersionConflict { name, expected }
        }
        StoreError::NotFound(what) => DispatchError::TemplateNotFound(what),
        other => DispatchError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_store::{InMemoryStore, Result as StoreResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps the in-memory store to count reads, for cache behavior tests.
    struct CountingStore {
        inner: InMemoryStore,
        reads: AtomicU32,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                reads: AtomicU32::new(0),
            }
        }

        fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TemplateStore for CountingStore {
        async fn get(&self, id: Uuid) -> StoreResult<Option<Template>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            // Slow enough that concurrent misses overlap
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.inner.get(id).await
        }

        async fn find_by_name(&self, tenant_id: &str, name: &str) -> StoreResult<Option<Template>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_name(tenant_id, name).await
        }

        async fn create(&self, template: &Template) -> StoreResult<()> {
            self.inner.create(template).await
        }

        async fn update(
            &self,
            tenant_id: &str,
            name: &str,
            expected_version: i32,
            content: TemplateContent,
            vendor_metadata: HashMap<String, serde_json::Value>,
        ) -> StoreResult<Template> {
            self.inner
                .update(tenant_id, name, expected_version, content, vendor_metadata)
                .await
        }
    }

    fn email_content(subject: &str) -> TemplateContent {
        TemplateContent::Email {
            subject: subject.to_string(),
            html: "<p>Hello {{name}}</p>".to_string(),
            text: "Hello {{name}}".to_string(),
        }
    }

    fn service() -> (Arc<CountingStore>, TemplateService) {
        let store = Arc::new(CountingStore::new());
        let service = TemplateService::new(store.clone(), TemplateCacheSettings::default());
        (store, service)
    }

    #[tokio::test]
    async fn get_caches_by_id() {
        let (store, service) = service();
        let template = service
            .create("acme", "welcome_email", email_content("Hi {{name}}"), HashMap::new())
            .await
            .unwrap();

        service.get(template.id).await.unwrap();
        service.get(template.id).await.unwrap();
        service.get(template.id).await.unwrap();

        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight_the_store() {
        let store = Arc::new(CountingStore::new());
        let service = Arc::new(TemplateService::new(
            store.clone(),
            TemplateCacheSettings::default(),
        ));
        let template = service
            .create("acme", "welcome_email", email_content("Hi"), HashMap::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let id = template.id;
            handles.push(tokio::spawn(async move { service.get(id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.reads(), 1, "one load must serve all concurrent misses");
    }

    #[tokio::test]
    async fn missing_template_is_negatively_cached() {
        let (store, service) = service();
        let id = Uuid::new_v4();

        for _ in 0..3 {
            let err = service.get(id).await.unwrap_err();
            assert!(matches!(err, DispatchError::TemplateNotFound(_)));
        }

        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn render_substitutes_context() {
        let (_, service) = service();
        let template = service
            .create("acme", "welcome_email", email_content("Welcome {{name}}"), HashMap::new())
            .await
            .unwrap();

        let ctx = json!({"name": "Ada"}).as_object().cloned().unwrap();
        let payload = service.render(template.id, &ctx).await.unwrap();

        match payload {
            RenderedPayload::Email { subject, text, .. } => {
                assert_eq!(subject, "Welcome Ada");
                assert_eq!(text, "Hello Ada");
            }
            _ => panic!("expected email payload"),
        }
    }

    #[tokio::test]
    async fn update_invalidates_name_cache() {
        let (_, service) = service();
        service
            .create("acme", "welcome_email", email_content("v1 subject"), HashMap::new())
            .await
            .unwrap();

        // Prime the cache
        let v1 = service.find_by_name("acme", "welcome_email").await.unwrap();
        assert_eq!(v1.version, 1);

        service
            .update("acme", "welcome_email", 1, email_content("v2 subject"), HashMap::new())
            .await
            .unwrap();

        let v2 = service.find_by_name("acme", "welcome_email").await.unwrap();
        assert_eq!(v2.version, 2);
        match v2.content {
            TemplateContent::Email { subject, .. } => assert_eq!(subject, "v2 subject"),
            _ => panic!("expected email content"),
        }
    }

    #[tokio::test]
    async fn stale_version_update_conflicts() {
        let (_, service) = service();
        service
            .create("acme", "welcome_email", email_content("v1"), HashMap::new())
            .await
            .unwrap();
        service
            .update("acme", "welcome_email", 1, email_content("v2"), HashMap::new())
            .await
            .unwrap();

        let err = service
            .update("acme", "welcome_email", 1, email_content("v2-conflict"), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::VersionConflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn invalid_content_is_rejected_before_store() {
        let (_, service) = service();
        let err = service
            .create(
                "acme",
                "broken",
                TemplateContent::Email {
                    subject: String::new(),
                    html: "<p>hi</p>".to_string(),
                    text: String::new(),
                },
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TemplateInvalid(_)));
    }

    #[tokio::test]
    async fn oversized_template_is_rejected() {
        let (_, service) = service();
        let err = service
            .create(
                "acme",
                "huge",
                TemplateContent::Email {
                    subject: "s".to_string(),
                    html: "x".repeat(MAX_TEMPLATE_BYTES + 1),
                    text: String::new(),
                },
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TemplateInvalid(_)));
    }
}
