//! In-process TTL cache for status aggregates.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::NotificationSummary;

/// Default TTL for cached status aggregates.
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(3600);

struct CacheEntry {
    summary: NotificationSummary,
    inserted_at: Instant,
}

/// Multi-reader cache of status aggregates, keyed by notification id.
/// Entries expire after the TTL and are invalidated on every status
/// transition performed by this process.
pub struct StatusCache {
    entries: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<NotificationSummary> {
        let entry = self.entries.get(&id)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(&id);
            return None;
        }
        Some(entry.summary.clone())
    }

    pub fn put(&self, summary: NotificationSummary) {
        self.entries.insert(
            summary.id,
            CacheEntry {
                summary,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, id: Uuid) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(STATUS_CACHE_TTL)
    }
}
