//! In-process LRU cache for session lookups with a per-entry TTL.

use async_trait::async_trait;
use fileflow_core::models::UploadSession;
use fileflow_core::SessionCache;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

struct Entry {
    session: UploadSession,
    expires_at: Instant,
}

pub struct LruSessionCache {
    entries: Mutex<LruCache<Uuid, Entry>>,
}

impl LruSessionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl SessionCache for LruSessionCache {
    async fn get(&self, session_id: Uuid) -> Result<Option<UploadSession>, String> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(&session_id) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.session.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&session_id);
        }
        Ok(None)
    }

    async fn set(&self, session: &UploadSession, ttl: Duration) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        entries.put(
            session.id(),
            Entry {
                session: session.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, session_id: Uuid) -> Result<(), String> {
        self.entries.lock().await.pop(&session_id);
        Ok(())
    }
}
