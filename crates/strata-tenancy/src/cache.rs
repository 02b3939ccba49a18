use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Default)]
struct CacheState {
    active: HashSet<String>,
    refreshed_at: Option<Instant>,
}

/// TTL-bounded set of active tenant ids.
pub struct TenantCache {
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl TenantCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_stale(&self) -> bool {
        match self.lock().refreshed_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// `None` when the cache is stale and the registry must be consulted.
    pub fn is_active(&self, tenant_id: &str) -> Option<bool> {
        let state = self.lock();
        match state.refreshed_at {
            Some(at) if at.elapsed() < self.ttl => Some(state.active.contains(tenant_id)),
            _ => None,
        }
    }

    /// Replace the whole set and restart the TTL.
    pub fn replace(&self, active: impl IntoIterator<Item = String>) {
        let mut state = self.lock();
        state.active = active.into_iter().collect();
        state.refreshed_at = Some(Instant::now());
    }

    pub fn insert(&self, tenant_id: &str) {
        self.lock().active.insert(tenant_id.to_string());
    }

    pub fn remove(&self, tenant_id: &str) {
        self.lock().active.remove(tenant_id);
    }

    pub fn invalidate(&self) {
        self.lock().refreshed_at = None;
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stale_after_ttl() {
        let cache = TenantCache::new(Duration::from_secs(300));
        assert_eq!(cache.is_active("acme"), None);

        cache.replace(vec!["acme".to_string()]);
        assert_eq!(cache.is_active("acme"), Some(true));
        assert_eq!(cache.is_active("other"), Some(false));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.is_active("acme"), Some(true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.is_stale());
        assert_eq!(cache.is_active("acme"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_updates_keep_freshness() {
        let cache = TenantCache::new(Duration::from_secs(60));
        cache.replace(Vec::new());
        cache.insert("a");
        assert_eq!(cache.is_active("a"), Some(true));
        cache.remove("a");
        assert_eq!(cache.is_active("a"), Some(false));
        assert!(cache.is_empty());

        cache.invalidate();
        assert_eq!(cache.is_active("a"), None);
    }
}
