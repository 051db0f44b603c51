//! Key-value profile store with per-key write serialization and an LRU front.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::profiles::repo::RepositoryProfile;
use crate::profiles::user::UserProfile;
use crate::storage::Pool;
use crate::types::EventKind;

/// Bounded cache in front of the profile table.
///
/// Eviction trims the oldest tenth in one pass when the capacity is
/// exceeded, so the hot path never scans on every insert.
struct BoundedCache<V> {
    entries: HashMap<String, (V, u64)>,
    capacity: usize,
    clock: u64,
}

impl<V: Clone> BoundedCache<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<V> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|(value, used)| {
            *used = clock;
            value.clone()
        })
    }

    fn put(&mut self, key: String, value: V) {
        self.clock += 1;
        self.entries.insert(key, (value, self.clock));

        if self.entries.len() > self.capacity {
            let mut stamps: Vec<u64> = self.entries.values().map(|(_, used)| *used).collect();
            stamps.sort_unstable();
            let cutoff = stamps[self.entries.len() / 10];
            self.entries.retain(|_, (_, used)| *used > cutoff);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Profile store backed by SQLite with per-key read-modify-write.
///
/// Concurrent callers on the same key are serialized by a keyed async lock;
/// callers on distinct keys proceed concurrently.
pub struct ProfileStore {
    pool: Pool,
    users: Mutex<BoundedCache<UserProfile>>,
    repos: Mutex<BoundedCache<RepositoryProfile>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    mvn_n: u64,
}

impl ProfileStore {
    pub fn new(pool: Pool, cache_entries: usize, mvn_n: u64) -> Self {
        Self {
            pool,
            users: Mutex::new(BoundedCache::new(cache_entries)),
            repos: Mutex::new(BoundedCache::new(cache_entries)),
            locks: Mutex::new(HashMap::new()),
            mvn_n,
        }
    }

    fn user_key(actor_id: i64) -> String {
        format!("user:{actor_id}")
    }

    fn repo_key(repo_id: i64) -> String {
        format!("repo:{repo_id}")
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > 8192 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Snapshot of an actor profile; an empty in-memory profile on cold start.
    pub async fn get_user(&self, actor_id: i64, login: &str, now: DateTime<Utc>) -> UserProfile {
        let key = Self::user_key(actor_id);
        if let Some(profile) = self.users.lock().get(&key) {
            return profile;
        }

        match self.load::<UserProfile>(&key).await {
            Ok(Some(mut profile)) => {
                profile.ensure_inverse_covariance(self.mvn_n);
                self.users.lock().put(key, profile.clone());
                profile
            }
            Ok(None) => UserProfile::new(actor_id, login, now),
            Err(e) => {
                warn!(key = %key, error = %e, "Profile load failed, using cold profile");
                UserProfile::new(actor_id, login, now)
            }
        }
    }

    /// Snapshot of a repository profile; empty on cold start.
    pub async fn get_repo(
        &self,
        repo_id: i64,
        full_name: &str,
        now: DateTime<Utc>,
    ) -> RepositoryProfile {
        let key = Self::repo_key(repo_id);
        if let Some(profile) = self.repos.lock().get(&key) {
            return profile;
        }

        match self.load::<RepositoryProfile>(&key).await {
            Ok(Some(profile)) => {
                self.repos.lock().put(key, profile.clone());
                profile
            }
            Ok(None) => RepositoryProfile::new(repo_id, full_name, now),
            Err(e) => {
                warn!(key = %key, error = %e, "Profile load failed, using cold profile");
                RepositoryProfile::new(repo_id, full_name, now)
            }
        }
    }

    /// Atomically apply the EWMA feature update to an actor profile.
    pub async fn upsert_user(
        &self,
        actor_id: i64,
        login: &str,
        features: &[f64],
        kind: &EventKind,
        now: DateTime<Utc>,
        alpha: f64,
    ) -> Result<UserProfile> {
        let key = Self::user_key(actor_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // The cache guard must drop before any await point.
        let cached = self.users.lock().get(&key);
        let mut profile = match cached {
            Some(p) => p,
            None => match self.load::<UserProfile>(&key).await? {
                Some(p) => p,
                None => UserProfile::new(actor_id, login, now),
            },
        };

        profile.observe(features, kind, now, alpha);
        profile.ensure_inverse_covariance(self.mvn_n);

        self.persist(&key, &profile, now).await?;
        self.users.lock().put(key, profile.clone());
        Ok(profile)
    }

    /// Atomically fold one event into a repository profile.
    pub async fn touch_repo(
        &self,
        repo_id: i64,
        full_name: &str,
        ts: DateTime<Utc>,
        actor_id: i64,
        kind: &EventKind,
        alpha: f64,
    ) -> Result<RepositoryProfile> {
        let key = Self::repo_key(repo_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let cached = self.repos.lock().get(&key);
        let mut profile = match cached {
            Some(p) => p,
            None => match self.load::<RepositoryProfile>(&key).await? {
                Some(p) => p,
                None => RepositoryProfile::new(repo_id, full_name, ts),
            },
        };

        profile.touch(ts, actor_id, kind, alpha);

        self.persist(&key, &profile, ts).await?;
        self.repos.lock().put(key, profile.clone());
        Ok(profile)
    }

    /// Write back a repository profile whose criticality cache was refreshed.
    pub async fn cache_repo_criticality(
        &self,
        repo_id: i64,
        profile: &RepositoryProfile,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = Self::repo_key(repo_id);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        self.persist(&key, profile, now).await?;
        self.repos.lock().put(key, profile.clone());
        Ok(())
    }

    /// Purge profiles idle longer than the TTL. Returns rows removed.
    pub async fn purge_stale(&self, ttl_days: u64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(ttl_days as i64)).to_rfc3339();
        let pool = self.pool.clone();

        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = pool.get()?;
            let n = conn.execute("DELETE FROM profiles WHERE updated_at < ?1", params![cutoff])?;
            Ok(n)
        })
        .await
        .context("purge task panicked")??;

        if removed > 0 {
            debug!(removed, "Purged stale profiles");
        }
        Ok(removed)
    }

    /// Cached entry counts (users, repos), for the stats reporter.
    pub fn cache_sizes(&self) -> (usize, usize) {
        (self.users.lock().len(), self.repos.lock().len())
    }

    async fn load<V: DeserializeOwned + Send + 'static>(&self, key: &str) -> Result<Option<V>> {
        let pool = self.pool.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<V>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached("SELECT value FROM profiles WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => {
                    let blob: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&blob)?))
                }
                None => Ok(None),
            }
        })
        .await
        .context("profile load task panicked")?
    }

    async fn persist<V: Serialize>(&self, key: &str, value: &V, now: DateTime<Utc>) -> Result<()> {
        let blob = serde_json::to_string(value)?;
        let pool = self.pool.clone();
        let key = key.to_string();
        let updated_at = now.to_rfc3339();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO profiles (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, blob, updated_at],
            )?;
            Ok(())
        })
        .await
        .context("profile persist task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;

    fn store() -> ProfileStore {
        ProfileStore::new(open_memory_pool().unwrap(), 100, 30)
    }

    #[tokio::test]
    async fn test_cold_start_profile_is_empty() {
        let store = store();
        let profile = store.get_user(1, "octocat", Utc::now()).await;
        assert_eq!(profile.sample_count, 0);
    }

    #[tokio::test]
    async fn test_upsert_increments_sample_count() {
        let store = store();
        let now = Utc::now();
        let features = vec![1.0; crate::profiles::user::FEATURE_DIM];

        store
            .upsert_user(1, "octocat", &features, &EventKind::Push, now, 0.05)
            .await
            .unwrap();
        let profile = store
            .upsert_user(1, "octocat", &features, &EventKind::Push, now, 0.05)
            .await
            .unwrap();

        assert_eq!(profile.sample_count, 2);

        // Round-trips through the cache and the table.
        let loaded = store.get_user(1, "octocat", now).await;
        assert_eq!(loaded.sample_count, 2);
    }

    #[tokio::test]
    async fn test_touch_repo_persists() {
        let store = store();
        let now = Utc::now();
        store
            .touch_repo(7, "octocat/hello-world", now, 1, &EventKind::Push, 0.05)
            .await
            .unwrap();
        let profile = store.get_repo(7, "octocat/hello-world", now).await;
        assert_eq!(profile.total_events, 1);
    }

    #[tokio::test]
    async fn test_purge_stale_removes_old_rows() {
        let store = store();
        let old = Utc::now() - Duration::days(90);
        let features = vec![1.0; crate::profiles::user::FEATURE_DIM];
        store
            .upsert_user(1, "octocat", &features, &EventKind::Push, old, 0.05)
            .await
            .unwrap();

        let removed = store.purge_stale(30).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_bounded_cache_evicts_oldest() {
        let mut cache: BoundedCache<u32> = BoundedCache::new(10);
        for i in 0..11 {
            cache.put(format!("k{i}"), i);
        }
        assert!(cache.len() <= 10);
        // The newest entry always survives eviction.
        assert_eq!(cache.get("k10"), Some(10));
    }
}
