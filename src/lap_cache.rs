//! Persistent LRU cache of processed laps
//!
//! Each lap is stored as two records: `meta:{key}` (small, rewritten on
//! every read to refresh the access stamp) and `data:{key}` (the full
//! `LapTelemetry`, written once per `set`). Eviction only scans meta records.
//!
//! Backend failures never reach the caller: reads degrade to a miss and
//! writes to a no-op, with a warning logged.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::constants::cache::{BYTES_PER_POINT, ENTRY_OVERHEAD_BYTES, SCHEMA_VERSION};
use crate::data::{LapKey, LapTelemetry};
use crate::error::Result;
use crate::storage::{FileBackend, MemoryBackend, StorageBackend};

const META_PREFIX: &str = "meta:";
const DATA_PREFIX: &str = "data:";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    track: String,
    driver: u32,
    lap: u32,
    size_bytes: u64,
    last_access: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Estimated, for reporting only
    pub total_bytes: u64,
    /// Oldest / newest access stamp, ms since epoch
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

/// Approximate stored size of a lap
pub fn estimate_size(lap: &LapTelemetry) -> u64 {
    lap.points().len() as u64 * BYTES_PER_POINT + ENTRY_OVERHEAD_BYTES
}

struct Store {
    backend: Box<dyn StorageBackend>,
    last_stamp: u64,
}

impl Store {
    /// Access stamps are strictly increasing so equal clock readings never tie
    fn stamp(&mut self, now: u64) -> u64 {
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn metas(&self) -> Result<Vec<(String, Option<EntryMeta>)>> {
        let mut metas = Vec::new();
        for record in self.backend.keys_with_prefix(META_PREFIX)? {
            let key = record[META_PREFIX.len()..].to_string();
            let meta = self
                .backend
                .get(&record)?
                .and_then(|bytes| serde_json::from_slice::<EntryMeta>(&bytes).ok());
            metas.push((key, meta));
        }
        Ok(metas)
    }

    fn read(&mut self, key: &str, now: u64) -> Result<Option<LapTelemetry>> {
        let meta_key = format!("{META_PREFIX}{key}");
        let Some(meta_bytes) = self.backend.get(&meta_key)? else {
            return Ok(None);
        };
        let Some(data) = self.backend.get(&format!("{DATA_PREFIX}{key}"))? else {
            debug!(key, "dropping meta record without data");
            self.backend.delete(&meta_key)?;
            return Ok(None);
        };

        let lap: LapTelemetry = serde_json::from_slice(&data)?;
        let mut meta: EntryMeta = serde_json::from_slice(&meta_bytes)?;
        meta.last_access = self.stamp(now);
        self.backend.put(&meta_key, &serde_json::to_vec(&meta)?)?;
        Ok(Some(lap))
    }

    fn write(&mut self, lap: &LapTelemetry, now: u64) -> Result<()> {
        let key = lap.key.to_string();
        let meta = EntryMeta {
            track: lap.key.track.clone(),
            driver: lap.key.driver,
            lap: lap.key.lap,
            size_bytes: estimate_size(lap),
            last_access: self.stamp(now),
        };
        self.backend
            .put(&format!("{DATA_PREFIX}{key}"), &serde_json::to_vec(lap)?)?;
        self.backend
            .put(&format!("{META_PREFIX}{key}"), &serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.backend.delete(&format!("{META_PREFIX}{key}"))?;
        self.backend.delete(&format!("{DATA_PREFIX}{key}"))?;
        Ok(())
    }

    /// Delete least recently used entries until at most `max` remain
    fn evict(&mut self, max: usize) -> Result<usize> {
        let mut metas = self.metas()?;
        if metas.len() <= max {
            return Ok(0);
        }
        // Unreadable meta records sort first
        metas.sort_by_key(|(_, m)| m.as_ref().map_or(0, |m| m.last_access));
        let excess = metas.len() - max;
        for (key, _) in metas.iter().take(excess) {
            debug!(%key, "evicting");
            self.remove(key)?;
        }
        Ok(excess)
    }

    fn reset(&mut self, version: u32) -> Result<()> {
        self.backend.clear()?;
        self.backend.set_schema_version(version)?;
        self.last_stamp = 0;
        Ok(())
    }
}

pub struct LapCache {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
}

impl LapCache {
    pub fn open(backend: Box<dyn StorageBackend>, clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self::open_versioned(backend, clock, max_entries, SCHEMA_VERSION)
    }

    /// Backend chosen by `config.dir`; an unusable directory falls back to memory
    pub fn from_config(config: &CacheConfig) -> Self {
        let backend: Box<dyn StorageBackend> = match &config.dir {
            Some(dir) => match FileBackend::open(dir) {
                Ok(backend) => Box::new(backend),
                Err(e) => {
                    warn!(error = %e, "cache directory unusable, caching in memory");
                    Box::new(MemoryBackend::new())
                }
            },
            None => Box::new(MemoryBackend::new()),
        };
        Self::open(backend, Arc::new(SystemClock), config.max_entries)
    }

    pub(crate) fn open_versioned(
        backend: Box<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        max_entries: usize,
        version: u32,
    ) -> Self {
        let mut store = Store {
            backend,
            last_stamp: 0,
        };

        match store.backend.schema_version() {
            Ok(Some(found)) if found == version => {
                match store.metas() {
                    Ok(metas) => {
                        store.last_stamp = metas
                            .iter()
                            .filter_map(|(_, m)| m.as_ref().map(|m| m.last_access))
                            .max()
                            .unwrap_or(0);
                    }
                    Err(e) => warn!(error = %e, "failed to scan cache"),
                }
            }
            Ok(found) => {
                info!(?found, expected = version, "cache schema changed, wiping");
                if let Err(e) = store.reset(version) {
                    warn!(error = %e, "failed to reset cache");
                }
            }
            Err(e) => warn!(error = %e, "cache storage unavailable"),
        }

        Self {
            store: Mutex::new(store),
            clock,
            max_entries: max_entries.max(1),
        }
    }

    /// Cached lap, refreshing its access stamp. Failures read as a miss.
    pub fn get(&self, key: &LapKey) -> Option<LapTelemetry> {
        let now = self.clock.now_millis();
        let key = key.to_string();
        match self.store.lock().read(&key, now) {
            Ok(hit) => {
                debug!(%key, hit = hit.is_some(), "cache lookup");
                hit
            }
            Err(e) => {
                warn!(%key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Upsert a lap, then evict down to the entry limit
    pub fn set(&self, lap: &LapTelemetry) {
        profiling::scope!("cache_set");
        let now = self.clock.now_millis();
        let mut store = self.store.lock();
        if let Err(e) = store.write(lap, now) {
            warn!(key = %lap.key, error = %e, "cache write failed");
            return;
        }
        match store.evict(self.max_entries) {
            Ok(0) => {}
            Ok(evicted) => debug!(evicted, "cache evicted"),
            Err(e) => warn!(error = %e, "cache eviction failed"),
        }
    }

    pub fn delete(&self, key: &LapKey) {
        if let Err(e) = self.store.lock().remove(&key.to_string()) {
            warn!(%key, error = %e, "cache delete failed");
        }
    }

    /// Remove every lap recorded for exactly `track`
    pub fn clear_track(&self, track: &str) -> usize {
        let mut store = self.store.lock();
        let result = store.metas().and_then(|metas| {
            let mut removed = 0;
            for (key, meta) in metas {
                if meta.is_some_and(|m| m.track == track) {
                    store.remove(&key)?;
                    removed += 1;
                }
            }
            Ok(removed)
        });
        result.unwrap_or_else(|e| {
            warn!(track, error = %e, "cache clear_track failed");
            0
        })
    }

    pub fn clear_all(&self) {
        if let Err(e) = self.store.lock().reset(SCHEMA_VERSION) {
            warn!(error = %e, "cache clear failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let metas = match self.store.lock().metas() {
            Ok(metas) => metas,
            Err(e) => {
                warn!(error = %e, "cache stats unavailable");
                return CacheStats::default();
            }
        };

        let mut stats = CacheStats::default();
        for meta in metas.into_iter().filter_map(|(_, m)| m) {
            stats.entries += 1;
            stats.total_bytes += meta.size_bytes;
            stats.oldest = Some(stats.oldest.map_or(meta.last_access, |o| o.min(meta.last_access)));
            stats.newest = Some(stats.newest.map_or(meta.last_access, |n| n.max(meta.last_access)));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::data::{LapSource, TelemetryPoint};
    use crate::error::PipelineError;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    fn lap(track: &str, driver: u32, n: u32) -> LapTelemetry {
        let points = (0..10)
            .map(|i| {
                let mut p = TelemetryPoint::at(1_000.0 + i as f64 * 50.0, n);
                p.speed = Some(150.0 + i as f64);
                p
            })
            .collect();
        LapTelemetry::from_points(
            LapKey::new(track, driver, n),
            LapSource::Remote {
                url: format!("mem://{track}/{driver}/{n}"),
            },
            points,
        )
    }

    fn frozen_clock() -> Arc<MockClock> {
        Arc::new(MockClock::with_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000)))
    }

    fn memory_cache(max: usize) -> LapCache {
        LapCache::open(Box::new(MemoryBackend::new()), frozen_clock(), max)
    }

    #[test]
    fn test_set_then_get() {
        let cache = memory_cache(20);
        let entry = lap("cota", 7, 1);
        cache.set(&entry);
        assert_eq!(cache.get(&entry.key), Some(entry));
        assert_eq!(cache.get(&LapKey::new("cota", 7, 2)), None);
    }

    #[test]
    fn test_lru_evicts_oldest_after_overflow() {
        let cache = memory_cache(20);
        for n in 0..21 {
            cache.set(&lap("cota", 7, n));
        }
        assert_eq!(cache.stats().entries, 20);
        assert!(cache.get(&LapKey::new("cota", 7, 0)).is_none());
        for n in 1..21 {
            assert!(cache.get(&LapKey::new("cota", 7, n)).is_some(), "lap {n} missing");
        }
    }

    #[test]
    fn test_read_refreshes_eviction_order() {
        let cache = memory_cache(20);
        for n in 0..20 {
            cache.set(&lap("cota", 7, n));
        }
        assert!(cache.get(&LapKey::new("cota", 7, 0)).is_some());
        cache.set(&lap("cota", 7, 20));

        assert!(cache.get(&LapKey::new("cota", 7, 0)).is_some());
        assert!(cache.get(&LapKey::new("cota", 7, 1)).is_none());
    }

    #[test]
    fn test_stamps_follow_clock() {
        let clock = frozen_clock();
        let cache = LapCache::open(Box::new(MemoryBackend::new()), clock.clone(), 20);
        cache.set(&lap("vir", 2, 1));
        clock.advance(Duration::from_secs(60));
        cache.set(&lap("vir", 2, 2));

        let stats = cache.stats();
        let base = 1_700_000_000_000;
        assert_eq!(stats.oldest, Some(base));
        assert_eq!(stats.newest, Some(base + 60_000));
        assert_eq!(stats.total_bytes, 2 * (10 * BYTES_PER_POINT + ENTRY_OVERHEAD_BYTES));
    }

    #[test]
    fn test_clear_track_matches_exactly() {
        let cache = memory_cache(20);
        cache.set(&lap("cota", 1, 1));
        cache.set(&lap("cota", 1, 2));
        cache.set(&lap("cota_2", 1, 1));

        assert_eq!(cache.clear_track("cota"), 2);
        assert!(cache.get(&LapKey::new("cota", 1, 1)).is_none());
        assert!(cache.get(&LapKey::new("cota_2", 1, 1)).is_some());
    }

    #[test]
    fn test_delete_and_clear_all() {
        let cache = memory_cache(20);
        cache.set(&lap("sebring", 3, 1));
        cache.set(&lap("sebring", 3, 2));
        cache.delete(&LapKey::new("sebring", 3, 1));
        assert_eq!(cache.stats().entries, 1);

        cache.clear_all();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_schema_bump_wipes_entries() {
        let dir = tempdir().unwrap();
        let entry = lap("barber", 9, 4);
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            let cache = LapCache::open_versioned(Box::new(backend), frozen_clock(), 20, 1);
            cache.set(&entry);
        }
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            let cache = LapCache::open_versioned(Box::new(backend), frozen_clock(), 20, 1);
            assert_eq!(cache.get(&entry.key), Some(entry.clone()));
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        let cache = LapCache::open_versioned(Box::new(backend), frozen_clock(), 20, 2);
        assert!(cache.get(&entry.key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_unversioned_store_is_wiped() {
        let mut backend = MemoryBackend::new();
        backend.put("data:stale_1_1", b"{\"old\":true}").unwrap();
        backend.put("meta:stale_1_1", b"{\"old\":true}").unwrap();
        let cache = LapCache::open(Box::new(backend), frozen_clock(), 20);
        assert!(cache.get(&LapKey::new("stale", 1, 1)).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_reopen_continues_stamps() {
        let dir = tempdir().unwrap();
        let clock = frozen_clock();
        {
            let cache = LapCache::open(Box::new(FileBackend::open(dir.path()).unwrap()), clock.clone(), 2);
            cache.set(&lap("road_america", 1, 1));
            cache.set(&lap("road_america", 1, 2));
        }
        let cache = LapCache::open(Box::new(FileBackend::open(dir.path()).unwrap()), clock, 2);
        cache.set(&lap("road_america", 1, 3));
        assert!(cache.get(&LapKey::new("road_america", 1, 1)).is_none());
        assert!(cache.get(&LapKey::new("road_america", 1, 2)).is_some());
    }

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn schema_version(&self) -> Result<Option<u32>> {
            Err(PipelineError::Storage("quota exceeded".into()))
        }
        fn set_schema_version(&mut self, _: u32) -> Result<()> {
            Err(PipelineError::Storage("quota exceeded".into()))
        }
        fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Err(PipelineError::Storage("unavailable".into()))
        }
        fn put(&mut self, _: &str, _: &[u8]) -> Result<()> {
            Err(PipelineError::Storage("quota exceeded".into()))
        }
        fn delete(&mut self, _: &str) -> Result<()> {
            Err(PipelineError::Storage("unavailable".into()))
        }
        fn keys_with_prefix(&self, _: &str) -> Result<Vec<String>> {
            Err(PipelineError::Storage("unavailable".into()))
        }
        fn clear(&mut self) -> Result<()> {
            Err(PipelineError::Storage("unavailable".into()))
        }
    }

    #[test]
    fn test_backend_failures_degrade() {
        let cache = LapCache::open(Box::new(BrokenBackend), frozen_clock(), 20);
        let entry = lap("cota", 1, 1);
        cache.set(&entry);
        assert_eq!(cache.get(&entry.key), None);
        cache.delete(&entry.key);
        assert_eq!(cache.clear_track("cota"), 0);
        cache.clear_all();
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
