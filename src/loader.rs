//! Lap loading: cache first, then the worker pool, then back into the cache

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::channel;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::data::{Channel, LapKey, LapSource, LapTelemetry, TelemetryPoint};
use crate::error::{PipelineError, Result};
use crate::lap_cache::LapCache;
use crate::perf::{Priority, TaskCallbacks, TaskRequest, WorkerPool};

pub struct LapLoader {
    pool: Arc<WorkerPool>,
    cache: Arc<LapCache>,
    base_url: String,
    in_flight: Mutex<HashSet<LapKey>>,
}

/// Removes a key from the in-flight set when the load ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<LapKey>>,
    key: LapKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl LapLoader {
    pub fn new(pool: Arc<WorkerPool>, cache: Arc<LapCache>, base_url: impl Into<String>) -> Self {
        Self {
            pool,
            cache,
            base_url: base_url.into(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cache(&self) -> &LapCache {
        &self.cache
    }

    /// `{base_url}/{track}/{driver}/{lap}.json.gz`
    pub fn lap_url(&self, key: &LapKey) -> String {
        format!(
            "{}/{}/{}/{}.json.gz",
            self.base_url.trim_end_matches('/'),
            key.track,
            key.driver,
            key.lap
        )
    }

    /// Load a lap, from the cache when possible.
    ///
    /// Chunks are forwarded to `callbacks` as they stream in. A second load
    /// of a key that is still in flight fails with `AlreadyLoading`.
    pub fn load(&self, key: &LapKey, callbacks: TaskCallbacks) -> Result<LapTelemetry> {
        if let Some(lap) = self.cache.get(key) {
            debug!(%key, "served from cache");
            return Ok(lap);
        }

        let _guard = self.claim(key)?;
        let url = self.lap_url(key);
        let (tx, chunks) = channel();
        let handle = self.pool.enqueue(
            TaskRequest::ParseLap {
                url: url.clone(),
                lap_id: key.to_string(),
            },
            Priority::High,
            callbacks.tee_chunks(tx),
        );

        let output = handle.wait()?;
        // Chunk hooks run before the task settles, so every chunk is buffered by now
        let points: Vec<TelemetryPoint> = chunks.try_iter().flatten().collect();
        let lap = LapTelemetry::from_points(key.clone(), LapSource::Remote { url }, points);

        if let Some(expected) = output.into_metadata() {
            if expected.point_count != lap.metadata().point_count {
                warn!(
                    %key,
                    expected = expected.point_count,
                    received = lap.metadata().point_count,
                    "chunk count mismatch"
                );
            }
        }

        self.cache.set(&lap);
        info!(%key, points = lap.points().len(), "lap loaded");
        Ok(lap)
    }

    /// Parse an uploaded file through the pool; uploads are not cached
    pub fn load_upload(&self, data: Vec<u8>, filename: &str, callbacks: TaskCallbacks) -> Result<LapTelemetry> {
        let (tx, chunks) = channel();
        let handle = self.pool.enqueue(
            TaskRequest::ParseUpload {
                data,
                filename: filename.to_string(),
            },
            Priority::Normal,
            callbacks.tee_chunks(tx),
        );
        handle.wait()?;

        let points: Vec<TelemetryPoint> = chunks.try_iter().flatten().collect();
        let lap_number = points.first().map_or(0, |p| p.lap);
        Ok(LapTelemetry::from_points(
            LapKey::new(filename, 0, lap_number),
            LapSource::Upload {
                filename: filename.to_string(),
            },
            points,
        ))
    }

    /// Downsample off the calling thread
    pub fn downsample(&self, points: Vec<TelemetryPoint>, target_points: usize, channel: Channel) -> Result<Vec<TelemetryPoint>> {
        let handle = self.pool.enqueue(
            TaskRequest::Downsample {
                points,
                target_points,
                channel,
            },
            Priority::Normal,
            TaskCallbacks::new(),
        );
        handle
            .wait()?
            .into_points()
            .ok_or_else(|| PipelineError::Parse("downsample returned no points".to_string()))
    }

    fn claim(&self, key: &LapKey) -> Result<InFlight<'_>> {
        if !self.in_flight.lock().insert(key.clone()) {
            return Err(PipelineError::AlreadyLoading(key.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            key: key.clone(),
        })
    }
}
