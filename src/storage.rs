use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{HistoryCache, RecordingsReply, Tweaks};
use crate::clock::Clock;
use crate::error::HistoryError;
use crate::model::{Ms, TimeRange};
use crate::normalize::normalize;
use crate::observability;
use crate::search::{RecordingSearch, RequestPacer, StorageDevice};

/// How long a fetched calendar is served without re-asking the device.
const CALENDAR_FRESHNESS: Duration = Duration::from_secs(10 * 60);
/// Minimum spacing between device calendar requests.
const CALENDAR_REQUEST_SPACING: Duration = Duration::from_secs(1);

/// Settings handed down by the embedding runtime. Everything is optional;
/// missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Ring-buffer depth in ms; zero means the device never overwrites.
    pub cache_depth_ms: u64,
    /// Background refresh period override, seconds.
    pub update_period_secs: Option<u64>,
    /// Deadline for one recordings search, ms.
    pub search_timeout_ms: u64,
    /// Deadline for one calendar search, ms.
    pub calendar_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_depth_ms: 0,
            update_period_secs: None,
            search_timeout_ms: 5 * 60 * 1000,
            calendar_timeout_ms: 60 * 1000,
        }
    }
}

impl StorageConfig {
    fn tweaks(&self) -> Tweaks {
        let mut tweaks = Tweaks {
            cache_depth_ms: self.cache_depth_ms,
            ..Tweaks::default()
        };
        if let Some(period) = self.update_period_secs {
            tweaks.update_cache_timeout_secs = period;
        }
        tweaks
    }
}

struct CalendarEntry {
    added: Instant,
    bounds: TimeRange,
    dates: Vec<Ms>,
}

/// One device's history surface: a lazily-built `HistoryCache` per track,
/// plus a paced, freshness-cached calendar view. This is what the outward
/// facade talks to.
pub struct StorageHistory {
    device: Arc<dyn StorageDevice>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
    caches: DashMap<String, Arc<HistoryCache>>,
    calendars: DashMap<String, CalendarEntry>,
    pacer: RequestPacer,
    cancel: CancellationToken,
}

impl StorageHistory {
    pub fn new(
        device: Arc<dyn StorageDevice>,
        clock: Arc<dyn Clock>,
        config: StorageConfig,
    ) -> Result<Self, HistoryError> {
        let now_ms = clock.now_ms();
        if config.cache_depth_ms != 0 && now_ms <= config.cache_depth_ms as Ms {
            return Err(HistoryError::InvalidCacheDepth {
                depth_ms: config.cache_depth_ms,
                now_ms,
            });
        }
        debug!(?config, "storage history created");
        Ok(Self {
            device,
            clock,
            config,
            caches: DashMap::new(),
            calendars: DashMap::new(),
            pacer: RequestPacer::new(CALENDAR_REQUEST_SPACING),
            cancel: CancellationToken::new(),
        })
    }

    /// The cache for one track, created on first use.
    pub fn cache_for(&self, track_id: &str) -> Result<Arc<HistoryCache>, HistoryError> {
        if let Some(cache) = self.caches.get(track_id) {
            return Ok(cache.clone());
        }
        let cache = HistoryCache::with_search_timeout(
            Arc::clone(&self.device),
            track_id,
            Arc::clone(&self.clock),
            self.config.tweaks(),
            Duration::from_millis(self.config.search_timeout_ms),
        )?;
        let cache = self
            .caches
            .entry(track_id.to_string())
            .or_insert(cache)
            .clone();
        metrics::gauge!(observability::TRACK_CACHES_ACTIVE).set(self.caches.len() as f64);
        Ok(cache)
    }

    pub fn get_recordings(
        &self,
        track_id: &str,
        requested: TimeRange,
        max_count: usize,
        min_gap_ms: Ms,
    ) -> Result<RecordingsReply, HistoryError> {
        Ok(self
            .cache_for(track_id)?
            .get_recordings(requested, max_count, min_gap_ms))
    }

    /// Day boundaries with recorded data for a track. Served from the
    /// per-track calendar cache while fresh; otherwise fetched from the
    /// device, paced against request storms.
    pub async fn get_calendar(
        &self,
        track_id: &str,
        bounds: TimeRange,
    ) -> Result<Vec<Ms>, HistoryError> {
        let window = normalize(bounds, true);

        let cached = self.calendars.get(track_id).and_then(|entry| {
            (entry.added.elapsed() < CALENDAR_FRESHNESS && entry.bounds.contains_range(&window))
                .then(|| {
                    entry
                        .dates
                        .iter()
                        .copied()
                        .filter(|d| window.contains_instant(*d))
                        .collect::<Vec<_>>()
                })
        });
        if let Some(dates) = cached {
            return Ok(dates);
        }

        self.pacer.pace().await;
        let search = RecordingSearch::new(
            Arc::clone(&self.device),
            track_id,
            Duration::from_millis(self.config.calendar_timeout_ms),
        );
        let result = search.calendar(window, self.cancel.child_token()).await;
        self.pacer.mark();
        let dates = result?;
        metrics::counter!(observability::CALENDAR_FETCHES_TOTAL).increment(1);

        self.calendars.insert(
            track_id.to_string(),
            CalendarEntry {
                added: Instant::now(),
                bounds: window,
                dates: dates.clone(),
            },
        );
        Ok(dates)
    }

    /// Bounds of what the cache knows for a track; empty when nothing is
    /// cached yet.
    pub fn presentation_range(&self, track_id: &str) -> TimeRange {
        self.caches
            .get(track_id)
            .map(|cache| cache.presentation_range())
            .unwrap_or(TimeRange::EMPTY)
    }

    /// Drop everything learned about one track, then let it serve again.
    pub async fn clear(&self, track_id: &str) {
        self.calendars.remove(track_id);
        if let Some(cache) = self.caches.get(track_id).map(|c| c.clone()) {
            cache.clear_cache().await;
            cache.restart();
        }
    }

    /// Stop every track cache and cancel in-flight calendar work. Returns
    /// once nothing will call back.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let caches: Vec<Arc<HistoryCache>> =
            self.caches.iter().map(|entry| entry.value().clone()).collect();
        for cache in caches {
            cache.stop().await;
        }
        info!("storage history shut down");
    }
}

/// Best-known presentation bounds given what the cache has and what the
/// device itself reports.
pub fn combined_presentation_range(cache: TimeRange, device: TimeRange) -> TimeRange {
    if device.is_empty() {
        return cache;
    }
    if cache.is_empty() {
        return device;
    }
    cache.hull(&device)
}
