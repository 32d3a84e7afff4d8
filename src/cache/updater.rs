//! The background updater: a timer that re-checks a sliding window of
//! history so the cache notices when a ring-buffer device overwrites old
//! recordings, or when previously-seen spans change underneath it.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::model::{Ms, RangeSet, TimeRange};
use crate::normalize::HOUR_MS;

use super::jobs::JobKind;
use super::{CacheState, HistoryCache, Inner};

impl HistoryCache {
    /// Ring-mode bootstrap: schedule the initial fill of the whole retained
    /// window. A no-op outside ring mode — there, the updater arms itself
    /// once the first history arrives.
    pub(super) fn bootstrap_ring_refresh(self: &Arc<Self>) {
        let window = {
            let mut inner = self.inner.lock();
            if inner.tweaks.cache_depth_ms == 0 {
                return;
            }
            let now = self.clock.now_ms();
            let depth = inner.tweaks.cache_depth_ms as Ms;
            self.set_state(&mut inner, CacheState::Working);
            TimeRange::new((now - depth).max(0), now)
        };
        debug!(track = %self.track_id, ?window, "scheduling initial ring fill");
        self.schedule_search_job(window, RangeSet::new());
    }

    /// (Re-)arm the update timer for `last_update_time + period`, replacing
    /// any timer already pending.
    pub(super) fn charge_update_timer(self: &Arc<Self>, inner: &mut Inner) {
        let delay = (inner.last_update_time + inner.tweaks.update_cache_timeout())
            .saturating_duration_since(Instant::now());
        debug!(
            track = %self.track_id,
            delay_ms = delay.as_millis() as u64,
            "arming update-cache timer"
        );
        if let Some(old) = inner.update_timer.take() {
            old.abort();
        }
        let weak = Arc::downgrade(self);
        inner.update_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cache) = weak.upgrade() {
                cache.update_timer_fired();
            }
        }));
    }

    fn update_timer_fired(self: &Arc<Self>) {
        let next = {
            let mut inner = self.inner.lock();
            // Background work may have drained by now, so a pending stop is
            // observed before anything new is queued.
            if inner.state == CacheState::StopRequested && self.perform_stop_request(&mut inner) {
                return;
            }
            if inner.state != CacheState::Working {
                debug!(track = %self.track_id, "starting background cache refresh");
                self.set_state(&mut inner, CacheState::Working);
            }

            if inner.tweaks.cache_depth_ms != 0 {
                let now = self.clock.now_ms();
                let expire = now - inner.tweaks.cache_depth_ms as Ms;
                let evict = match inner.history.first() {
                    Some(first) => TimeRange::new(expire.min(first.start), expire.max(first.start)),
                    None => TimeRange::new(0, expire.max(0)),
                };
                inner.history.subtract_range(evict);
                inner.performed.subtract(evict);
                let start = inner.history.last().map_or(expire, |r| r.end);
                debug!(
                    track = %self.track_id,
                    ?evict,
                    history_from = ?inner.history.first(),
                    "evicted expired history"
                );
                self.add_search_job(
                    &mut inner,
                    TimeRange::new(start.min(now), now),
                    JobKind::UpdateCache,
                )
            } else {
                let window = inner.update_cache_range;
                self.add_search_job(&mut inner, window, JobKind::UpdateCache)
            }
        };
        if let Some(job) = next {
            self.spawn_search(job);
        }
    }

    /// Fold the answer of an update-cache search back in. An unchanged
    /// window waits out the next period; a changed one is replaced and the
    /// timer re-fires immediately, since one change suggests more.
    pub(super) fn update_cache(
        self: &Arc<Self>,
        inner: &mut Inner,
        requested: TimeRange,
        records: &RangeSet,
    ) {
        let known = inner.history.intersect_range(&requested);
        if *records == known {
            debug!(track = %self.track_id, ?requested, "cache refresh found no changes");
            self.advance_update_window(inner);
            inner.last_update_time = Instant::now();
            self.charge_update_timer(inner);
            return;
        }

        inner.history.subtract_range(requested);
        inner.history.union_with(records);
        debug!(
            track = %self.track_id,
            ?requested,
            found = records.len(),
            "cache refresh replaced a stale span"
        );
        self.advance_update_window(inner);
        self.charge_update_timer(inner);
    }

    /// Slide the refresh window to the next ≤ 1 h chunk of history, wrapping
    /// to the first chunk when the walk runs off the end.
    pub(super) fn advance_update_window(&self, inner: &mut Inner) {
        let next = if inner.update_cache_range.is_empty() {
            inner.history.first()
        } else {
            let tail_end = inner
                .history
                .last()
                .map_or(inner.update_cache_range.end, |r| r.end);
            let ahead = TimeRange {
                start: inner.update_cache_range.end,
                end: tail_end,
            };
            let chunk = if ahead.is_empty() {
                None
            } else {
                inner.history.intersect_range(&ahead).first()
            };
            chunk.or_else(|| inner.history.first())
        };

        inner.update_cache_range = match next {
            Some(mut chunk) => {
                if chunk.duration_ms() > HOUR_MS {
                    chunk.end = chunk.start + HOUR_MS;
                }
                chunk
            }
            None => TimeRange::EMPTY,
        };
    }
}
