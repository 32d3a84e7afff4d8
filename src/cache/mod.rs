mod jobs;
mod ledger;
mod updater;


use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::HistoryError;
use crate::model::{Ms, RangeSet, TimeRange, merge_gaps};
use crate::normalize::{HOUR_MS, normalize, round_to};
use crate::observability;
use crate::search::{DEFAULT_SEARCH_TIMEOUT, RecordingSearch, SearchStatus, StorageDevice};

use jobs::{JobKind, JobQueue, SearchJob};
use ledger::PerformedRequests;

const MAX_SEARCH_ATTEMPTS: u16 = 3;
const OVERHEAD_FROM_NOW_MS: Ms = 10 * 1000;
const ROUND_TO_MS: Ms = HOUR_MS;
const QUEUE_DEPTH: Duration = Duration::from_secs(30);
const EMPTY_RESULT_WINDOW_MS: Ms = 30_000;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Knobs for the cache's timing behavior. Production code runs the
/// defaults; tests and the embedding runtime's settings override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tweaks {
    /// Period of the background refresh, in seconds.
    pub update_cache_timeout_secs: u64,
    /// Window during which a repeated query at the live edge is not
    /// re-dispatched, in milliseconds.
    pub recent_request_interval_ms: u64,
    /// How long an empty device answer near the live edge is believed,
    /// in milliseconds.
    pub empty_result_trust_interval_ms: u64,
    /// Ring-buffer eviction depth, in milliseconds. Zero disables ring
    /// mode.
    pub cache_depth_ms: u64,
}

impl Default for Tweaks {
    fn default() -> Self {
        Self {
            update_cache_timeout_secs: 60 * 60,
            recent_request_interval_ms: 10 * 1000,
            empty_result_trust_interval_ms: 30 * 1000,
            cache_depth_ms: 0,
        }
    }
}

impl Tweaks {
    fn update_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.update_cache_timeout_secs)
    }

    fn recent_request_interval(&self) -> Duration {
        Duration::from_millis(self.recent_request_interval_ms)
    }

    fn empty_result_trust(&self) -> Duration {
        Duration::from_millis(self.empty_result_trust_interval_ms)
    }
}

/// How much of the requested interval the reply covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Everything known; the listed ranges are the complete answer.
    Full,
    /// Best-effort answer; a background fetch may fill the rest.
    Partial,
    /// The cache refused the request (stopping, or too far behind).
    TryLater,
}

impl HistoryStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HistoryStatus::Full => "full",
            HistoryStatus::Partial => "partial",
            HistoryStatus::TryLater => "try_later",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingsReply {
    pub status: HistoryStatus,
    pub ranges: Vec<TimeRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Stopped,
    Working,
    StopRequested,
}

struct Inner {
    state: CacheState,
    /// Set by an external `stop()`; cleared only by `restart()`. While set,
    /// requests get `TryLater` and nothing is scheduled.
    stop_latched: bool,
    tweaks: Tweaks,
    queue: JobQueue,
    search_in_progress: bool,
    searching_range: TimeRange,
    cancel_search: CancellationToken,
    history: RangeSet,
    performed: PerformedRequests,
    recent_requests: RangeSet,
    recent_requests_expire_at: Instant,
    last_update_time: Instant,
    update_cache_range: TimeRange,
    update_timer: Option<JoinHandle<()>>,
    unsuccess_count: u16,
}

/// Interval cache between history queries and one slow recording device.
///
/// `get_recordings` never waits on the device: it answers from cache and
/// schedules at most one background search chain to fill what is missing.
/// All state lives behind one mutex; the mutex is never held across a
/// device call. Background tasks hold only weak references, so dropping
/// the cache strands no work.
pub struct HistoryCache {
    track_id: String,
    device: Arc<dyn StorageDevice>,
    clock: Arc<dyn Clock>,
    search_timeout: Duration,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CacheState>,
    state_rx: watch::Receiver<CacheState>,
}

impl HistoryCache {
    /// Create a cache for one device track. Must be called inside a Tokio
    /// runtime; ring mode schedules its initial fill immediately.
    pub fn new(
        device: Arc<dyn StorageDevice>,
        track_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        tweaks: Tweaks,
    ) -> Result<Arc<Self>, HistoryError> {
        Self::with_search_timeout(device, track_id, clock, tweaks, DEFAULT_SEARCH_TIMEOUT)
    }

    pub fn with_search_timeout(
        device: Arc<dyn StorageDevice>,
        track_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        tweaks: Tweaks,
        search_timeout: Duration,
    ) -> Result<Arc<Self>, HistoryError> {
        let now_ms = clock.now_ms();
        if tweaks.cache_depth_ms != 0 && now_ms <= tweaks.cache_depth_ms as Ms {
            return Err(HistoryError::InvalidCacheDepth {
                depth_ms: tweaks.cache_depth_ms,
                now_ms,
            });
        }
        let (state_tx, state_rx) = watch::channel(CacheState::Stopped);
        let track_id = track_id.into();
        debug!(track = %track_id, ?tweaks, "history cache created");
        let cache = Arc::new(Self {
            track_id,
            device,
            clock,
            search_timeout,
            inner: Mutex::new(Inner {
                state: CacheState::Stopped,
                stop_latched: false,
                tweaks,
                queue: JobQueue::new(),
                search_in_progress: false,
                searching_range: TimeRange::EMPTY,
                cancel_search: CancellationToken::new(),
                history: RangeSet::new(),
                performed: PerformedRequests::new(),
                recent_requests: RangeSet::new(),
                recent_requests_expire_at: Instant::now(),
                last_update_time: Instant::now(),
                update_cache_range: TimeRange::EMPTY,
                update_timer: None,
                unsuccess_count: 0,
            }),
            state_tx,
            state_rx,
        });
        cache.bootstrap_ring_refresh();
        Ok(cache)
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Earliest-to-latest bounds of everything the cache knows about.
    pub fn presentation_range(&self) -> TimeRange {
        self.inner.lock().history.hull()
    }

    /// Answer a history query from cache, scheduling background work for
    /// whatever is missing. Never waits on the device.
    ///
    /// `max_count` (0 = unlimited) trims the reply from the high end;
    /// `min_gap_ms` (0 = off) merges ranges separated by smaller gaps.
    pub fn get_recordings(
        self: &Arc<Self>,
        requested: TimeRange,
        max_count: usize,
        min_gap_ms: Ms,
    ) -> RecordingsReply {
        let reply = self.get_recordings_impl(requested, max_count, min_gap_ms);
        metrics::counter!(observability::HISTORY_REQUESTS_TOTAL, "status" => reply.status.label())
            .increment(1);
        reply
    }

    fn get_recordings_impl(
        self: &Arc<Self>,
        requested: TimeRange,
        max_count: usize,
        min_gap_ms: Ms,
    ) -> RecordingsReply {
        let mut inner = self.inner.lock();
        debug!(track = %self.track_id, ?requested, "user requested interval");

        if inner.stop_latched {
            debug!(track = %self.track_id, "cache is stopped, refusing request");
            return RecordingsReply {
                status: HistoryStatus::TryLater,
                ranges: Vec::new(),
            };
        }

        let (mut full, result, mut missing) = inner.lookup(requested);
        if inner.performed.adjust_to_empty(requested, &mut missing) {
            full = true;
        }

        let result = if min_gap_ms > 0 && result.len() > 1 {
            merge_gaps(&result, min_gap_ms)
        } else {
            result
        };

        if max_count != 0 && result.len() > max_count {
            let mut ranges = result.to_vec();
            ranges.truncate(max_count);
            return RecordingsReply {
                status: HistoryStatus::Partial,
                ranges,
            };
        }

        if full {
            return RecordingsReply {
                status: HistoryStatus::Full,
                ranges: result.to_vec(),
            };
        }

        let now = self.clock.now_ms();
        let original = requested;
        let rounded = round_to(requested, ROUND_TO_MS, now, OVERHEAD_FROM_NOW_MS);

        if !inner.searching_range.is_empty() && inner.searching_range.contains_range(&rounded) {
            debug!(track = %self.track_id, ?rounded, "requested interval is already being searched");
            return RecordingsReply {
                status: HistoryStatus::Partial,
                ranges: result.to_vec(),
            };
        }

        let mut trust_right = false;
        let history_end = inner.history.last().map(|r| r.end);
        if history_end.is_none_or(|end| rounded.end > end) {
            let steady = Instant::now();
            if inner.recent_requests_expire_at <= steady {
                let window = inner.tweaks.recent_request_interval();
                inner.recent_requests_expire_at = steady + window;
                inner.recent_requests.clear();
            }

            let mut right_tail = rounded;
            if let Some(end) = history_end {
                right_tail = TimeRange::new(end.max(rounded.start), rounded.end);
            }
            if right_tail.end + OVERHEAD_FROM_NOW_MS >= now {
                right_tail = TimeRange::new(right_tail.start, right_tail.end + OVERHEAD_FROM_NOW_MS);
                trust_right = true;
            }

            missing.insert(right_tail);
            missing.symmetric_difference(&inner.recent_requests);
            if !missing.is_empty() {
                missing = missing.intersect_range(&original);
            }
            inner.recent_requests.insert(right_tail);
        }

        if missing.is_empty() {
            debug!(track = %self.track_id, ?rounded, "nothing left to ask the device");
            return RecordingsReply {
                status: if trust_right {
                    HistoryStatus::Full
                } else {
                    HistoryStatus::Partial
                },
                ranges: result.to_vec(),
            };
        }

        if inner.queue_depth_reached(&self.track_id) {
            return RecordingsReply {
                status: HistoryStatus::TryLater,
                ranges: Vec::new(),
            };
        }
        if inner.state == CacheState::StopRequested {
            info!(track = %self.track_id, ?rounded, "stop requested, skipping search");
            return RecordingsReply {
                status: HistoryStatus::TryLater,
                ranges: Vec::new(),
            };
        }
        if inner.state != CacheState::Working {
            debug!(track = %self.track_id, "starting background work");
            self.set_state(&mut inner, CacheState::Working);
        }
        drop(inner);

        self.schedule_search_job(rounded, missing);
        RecordingsReply {
            status: HistoryStatus::Partial,
            ranges: result.to_vec(),
        }
    }

    /// Stop all background work. Returns once no device callback will fire;
    /// further requests get `TryLater` until `restart()`.
    pub async fn stop(&self) {
        debug!(track = %self.track_id, "stop requested");
        {
            let mut inner = self.inner.lock();
            inner.stop_latched = true;
            if let Some(timer) = inner.update_timer.take() {
                timer.abort();
            }
            if inner.state == CacheState::Stopped {
                debug!(track = %self.track_id, "already stopped");
                return;
            }
            self.set_state(&mut inner, CacheState::StopRequested);
            inner.cancel_search.cancel();
        }

        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == CacheState::Stopped {
                break;
            }
            let waited =
                tokio::time::timeout(STOP_POLL_INTERVAL, rx.wait_for(|s| *s == CacheState::Stopped))
                    .await;
            if waited.is_ok() {
                break;
            }
            // Cancel again until the in-flight search lets go.
            self.inner.lock().cancel_search.cancel();
        }
        debug!(track = %self.track_id, "stop completed");
    }

    /// Wait until every scheduled search has drained, without stopping
    /// anything.
    pub async fn wait_idle(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == CacheState::Stopped).await;
    }

    /// Stop, then forget everything the cache has learned.
    pub async fn clear_cache(&self) {
        self.stop().await;
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.performed.clear();
        inner.recent_requests.clear();
        inner.update_cache_range = TimeRange::EMPTY;
        info!(track = %self.track_id, "cache cleared");
    }

    /// Lift the stop latch so the cache serves and schedules again.
    pub fn restart(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if !inner.stop_latched {
                return;
            }
            inner.stop_latched = false;
            debug!(track = %self.track_id, "restarted after stop");
        }
        self.bootstrap_ring_refresh();
    }

    /// Replace the timing knobs and re-run the ring bootstrap. Intended for
    /// tests and settings re-application.
    pub fn set_tweaks(self: &Arc<Self>, tweaks: Tweaks) -> Result<(), HistoryError> {
        let now_ms = self.clock.now_ms();
        if tweaks.cache_depth_ms != 0 && now_ms <= tweaks.cache_depth_ms as Ms {
            return Err(HistoryError::InvalidCacheDepth {
                depth_ms: tweaks.cache_depth_ms,
                now_ms,
            });
        }
        {
            let mut inner = self.inner.lock();
            debug!(track = %self.track_id, ?tweaks, "tweaks replaced");
            inner.tweaks = tweaks;
        }
        self.bootstrap_ring_refresh();
        Ok(())
    }

    // ── background scheduling ────────────────────────────────

    fn set_state(&self, inner: &mut Inner, state: CacheState) {
        inner.state = state;
        let _ = self.state_tx.send(state);
    }

    /// Queue the missing pieces (user priority) plus the normalized window,
    /// then start the search chain if none is running.
    fn schedule_search_job(self: &Arc<Self>, rounded: TimeRange, missing: RangeSet) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(cache) = weak.upgrade() else { return };
            let next = {
                let mut inner = cache.inner.lock();
                if cache.perform_stop_request(&mut inner) {
                    return;
                }
                let mut next = None;
                for piece in missing.iter() {
                    let started = cache.add_search_job(&mut inner, *piece, JobKind::User);
                    next = next.or(started);
                }
                let started =
                    cache.add_search_job(&mut inner, normalize(rounded, false), JobKind::Normalizer);
                next.or(started)
            };
            if let Some(job) = next {
                cache.spawn_search(job);
            }
        });
    }

    /// Queue a range for searching; returns a job when the caller should
    /// start the (currently idle) search chain with it.
    fn add_search_job(
        &self,
        inner: &mut Inner,
        range: TimeRange,
        kind: JobKind,
    ) -> Option<SearchJob> {
        if self.perform_stop_request(inner) {
            return None;
        }
        if !inner.searching_range.is_empty() && inner.searching_range.contains_range(&range) {
            return None;
        }
        if inner.queue_depth_reached(&self.track_id) {
            return None;
        }

        // An update-cache window is searched as-is; everything else sheds
        // the parts history and the ledger already cover.
        let pieces = if kind == JobKind::UpdateCache {
            RangeSet::from(range)
        } else {
            inner.split_covered(range)
        };
        if pieces.is_empty() {
            if inner.searching_range.is_empty() && inner.queue.is_empty() {
                self.to_stopped(inner, "nothing left to search");
            }
            return None;
        }

        for piece in pieces.iter() {
            inner.queue.insert(*piece, kind);
        }
        debug!(
            track = %self.track_id,
            kind = kind.label(),
            queued = inner.queue.len(),
            ?range,
            "queued search work"
        );
        metrics::gauge!(observability::SEARCH_QUEUE_JOBS).set(inner.queue.len() as f64);

        if inner.search_in_progress {
            return None;
        }
        self.pick_job(inner)
    }

    fn pick_job(&self, inner: &mut Inner) -> Option<SearchJob> {
        match inner.queue.pop() {
            Some(job) => {
                inner.search_in_progress = true;
                Some(job)
            }
            None => {
                // Impossible by construction; park instead of aborting.
                error!(track = %self.track_id, "search start requested with an empty queue");
                self.to_stopped(inner, "empty queue");
                None
            }
        }
    }

    fn spawn_search(self: &Arc<Self>, job: SearchJob) {
        let weak = Arc::downgrade(self);
        tokio::spawn(run_search(weak, job));
    }

    // ── search result handlers ───────────────────────────────

    fn on_search_ranges(self: &Arc<Self>, records: RangeSet) {
        let mut inner = self.inner.lock();
        if inner.history.is_empty() {
            inner.history.union_with(&records);
            inner.last_update_time = Instant::now();
            self.advance_update_window(&mut inner);
            self.charge_update_timer(&mut inner);
            inner.trim_recent_requests();
            return;
        }

        let found = records.hull();
        inner.history.union_with(&records);
        inner.performed.add(found);
        let overlap = found.intersect(&inner.searching_range);
        let remaining = inner.searching_range.cut_left(&overlap);
        inner.searching_range = remaining;
        inner.trim_recent_requests();
    }

    fn on_search_done(
        self: &Arc<Self>,
        job: SearchJob,
        status: SearchStatus,
        update_records: RangeSet,
        found_count: usize,
    ) {
        let mut inner = self.inner.lock();
        let ok = status == SearchStatus::Ok;
        // Cancelled and timed-out jobs advance without burning retries; the
        // interval stays unrecorded and will be asked again on demand.
        let advance = matches!(status, SearchStatus::Cancelled | SearchStatus::Timeout);
        inner.searching_range = TimeRange::EMPTY;

        if ok {
            inner.unsuccess_count = 0;
            debug!(
                track = %self.track_id,
                range = ?job.range,
                found = found_count,
                "device search completed"
            );
        } else if advance {
            debug!(track = %self.track_id, range = ?job.range, ?status, "device search did not finish");
        } else {
            inner.unsuccess_count += 1;
            warn!(
                track = %self.track_id,
                range = ?job.range,
                attempt = inner.unsuccess_count,
                max = MAX_SEARCH_ATTEMPTS,
                ?status,
                "device search failed"
            );
        }

        if self.perform_stop_request(&mut inner) {
            return;
        }

        if job.kind == JobKind::UpdateCache {
            self.update_cache(&mut inner, job.range, &update_records);
        }

        if ok {
            self.record_live_edge(&mut inner, job.range);
        }

        let mut next;
        loop {
            if !ok && !advance && inner.unsuccess_count < MAX_SEARCH_ATTEMPTS {
                next = job.clone();
            } else {
                if inner.queue.is_empty() {
                    self.to_stopped(&mut inner, "queue drained");
                    return;
                }
                let Some(picked) = inner.queue.pop() else {
                    self.to_stopped(&mut inner, "queue drained");
                    return;
                };
                next = picked;
                inner.unsuccess_count = 0;
            }

            let (covered, _, missing) = inner.lookup(next.range);
            if covered && ok {
                debug!(track = %self.track_id, range = ?next.range, "skipping already-satisfied job");
                continue;
            }

            if !missing.is_empty() {
                let now = self.clock.now_ms();
                let mut pieces = missing.iter();
                if let Some(first) = pieces.next() {
                    next.range = round_to(*first, ROUND_TO_MS, now, OVERHEAD_FROM_NOW_MS);
                }
                for piece in pieces {
                    let extra = round_to(*piece, ROUND_TO_MS, now, OVERHEAD_FROM_NOW_MS);
                    // The chain is busy, so this can only queue.
                    let _ = self.add_search_job(&mut inner, extra, next.kind);
                }
            }
            break;
        }
        drop(inner);
        self.spawn_search(next);
    }

    /// Fold a finished search into the ledger with live-edge care: the
    /// settled past becomes authoritative, while the neighborhood of "now"
    /// is only trusted empty for the configured interval — the device may
    /// still be writing it.
    fn record_live_edge(&self, inner: &mut Inner, requested: TimeRange) {
        let now = self.clock.now_ms();
        let window = TimeRange::new(
            (now - 2 * EMPTY_RESULT_WINDOW_MS).max(0),
            now + EMPTY_RESULT_WINDOW_MS,
        );
        let cropped_end = requested.end.min(window.end);
        if cropped_end <= requested.start {
            return;
        }
        let cropped = TimeRange::new(requested.start, cropped_end);
        let trust = inner.tweaks.empty_result_trust();

        if cropped.end <= window.start {
            if inner.history.is_empty() {
                inner.performed.add(cropped);
            } else if let Some(last) = inner.history.last() {
                // Only the part left of history's newest chunk is settled.
                if last.start > cropped.start {
                    inner
                        .performed
                        .add(TimeRange::new(cropped.start, last.end.min(requested.end)));
                }
            }
        } else if window.start > cropped.start {
            inner.performed.add(TimeRange::new(cropped.start, window.start));
            inner
                .performed
                .add_empty(TimeRange::new(window.start, cropped.end), trust);
        } else {
            inner.performed.add_empty(cropped, trust);
        }
    }

    // ── state transitions ────────────────────────────────────

    /// Observe a pending stop request: drop queued work, go `Stopped`, and
    /// wake the stopper. Returns true when the caller must bail out.
    fn perform_stop_request(&self, inner: &mut Inner) -> bool {
        if inner.state == CacheState::Stopped {
            return true;
        }
        if inner.state != CacheState::StopRequested {
            return false;
        }
        debug!(track = %self.track_id, "performing stop request");
        inner.queue.clear();
        inner.search_in_progress = false;
        self.set_state(inner, CacheState::Stopped);
        true
    }

    fn to_stopped(&self, inner: &mut Inner, reason: &str) {
        debug!(track = %self.track_id, reason, "background work finished, standing by");
        inner.search_in_progress = false;
        self.set_state(inner, CacheState::Stopped);
    }
}

/// One link of the search chain: run the device search for `job` and hand
/// the outcome back to the cache, which decides what runs next. Holds only
/// a weak reference between steps, so a dropped cache ends the chain.
async fn run_search(weak: Weak<HistoryCache>, job: SearchJob) {
    let (search, bounds, cancel) = {
        let Some(cache) = weak.upgrade() else { return };
        let mut inner = cache.inner.lock();
        if cache.perform_stop_request(&mut inner) {
            return;
        }
        inner.cancel_search = CancellationToken::new();
        inner.searching_range = job.range;
        debug!(
            track = %cache.track_id,
            range = ?job.range,
            kind = job.kind.label(),
            "starting device search"
        );
        (
            RecordingSearch::new(
                Arc::clone(&cache.device),
                cache.track_id.clone(),
                cache.search_timeout,
            ),
            job.range,
            inner.cancel_search.clone(),
        )
    };

    let mut update_records = RangeSet::new();
    let mut found_count = 0usize;
    let kind = job.kind;
    let ranges_weak = weak.clone();
    let status = search
        .run(bounds, cancel, |records| {
            found_count += records.len();
            if kind == JobKind::UpdateCache {
                update_records.union_with(&records);
                return;
            }
            if let Some(cache) = ranges_weak.upgrade() {
                cache.on_search_ranges(records);
            }
        })
        .await;

    let Some(cache) = weak.upgrade() else { return };
    cache.on_search_done(job, status, update_records, found_count);
}

impl Inner {
    /// Cache lookup for `requested`: what we can answer now, and what still
    /// needs the device. Returns `(full, result, missing)`.
    fn lookup(&self, requested: TimeRange) -> (bool, RangeSet, RangeSet) {
        let mut missing = RangeSet::new();
        let performed = self.performed.snapshot().intersect_range(&requested);

        if self.history.is_empty() && performed.is_empty() {
            missing.insert(requested);
            return (false, RangeSet::new(), missing);
        }

        let mut result = self.history.intersect_range(&requested);

        let mut uncovered = result.clone();
        uncovered.xor_range(requested);
        if uncovered.is_empty() {
            return (true, result, missing);
        }

        missing = performed.clone();
        missing.union_with(&result);
        missing.xor_range(requested);

        let history_end = self.history.last().map_or(0, |r| r.end);
        if missing.is_empty() && history_end >= requested.end {
            return (true, result, missing);
        }

        if history_end < requested.end {
            if let Some(last) = result.last() {
                missing.insert(TimeRange::new(last.end, requested.end));
            } else if !performed.is_empty() {
                // No recordings, but the range was asked: an authoritative
                // empty answer.
                return (true, result, missing);
            } else {
                missing.insert(requested);
            }
        }

        if result.is_empty() {
            return (false, result, missing);
        }

        // Truncate the answer at the boundary of work already in flight, so
        // the caller never sees data that a running search may extend.
        let mut in_progress = self.queue.union().intersect_range(&requested);
        if !self.searching_range.is_empty() {
            in_progress.insert(self.searching_range.intersect(&requested));
        }
        if let (Some(busy), Some(res_first), Some(res_last)) =
            (in_progress.first(), result.first(), result.last())
            && res_last.end > busy.start
        {
            result.subtract_range(TimeRange::new(busy.start.max(res_first.start), res_last.end));
            return (false, result, missing);
        }

        if !missing.is_empty() {
            // A gap left of any answered piece means the answer would not be
            // prefix-complete; drop it and let the background fill run.
            let miss_start = missing.first().map_or(Ms::MAX, |r| r.start);
            if result.iter().any(|out| miss_start < out.start) {
                result.clear();
            }
            (false, result, missing)
        } else {
            let mut pending = self.queue.union().clone();
            pending.insert(self.searching_range);
            pending.xor_range(requested);
            (pending.is_empty(), result, missing)
        }
    }

    /// The parts of `range` that neither history nor the ledger covers.
    fn split_covered(&self, range: TimeRange) -> RangeSet {
        let mut covered = self.history.intersect_range(&range);
        covered.union_with(&self.performed.snapshot().intersect_range(&range));
        if covered.is_empty() {
            RangeSet::from(range)
        } else {
            covered.xor_range(range);
            covered
        }
    }

    /// Keep only the recent-request suppressions that reach past current
    /// history; anything older has been superseded by real data.
    fn trim_recent_requests(&mut self) {
        let Some(recent_end) = self.recent_requests.last().map(|r| r.end) else {
            return;
        };
        let Some(history_end) = self.history.last().map(|r| r.end) else {
            return;
        };
        if recent_end <= history_end {
            self.recent_requests.clear();
            return;
        }
        self.recent_requests = self
            .recent_requests
            .intersect_range(&TimeRange::new(history_end, recent_end));
    }

    fn queue_depth_reached(&self, track_id: &str) -> bool {
        if let Some(created) = self.queue.front_created_at()
            && created.elapsed() > QUEUE_DEPTH
        {
            warn!(track = %track_id, "refusing request, search queue is too far behind");
            return true;
        }
        false
    }
}
