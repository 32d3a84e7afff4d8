use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::error::HistoryError;
use crate::model::{Ms, RangeSet, TimeRange};
use crate::normalize::DAY_MS;
use crate::observability;

/// Default deadline for one device-side search.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const RESULT_CHANNEL_CAPACITY: usize = 32;
const MAX_FAILED_CALENDAR_ATTEMPTS: u32 = 5;

/// Final status of one device-side search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Ok,
    Cancelled,
    Timeout,
    TransientError,
    FatalError,
}

impl SearchStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SearchStatus::Ok => "ok",
            SearchStatus::Cancelled => "cancelled",
            SearchStatus::Timeout => "timeout",
            SearchStatus::TransientError => "transient_error",
            SearchStatus::FatalError => "fatal_error",
        }
    }
}

/// One batch of recorded ranges reported by the device. Devices report per
/// track; the searcher keeps only the track it was asked about.
#[derive(Debug, Clone)]
pub struct TrackRanges {
    pub track_id: String,
    pub ranges: Vec<TimeRange>,
}

/// The recording device, as injected by the embedding runtime.
///
/// Implementations send zero or more batches on `results`, then return the
/// final status exactly once. They must observe `cancel` and finish promptly
/// once it fires; a search that outlives the searcher's deadline is cancelled
/// through the same token.
#[async_trait]
pub trait StorageDevice: Send + Sync + 'static {
    async fn find_recordings(
        &self,
        bounds: TimeRange,
        results: mpsc::Sender<TrackRanges>,
        cancel: CancellationToken,
    ) -> SearchStatus;

    /// Whether the device answers calendar queries natively. When it does
    /// not, the searcher derives day boundaries from a recordings search.
    fn supports_calendar(&self) -> bool {
        false
    }

    /// Stream day-boundary timestamps with recorded data. Only called when
    /// `supports_calendar` returns true.
    async fn get_calendar(
        &self,
        bounds: TimeRange,
        dates: mpsc::Sender<Ms>,
        cancel: CancellationToken,
    ) -> SearchStatus {
        let _ = (bounds, dates, cancel);
        SearchStatus::FatalError
    }
}

/// One-shot wrapper around a device search. Adds a deadline, cancellation,
/// track filtering, and ordered delivery: every range batch is handed to the
/// caller before the final status is returned, all on the caller's task.
pub struct RecordingSearch {
    device: Arc<dyn StorageDevice>,
    track_id: String,
    timeout: Duration,
}

impl RecordingSearch {
    pub fn new(device: Arc<dyn StorageDevice>, track_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            device,
            track_id: track_id.into(),
            timeout,
        }
    }

    /// Run one search over `bounds`. `on_range` fires once per matching
    /// non-empty batch, in device order, before this returns.
    pub async fn run(
        &self,
        bounds: TimeRange,
        cancel: CancellationToken,
        mut on_range: impl FnMut(RangeSet),
    ) -> SearchStatus {
        let search_id = Ulid::new();
        debug!(%search_id, track = %self.track_id, ?bounds, "device search started");
        let started = std::time::Instant::now();

        let (tx, mut rx) = mpsc::channel::<TrackRanges>(RESULT_CHANNEL_CAPACITY);
        let device = Arc::clone(&self.device);
        let child = cancel.child_token();
        let device_token = child.clone();
        let mut device_task: JoinHandle<SearchStatus> =
            tokio::spawn(async move { device.find_recordings(bounds, tx, device_token).await });

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut saw_batch = false;
        let mut matched = false;
        let mut timed_out = false;
        let mut deliver = |batch: TrackRanges| {
            if !batch.ranges.is_empty() {
                saw_batch = true;
            }
            if batch.track_id != self.track_id {
                debug!(%search_id, track = %batch.track_id, "skipping ranges for foreign track");
                return;
            }
            let mut set = RangeSet::new();
            for r in batch.ranges {
                set.insert(r);
            }
            if !set.is_empty() {
                matched = true;
                on_range(set);
            }
        };

        let status = loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(batch) => deliver(batch),
                    None => break join_status(&mut device_task).await,
                },
                res = &mut device_task => {
                    // Flush anything still buffered so ranges land before
                    // the completion status.
                    while let Ok(batch) = rx.try_recv() {
                        deliver(batch);
                    }
                    break finished_status(res);
                }
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    debug!(%search_id, "device search deadline reached, cancelling");
                    child.cancel();
                }
            }
        };

        if saw_batch && !matched {
            warn!(
                %search_id,
                track = %self.track_id,
                "device returned ranges, but none for the requested track"
            );
        }

        let status = if timed_out && status != SearchStatus::Ok {
            SearchStatus::Timeout
        } else {
            status
        };

        metrics::counter!(observability::DEVICE_SEARCHES_TOTAL, "outcome" => status.label())
            .increment(1);
        metrics::histogram!(observability::DEVICE_SEARCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!(%search_id, ?status, elapsed_ms = started.elapsed().as_millis() as u64, "device search finished");
        status
    }

    /// Day boundaries with recorded data inside `bounds`, sorted and
    /// deduplicated. Uses the device's native calendar search when it has
    /// one, and otherwise derives the days from a recordings search.
    ///
    /// Transient failures that made no progress are retried up to five
    /// times; an attempt that surfaced new ranges restarts the budget from
    /// the last reported boundary. Fatal errors, cancellation, and timeouts
    /// surface immediately.
    pub async fn calendar(
        &self,
        bounds: TimeRange,
        cancel: CancellationToken,
    ) -> Result<Vec<Ms>, HistoryError> {
        let mut failed = 0u32;
        let mut window = bounds;
        let mut dates: Vec<Ms> = Vec::new();

        loop {
            let (status, progress) = if self.device.supports_calendar() {
                (self.native_calendar_attempt(window, &cancel, &mut dates).await, None)
            } else {
                self.fallback_calendar_attempt(window, &cancel, &mut dates).await
            };

            match status {
                SearchStatus::Ok => {
                    dates.sort_unstable();
                    dates.dedup();
                    return Ok(dates);
                }
                SearchStatus::Cancelled => return Err(HistoryError::Cancelled),
                SearchStatus::Timeout => return Err(HistoryError::Timeout),
                SearchStatus::FatalError => return Err(HistoryError::Device(status)),
                SearchStatus::TransientError => {
                    match progress {
                        Some(boundary) if boundary > window.start => {
                            window.start = boundary.min(window.end);
                            failed = 0;
                        }
                        _ => failed += 1,
                    }
                    if failed > MAX_FAILED_CALENDAR_ATTEMPTS {
                        return Err(HistoryError::AttemptsExhausted(failed));
                    }
                    warn!(
                        track = %self.track_id,
                        ?window,
                        attempt = failed,
                        "calendar search failed, retrying"
                    );
                }
            }
        }
    }

    async fn native_calendar_attempt(
        &self,
        bounds: TimeRange,
        cancel: &CancellationToken,
        dates: &mut Vec<Ms>,
    ) -> SearchStatus {
        let (tx, mut rx) = mpsc::channel::<Ms>(RESULT_CHANNEL_CAPACITY);
        let device = Arc::clone(&self.device);
        let child = cancel.child_token();
        let device_token = child.clone();
        let mut device_task =
            tokio::spawn(async move { device.get_calendar(bounds, tx, device_token).await });

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        let status = loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(date) => dates.push(date),
                    None => break join_status(&mut device_task).await,
                },
                res = &mut device_task => {
                    while let Ok(date) = rx.try_recv() {
                        dates.push(date);
                    }
                    break finished_status(res);
                }
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    child.cancel();
                }
            }
        };
        if timed_out && status != SearchStatus::Ok {
            SearchStatus::Timeout
        } else {
            status
        }
    }

    async fn fallback_calendar_attempt(
        &self,
        bounds: TimeRange,
        cancel: &CancellationToken,
        dates: &mut Vec<Ms>,
    ) -> (SearchStatus, Option<Ms>) {
        let mut progress: Option<Ms> = None;
        let status = self
            .run(bounds, cancel.clone(), |ranges| {
                for r in ranges.iter() {
                    let mut day = r.start - r.start.rem_euclid(DAY_MS);
                    while day < r.end {
                        dates.push(day);
                        day += DAY_MS;
                    }
                }
                if let Some(last) = ranges.last() {
                    progress = Some(progress.map_or(last.end, |p: Ms| p.max(last.end)));
                }
            })
            .await;
        (status, progress)
    }
}

fn finished_status(res: Result<SearchStatus, tokio::task::JoinError>) -> SearchStatus {
    match res {
        Ok(status) => status,
        Err(e) => {
            error!("device search task failed: {e}");
            SearchStatus::FatalError
        }
    }
}

async fn join_status(task: &mut JoinHandle<SearchStatus>) -> SearchStatus {
    finished_status(task.await)
}

/// Spaces consecutive device requests so a chatty client cannot storm the
/// device. Callers `pace()` before the request and `mark()` after it.
pub struct RequestPacer {
    min_spacing: Duration,
    last: parking_lot::Mutex<Option<tokio::time::Instant>>,
}

impl RequestPacer {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            last: parking_lot::Mutex::new(None),
        }
    }

    /// Sleep off whatever remains of the spacing since the previous request.
    pub async fn pace(&self) {
        let debt = {
            let last = self.last.lock();
            last.map(|t| (t + self.min_spacing).saturating_duration_since(tokio::time::Instant::now()))
        };
        if let Some(debt) = debt.filter(|d| !d.is_zero()) {
            tokio::time::sleep(debt).await;
        }
    }

    pub fn mark(&self) {
        *self.last.lock() = Some(tokio::time::Instant::now());
    }
}
