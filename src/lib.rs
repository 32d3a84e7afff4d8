//! Interval cache between a VMS runtime and a slow surveillance recording
//! device.
//!
//! Clients ask "when does recorded media exist between t₁ and t₂?"; the
//! device answers slowly, unreliably, and in large chunks. [`HistoryCache`]
//! answers from memory where it can, schedules at most one background
//! device search chain for what it cannot, deduplicates overlapping
//! requests, and treats the live edge with care: a recent empty answer
//! near "now" is believed only for a configured trust interval.
//!
//! [`StorageHistory`] bundles one cache per device track together with a
//! paced calendar view — the surface an outward facade talks to.

pub mod cache;
pub mod clock;
mod error;
pub mod model;
pub mod normalize;
pub mod observability;
pub mod search;
pub mod storage;

pub use cache::{HistoryCache, HistoryStatus, RecordingsReply, Tweaks};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::HistoryError;
pub use model::{Ms, RangeSet, TimeRange, merge_gaps, split_range};
pub use search::{
    DEFAULT_SEARCH_TIMEOUT, RecordingSearch, RequestPacer, SearchStatus, StorageDevice,
    TrackRanges,
};
pub use storage::{StorageConfig, StorageHistory, combined_presentation_range};
