use std::time::Duration;

use tokio::time::Instant;

use crate::model::{RangeSet, TimeRange};

/// Ledger of intervals the device has already been asked about.
///
/// `asked` holds every range a successful search covered, so a gap in
/// `history` inside `asked` is an authoritative "no data there". Ranges
/// near the live edge that came back empty land in `asked_empty` instead:
/// that claim is provisional — the device may still be writing — and the
/// whole empty set expires together after its trust interval.
#[derive(Debug, Default)]
pub struct PerformedRequests {
    asked: RangeSet,
    asked_empty: RangeSet,
    empty_expires_at: Option<Instant>,
}

impl PerformedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.asked.clear();
        self.asked_empty.clear();
        self.empty_expires_at = None;
    }

    pub fn add(&mut self, range: TimeRange) {
        self.asked.insert(range);
    }

    pub fn add_empty(&mut self, range: TimeRange, trust: Duration) {
        self.asked_empty.insert(range);
        self.empty_expires_at = Some(Instant::now() + trust);
    }

    /// Forget a range, both the authoritative record and any provisional
    /// empty claim over it (an evicted span must not keep testifying).
    pub fn subtract(&mut self, range: TimeRange) {
        self.asked.subtract_range(range);
        self.asked_empty.subtract_range(range);
    }

    pub fn snapshot(&self) -> &RangeSet {
        &self.asked
    }

    /// Fold trusted empty results into a lookup.
    ///
    /// Returns true when `requested` needs no device work: every part of it
    /// up to the last trusted-empty boundary is either trusted empty or
    /// already asked. Otherwise the uncovered parts are appended to
    /// `missing` and false is returned. An expired trust window clears the
    /// empty set as a side effect.
    pub fn adjust_to_empty(&mut self, requested: TimeRange, missing: &mut RangeSet) -> bool {
        if self.asked_empty.is_empty() {
            return false;
        }
        let expires_at = match self.empty_expires_at {
            Some(t) => t,
            None => return false,
        };
        if expires_at <= Instant::now() {
            self.asked_empty.clear();
            self.empty_expires_at = None;
            return false;
        }

        // Nothing beyond the last empty claim can be judged here.
        let last_empty_end = match self.asked_empty.last() {
            Some(r) => r.end,
            None => return false,
        };
        let truncated = TimeRange {
            start: requested.start,
            end: requested.end.min(last_empty_end),
        };
        if truncated.is_empty() {
            return true;
        }

        let mut uncovered = self.asked_empty.intersect_range(&truncated);
        uncovered.xor_range(truncated);
        if uncovered.is_empty() {
            return true;
        }
        if self.asked.contains_set(&uncovered) {
            return true;
        }

        missing.union_with(&uncovered);
        false
    }
}
