use serde::{Deserialize, Serialize};

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`. Empty iff `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Ms,
    pub end: Ms,
}

impl TimeRange {
    /// The canonical empty range.
    pub const EMPTY: TimeRange = TimeRange { start: 0, end: 0 };

    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "TimeRange start must not exceed end");
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`. The empty range is
    /// contained in everything.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    /// Intersection of two ranges, empty if they are disjoint.
    pub fn intersect(&self, other: &TimeRange) -> TimeRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            TimeRange::new(start, end)
        } else {
            TimeRange::EMPTY
        }
    }

    /// Smallest range containing both operands.
    pub fn hull(&self, other: &TimeRange) -> TimeRange {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        TimeRange::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// The part of `self` at or after `other`'s upper bound. Used to shrink
    /// an in-flight search window as results arrive from its left side.
    pub fn cut_left(&self, other: &TimeRange) -> TimeRange {
        if other.is_empty() {
            return *self;
        }
        if other.end >= self.end {
            return TimeRange::EMPTY;
        }
        TimeRange::new(self.start.max(other.end), self.end)
    }
}

/// Ordered set of disjoint, non-adjacent half-open ranges. Inserting a range
/// that overlaps or touches existing elements merges them; iteration is in
/// increasing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<TimeRange>,
}

impl From<TimeRange> for RangeSet {
    fn from(r: TimeRange) -> Self {
        let mut set = RangeSet::new();
        set.insert(r);
        set
    }
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges in the set.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    pub fn first(&self) -> Option<TimeRange> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<TimeRange> {
        self.ranges.last().copied()
    }

    pub fn to_vec(&self) -> Vec<TimeRange> {
        self.ranges.clone()
    }

    /// Smallest range containing the whole set; empty for the empty set.
    pub fn hull(&self) -> TimeRange {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.start, last.end),
            _ => TimeRange::EMPTY,
        }
    }

    /// Insert a range, merging any overlapping or adjacent elements.
    pub fn insert(&mut self, r: TimeRange) {
        if r.is_empty() {
            return;
        }
        // Elements ending strictly before r.start can't merge; neither can
        // elements starting strictly after r.end (== on either side is
        // adjacency, which merges).
        let lo = self.ranges.partition_point(|x| x.end < r.start);
        let hi = self.ranges.partition_point(|x| x.start <= r.end);
        if lo == hi {
            self.ranges.insert(lo, r);
            return;
        }
        let merged = TimeRange::new(
            r.start.min(self.ranges[lo].start),
            r.end.max(self.ranges[hi - 1].end),
        );
        self.ranges.splice(lo..hi, std::iter::once(merged));
    }

    pub fn union_with(&mut self, other: &RangeSet) {
        for r in &other.ranges {
            self.insert(*r);
        }
    }

    /// Ranges of the set clamped to `r`.
    pub fn intersect_range(&self, r: &TimeRange) -> RangeSet {
        let mut result = RangeSet::new();
        if r.is_empty() {
            return result;
        }
        let lo = self.ranges.partition_point(|x| x.end <= r.start);
        for x in &self.ranges[lo..] {
            if x.start >= r.end {
                break;
            }
            result.ranges.push(x.intersect(r));
        }
        result
    }

    pub fn intersect_set(&self, other: &RangeSet) -> RangeSet {
        let mut result = RangeSet::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let piece = a.intersect(&b);
            if !piece.is_empty() {
                result.ranges.push(piece);
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        result
    }

    /// Remove `r` from the set, splitting elements that straddle it.
    pub fn subtract_range(&mut self, r: TimeRange) {
        if r.is_empty() || self.ranges.is_empty() {
            return;
        }
        let lo = self.ranges.partition_point(|x| x.end <= r.start);
        let hi = self.ranges.partition_point(|x| x.start < r.end);
        if lo >= hi {
            return;
        }
        let mut keep: Vec<TimeRange> = Vec::with_capacity(2);
        let left = self.ranges[lo];
        if left.start < r.start {
            keep.push(TimeRange::new(left.start, r.start));
        }
        let right = self.ranges[hi - 1];
        if right.end > r.end {
            keep.push(TimeRange::new(r.end, right.end));
        }
        self.ranges.splice(lo..hi, keep);
    }

    pub fn subtract_set(&mut self, other: &RangeSet) {
        for r in &other.ranges {
            self.subtract_range(*r);
        }
    }

    /// Symmetric difference with a single range: the parts of `self` outside
    /// `r` plus the parts of `r` not in `self`.
    pub fn xor_range(&mut self, r: TimeRange) {
        if r.is_empty() {
            return;
        }
        let covered = self.intersect_range(&r);
        let mut gain = RangeSet::from(r);
        gain.subtract_set(&covered);
        self.subtract_range(r);
        self.union_with(&gain);
    }

    pub fn symmetric_difference(&mut self, other: &RangeSet) {
        let mut gain = other.clone();
        gain.subtract_set(&self.clone());
        self.subtract_set(other);
        self.union_with(&gain);
    }

    /// Returns true if `r` lies entirely within one element of the set.
    pub fn contains_range(&self, r: &TimeRange) -> bool {
        if r.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|x| x.end <= r.start);
        idx < self.ranges.len() && self.ranges[idx].contains_range(r)
    }

    pub fn contains_set(&self, other: &RangeSet) -> bool {
        other.ranges.iter().all(|r| self.contains_range(r))
    }
}

/// Merge successive ranges separated by a gap strictly smaller than
/// `min_gap` ms, so the result reads as fewer coarser ranges.
pub fn merge_gaps(set: &RangeSet, min_gap: Ms) -> RangeSet {
    let mut result = RangeSet::new();
    let mut current: Option<TimeRange> = None;
    for r in set.iter() {
        match current {
            Some(ref mut cur) if r.start - cur.end < min_gap => cur.end = r.end,
            Some(cur) => {
                result.insert(cur);
                current = Some(*r);
            }
            None => current = Some(*r),
        }
    }
    if let Some(cur) = current {
        result.insert(cur);
    }
    result
}

/// Split a range into consecutive sub-ranges of at most `step` ms; the
/// trailing sub-range may be shorter.
pub fn split_range(r: TimeRange, step: Ms) -> Vec<TimeRange> {
    debug_assert!(step > 0, "split step must be positive");
    let mut result = Vec::new();
    if r.is_empty() {
        return result;
    }
    let mut lower = r.start;
    while lower < r.end {
        let upper = (lower + step).min(r.end);
        result.push(TimeRange::new(lower, upper));
        lower = upper;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(Ms, Ms)]) -> RangeSet {
        let mut s = RangeSet::new();
        for &(a, b) in ranges {
            s.insert(TimeRange::new(a, b));
        }
        s
    }

    // ── TimeRange ────────────────────────────────────────────

    #[test]
    fn range_basics() {
        let r = TimeRange::new(100, 200);
        assert_eq!(r.duration_ms(), 100);
        assert!(r.contains_instant(100));
        assert!(r.contains_instant(199));
        assert!(!r.contains_instant(200)); // half-open
        assert!(!r.is_empty());
        assert!(TimeRange::new(5, 5).is_empty());
    }

    #[test]
    fn range_overlap_and_containment() {
        let a = TimeRange::new(100, 200);
        let b = TimeRange::new(150, 250);
        let c = TimeRange::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(TimeRange::new(0, 400).contains_range(&a));
        assert!(a.contains_range(&TimeRange::EMPTY));
        assert!(!a.contains_range(&b));
    }

    #[test]
    fn range_intersect() {
        let a = TimeRange::new(100, 200);
        assert_eq!(a.intersect(&TimeRange::new(150, 250)), TimeRange::new(150, 200));
        assert!(a.intersect(&TimeRange::new(200, 300)).is_empty());
        assert!(a.intersect(&TimeRange::EMPTY).is_empty());
    }

    #[test]
    fn range_hull() {
        let a = TimeRange::new(100, 200);
        let b = TimeRange::new(400, 500);
        assert_eq!(a.hull(&b), TimeRange::new(100, 500));
        assert_eq!(a.hull(&TimeRange::EMPTY), a);
        assert_eq!(TimeRange::EMPTY.hull(&b), b);
    }

    #[test]
    fn range_cut_left() {
        let r = TimeRange::new(100, 400);
        assert_eq!(r.cut_left(&TimeRange::new(50, 200)), TimeRange::new(200, 400));
        assert!(r.cut_left(&TimeRange::new(100, 400)).is_empty());
        assert_eq!(r.cut_left(&TimeRange::EMPTY), r);
        assert!(r.cut_left(&TimeRange::new(300, 500)).is_empty());
    }

    // ── RangeSet insert / merge ──────────────────────────────

    #[test]
    fn insert_keeps_order_and_merges_overlap() {
        let s = set(&[(300, 400), (100, 200), (150, 250)]);
        assert_eq!(s.to_vec(), vec![TimeRange::new(100, 250), TimeRange::new(300, 400)]);
    }

    #[test]
    fn insert_merges_adjacent() {
        let s = set(&[(100, 200), (200, 300)]);
        assert_eq!(s.to_vec(), vec![TimeRange::new(100, 300)]);
    }

    #[test]
    fn insert_bridges_both_sides() {
        let mut s = set(&[(0, 10), (20, 30)]);
        s.insert(TimeRange::new(10, 20));
        assert_eq!(s.to_vec(), vec![TimeRange::new(0, 30)]);
    }

    #[test]
    fn insert_empty_is_noop() {
        let mut s = set(&[(0, 10)]);
        s.insert(TimeRange::EMPTY);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn insert_swallows_many() {
        let mut s = set(&[(0, 10), (20, 30), (40, 50), (100, 110)]);
        s.insert(TimeRange::new(5, 45));
        assert_eq!(s.to_vec(), vec![TimeRange::new(0, 50), TimeRange::new(100, 110)]);
    }

    // ── intersection ─────────────────────────────────────────

    #[test]
    fn intersect_range_clamps() {
        let s = set(&[(0, 10), (20, 40), (60, 80)]);
        let out = s.intersect_range(&TimeRange::new(5, 70));
        assert_eq!(
            out.to_vec(),
            vec![TimeRange::new(5, 10), TimeRange::new(20, 40), TimeRange::new(60, 70)]
        );
    }

    #[test]
    fn intersect_set_two_pointer() {
        let a = set(&[(0, 10), (20, 40)]);
        let b = set(&[(5, 25), (30, 100)]);
        let out = a.intersect_set(&b);
        assert_eq!(
            out.to_vec(),
            vec![TimeRange::new(5, 10), TimeRange::new(20, 25), TimeRange::new(30, 40)]
        );
    }

    // ── subtraction ──────────────────────────────────────────

    #[test]
    fn subtract_middle_punch() {
        let mut s = set(&[(100, 300)]);
        s.subtract_range(TimeRange::new(150, 200));
        assert_eq!(s.to_vec(), vec![TimeRange::new(100, 150), TimeRange::new(200, 300)]);
    }

    #[test]
    fn subtract_spanning_several() {
        let mut s = set(&[(0, 100), (200, 300), (400, 500)]);
        s.subtract_range(TimeRange::new(50, 450));
        assert_eq!(s.to_vec(), vec![TimeRange::new(0, 50), TimeRange::new(450, 500)]);
    }

    #[test]
    fn subtract_adjacent_untouched() {
        let mut s = set(&[(100, 200), (300, 400)]);
        s.subtract_range(TimeRange::new(200, 300));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn subtract_set_removes_pieces() {
        let mut s = set(&[(0, 1000)]);
        s.subtract_set(&set(&[(100, 200), (400, 500)]));
        assert_eq!(
            s.to_vec(),
            vec![
                TimeRange::new(0, 100),
                TimeRange::new(200, 400),
                TimeRange::new(500, 1000)
            ]
        );
    }

    // ── symmetric difference ─────────────────────────────────

    #[test]
    fn xor_range_inverts_within() {
        // Flipping a superset range yields exactly the uncovered parts.
        let mut s = set(&[(10, 20), (30, 40)]);
        s.xor_range(TimeRange::new(0, 50));
        assert_eq!(
            s.to_vec(),
            vec![TimeRange::new(0, 10), TimeRange::new(20, 30), TimeRange::new(40, 50)]
        );
    }

    #[test]
    fn xor_range_partial_overlap() {
        let mut s = set(&[(10, 30)]);
        s.xor_range(TimeRange::new(20, 40));
        assert_eq!(s.to_vec(), vec![TimeRange::new(10, 20), TimeRange::new(30, 40)]);
    }

    #[test]
    fn symmetric_difference_sets() {
        let mut a = set(&[(0, 10), (20, 30)]);
        a.symmetric_difference(&set(&[(5, 25)]));
        assert_eq!(
            a.to_vec(),
            vec![TimeRange::new(0, 5), TimeRange::new(10, 20), TimeRange::new(25, 30)]
        );
    }

    // ── containment / hull ───────────────────────────────────

    #[test]
    fn contains_range_within_one_element() {
        let s = set(&[(0, 10), (20, 40)]);
        assert!(s.contains_range(&TimeRange::new(25, 35)));
        assert!(!s.contains_range(&TimeRange::new(5, 25)));
        assert!(s.contains_range(&TimeRange::EMPTY));
    }

    #[test]
    fn contains_set_all_pieces() {
        let s = set(&[(0, 10), (20, 40)]);
        assert!(s.contains_set(&set(&[(2, 8), (21, 39)])));
        assert!(!s.contains_set(&set(&[(2, 8), (15, 25)])));
    }

    #[test]
    fn hull_spans_set() {
        assert_eq!(set(&[(5, 10), (90, 100)]).hull(), TimeRange::new(5, 100));
        assert!(RangeSet::new().hull().is_empty());
    }

    // ── merge_gaps / split_range ─────────────────────────────

    #[test]
    fn merge_gaps_closes_small_gaps() {
        let s = set(&[(100, 140), (160, 170), (210, 220), (240, 250), (260, 270), (320, 330)]);
        let merged = merge_gaps(&s, 30);
        assert_eq!(
            merged.to_vec(),
            vec![
                TimeRange::new(100, 170),
                TimeRange::new(210, 270),
                TimeRange::new(320, 330)
            ]
        );
    }

    #[test]
    fn merge_gaps_exact_gap_not_merged() {
        let s = set(&[(0, 10), (40, 50)]);
        // A gap of exactly min_gap stays open.
        assert_eq!(merge_gaps(&s, 30).len(), 2);
        assert_eq!(merge_gaps(&s, 31).len(), 1);
    }

    #[test]
    fn split_range_steps() {
        let parts = split_range(TimeRange::new(0, 250), 100);
        assert_eq!(
            parts,
            vec![
                TimeRange::new(0, 100),
                TimeRange::new(100, 200),
                TimeRange::new(200, 250)
            ]
        );
        assert!(split_range(TimeRange::EMPTY, 100).is_empty());
        assert_eq!(split_range(TimeRange::new(0, 50), 100), vec![TimeRange::new(0, 50)]);
    }
}
