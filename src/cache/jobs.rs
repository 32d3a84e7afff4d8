use tokio::time::Instant;

use crate::model::{RangeSet, TimeRange};

/// Search-job priority. Lower runs first: user-facing gaps beat the
/// normalizer's widened window, which beats background refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobKind {
    User = 0,
    Normalizer = 1,
    UpdateCache = 2,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::User => "user",
            JobKind::Normalizer => "normalizer",
            JobKind::UpdateCache => "update_cache",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchJob {
    pub range: TimeRange,
    pub kind: JobKind,
    pub created_at: Instant,
}

impl SearchJob {
    fn key(&self) -> (JobKind, Instant) {
        (self.kind, self.created_at)
    }
}

/// Pending search jobs, ordered by `(kind, created_at)` — FIFO within a
/// kind. Overlapping insertions merge into one job covering the hull with
/// the strongest kind; a derived union of all queued ranges is kept so the
/// cache can tell what is already spoken for.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<SearchJob>,
    union: RangeSet,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Union of every queued range.
    pub fn union(&self) -> &RangeSet {
        &self.union
    }

    /// Creation time of the job that would run next.
    pub fn front_created_at(&self) -> Option<Instant> {
        self.jobs.first().map(|j| j.created_at)
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.union.clear();
    }

    /// Queue a range for searching.
    ///
    /// A range already covered by a queued job only upgrades that job's kind
    /// when the new kind is stronger. A range overlapping queued jobs
    /// replaces them with one job over the combined hull, keeping the
    /// earliest creation time and the strongest kind involved.
    pub fn insert(&mut self, range: TimeRange, kind: JobKind) {
        if range.is_empty() {
            return;
        }

        if let Some(pos) = self.jobs.iter().position(|j| j.range.contains_range(&range)) {
            if self.jobs[pos].kind > kind {
                let mut upgraded = self.jobs.remove(pos);
                upgraded.kind = kind;
                upgraded.created_at = Instant::now();
                self.insert_sorted(upgraded);
            }
            return;
        }

        let mut merged = range;
        let mut strongest = kind;
        let mut earliest: Option<Instant> = None;
        let mut i = 0;
        while i < self.jobs.len() {
            if self.jobs[i].range.overlaps(&merged) {
                let removed = self.jobs.remove(i);
                merged = merged.hull(&removed.range);
                strongest = strongest.min(removed.kind);
                earliest = Some(earliest.map_or(removed.created_at, |e| e.min(removed.created_at)));
            } else {
                i += 1;
            }
        }

        let job = SearchJob {
            range: merged,
            kind: strongest,
            created_at: earliest.unwrap_or_else(Instant::now),
        };
        self.insert_sorted(job);
    }

    /// Remove and return the highest-priority job.
    pub fn pop(&mut self) -> Option<SearchJob> {
        if self.jobs.is_empty() {
            return None;
        }
        let job = self.jobs.remove(0);
        self.rebuild_union();
        Some(job)
    }

    fn insert_sorted(&mut self, job: SearchJob) {
        let pos = self.jobs.partition_point(|j| j.key() <= job.key());
        self.jobs.insert(pos, job);
        self.rebuild_union();
    }

    fn rebuild_union(&mut self) {
        self.union.clear();
        for job in &self.jobs {
            self.union.insert(job.range);
        }
    }
}
