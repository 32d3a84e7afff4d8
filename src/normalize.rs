use crate::model::{Ms, TimeRange};

pub const HOUR_MS: Ms = 60 * 60 * 1000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

fn floor_to(t: Ms, unit: Ms) -> Ms {
    t - t.rem_euclid(unit)
}

/// Widen a requested range to whole UTC hour or day boundaries. Absorbs
/// near-identical requests into the same device query so the cache can
/// answer the next slightly-shifted request without asking again.
///
/// Requests shorter than an hour widen to the enclosing hour boundaries;
/// everything else (and every calendar request) widens to day boundaries.
pub fn normalize(requested: TimeRange, for_calendar: bool) -> TimeRange {
    if requested.duration_ms() < HOUR_MS && !for_calendar {
        let start = floor_to(requested.start, HOUR_MS);
        let end = floor_to(requested.end, HOUR_MS) + HOUR_MS;
        return TimeRange::new(start, end);
    }
    let start = floor_to(requested.start, DAY_MS);
    let end = floor_to(requested.end, DAY_MS) + DAY_MS;
    TimeRange::new(start, end)
}

/// Pad a short range symmetrically up to `target_len`. The lower bound is
/// clamped at zero; the upper bound never passes `now + overhead` (but is
/// never pulled below the original bound either). Ranges already at least
/// `target_len` long are returned unchanged.
pub fn round_to(requested: TimeRange, target_len: Ms, now: Ms, overhead: Ms) -> TimeRange {
    if requested.duration_ms() >= target_len {
        return requested;
    }
    let adjust = (target_len - requested.duration_ms()) / 2;
    let start = (requested.start - adjust).max(0);
    let end = (requested.end + adjust).min(now + overhead).max(requested.end);
    TimeRange::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_request_rounds_to_hour() {
        // 05:35:22..06:35:22 is exactly an hour, so just under it rounds to
        // the enclosing hour boundaries.
        let r = TimeRange::new(5 * HOUR_MS + 35 * 60_000, 6 * HOUR_MS + 12 * 60_000);
        assert_eq!(normalize(r, false), TimeRange::new(5 * HOUR_MS, 7 * HOUR_MS));
    }

    #[test]
    fn sub_hour_request_within_one_hour() {
        let r = TimeRange::new(14 * HOUR_MS + 11 * 60_000, 14 * HOUR_MS + 12 * 60_000);
        assert_eq!(normalize(r, false), TimeRange::new(14 * HOUR_MS, 15 * HOUR_MS));
    }

    #[test]
    fn long_request_rounds_to_days() {
        let r = TimeRange::new(DAY_MS + 5 * HOUR_MS, DAY_MS + 9 * HOUR_MS);
        assert_eq!(normalize(r, false), TimeRange::new(DAY_MS, 2 * DAY_MS));
    }

    #[test]
    fn several_days_round_to_day_after_end() {
        let r = TimeRange::new(0, 3 * DAY_MS + 6 * HOUR_MS);
        assert_eq!(normalize(r, false), TimeRange::new(0, 4 * DAY_MS));
    }

    #[test]
    fn calendar_always_rounds_to_days() {
        let r = TimeRange::new(2 * HOUR_MS, 3 * HOUR_MS);
        assert_eq!(normalize(r, true), TimeRange::new(0, DAY_MS));
    }

    #[test]
    fn round_to_pads_symmetrically() {
        let now = 100 * HOUR_MS;
        let r = TimeRange::new(10 * HOUR_MS, 10 * HOUR_MS + 600_000);
        let rounded = round_to(r, HOUR_MS, now, 10_000);
        assert_eq!(rounded.duration_ms(), HOUR_MS);
        assert_eq!(rounded.start, 10 * HOUR_MS - (HOUR_MS - 600_000) / 2);
    }

    #[test]
    fn round_to_leaves_long_ranges_alone() {
        let r = TimeRange::new(0, 2 * HOUR_MS);
        assert_eq!(round_to(r, HOUR_MS, 100 * HOUR_MS, 10_000), r);
    }

    #[test]
    fn round_to_clamps_at_zero() {
        let r = TimeRange::new(100, 200);
        let rounded = round_to(r, HOUR_MS, 100 * HOUR_MS, 10_000);
        assert_eq!(rounded.start, 0);
    }

    #[test]
    fn round_to_clamps_near_now() {
        let now = 1_000_000;
        let r = TimeRange::new(now - 500, now);
        let rounded = round_to(r, HOUR_MS, now, 10_000);
        assert_eq!(rounded.end, now + 10_000);
        assert!(rounded.start <= r.start);
    }

    #[test]
    fn round_to_never_shrinks_future_bound() {
        // A request already past now + overhead keeps its upper bound.
        let now = 1_000_000;
        let r = TimeRange::new(now + 50_000, now + 51_000);
        let rounded = round_to(r, HOUR_MS, now, 10_000);
        assert_eq!(rounded.end, r.end);
    }
}
