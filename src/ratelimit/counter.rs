//! Sliding window bucket counter.

use std::collections::VecDeque;
use std::fmt::{self, Write};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Width of the fill bar rendered by [`BucketCounter::write_status`].
const STATUS_BAR_WIDTH: u64 = 20;

/// Mutable part of a counter, guarded by the counter's lock.
#[derive(Debug)]
struct WindowState {
    /// Maximum admitted events per bucket
    limit: u64,
    /// Id of the oldest tracked bucket
    min_bucket_id: i64,
    /// `counts[i]` belongs to bucket `min_bucket_id + i`; length never changes
    counts: VecDeque<u64>,
    /// Wall-clock time of the last `allow` call
    last_touched: DateTime<Utc>,
}

/// A rate counter covering `window_size` consecutive buckets of
/// `bucket_span_secs` seconds each.
///
/// Every bucket admits at most `limit` events. Events are placed by their own
/// timestamp, so late events still count against the bucket they belong to as
/// long as that bucket is tracked. Events newer than the newest bucket slide the
/// window forward, discarding the oldest buckets for good.
#[derive(Debug)]
pub struct BucketCounter {
    bucket_span_secs: u64,
    state: Mutex<WindowState>,
}

impl BucketCounter {
    /// Create a counter whose newest bucket is the one containing `reference`.
    ///
    /// `bucket_span_secs` and `window_size` must be positive.
    pub fn new(
        bucket_span_secs: u64,
        limit: u64,
        window_size: u64,
        reference: DateTime<Utc>,
    ) -> Self {
        debug_assert!(bucket_span_secs > 0 && window_size > 0);

        let counts: VecDeque<u64> = std::iter::repeat(0).take(window_size as usize).collect();
        let min_bucket_id = bucket_id(reference, bucket_span_secs) - window_size as i64 + 1;

        Self {
            bucket_span_secs,
            state: Mutex::new(WindowState {
                limit,
                min_bucket_id,
                counts,
                last_touched: Utc::now(),
            }),
        }
    }

    /// Record an event at `t`; returns `true` if it is admitted.
    pub fn allow(&self, t: DateTime<Utc>) -> bool {
        self.allow_at(t, Utc::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit wall-clock `now`.
    pub(crate) fn allow_at(&self, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let index = bucket_id(t, self.bucket_span_secs);

        let mut state = self.state.lock();
        state.last_touched = now;

        if index < state.min_bucket_id {
            // Bucket already fell out of the window.
            return false;
        }

        let len = state.counts.len() as i64;
        let max_bucket_id = state.min_bucket_id + len - 1;
        if index > max_bucket_id {
            let shift = index - max_bucket_id;
            if shift >= len {
                state.counts.iter_mut().for_each(|c| *c = 0);
            } else {
                for _ in 0..shift {
                    state.counts.pop_front();
                    state.counts.push_back(0);
                }
            }
            state.min_bucket_id += shift;
        }

        let slot = (index - state.min_bucket_id) as usize;
        let limit = state.limit;
        let count = &mut state.counts[slot];
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Replace the per-bucket limit. Counts already recorded are kept and
    /// judged against the new limit from the next `allow` on.
    pub fn set_limit(&self, limit: u64) {
        self.state.lock().limit = limit;
    }

    pub fn limit(&self) -> u64 {
        self.state.lock().limit
    }

    pub fn bucket_span_secs(&self) -> u64 {
        self.bucket_span_secs
    }

    pub fn window_size(&self) -> u64 {
        self.state.lock().counts.len() as u64
    }

    pub fn min_bucket_id(&self) -> i64 {
        self.state.lock().min_bucket_id
    }

    /// Mark the counter as used at `now` without recording an event.
    pub(crate) fn touch(&self, now: DateTime<Utc>) {
        self.state.lock().last_touched = now;
    }

    /// Wall-clock time of the last `allow`, or the creation time if none yet.
    pub fn last_touched(&self) -> DateTime<Utc> {
        self.state.lock().last_touched
    }

    /// Count recorded for the bucket containing `t`, if that bucket is tracked.
    pub fn count_at(&self, t: DateTime<Utc>) -> Option<u64> {
        let index = bucket_id(t, self.bucket_span_secs);
        let state = self.state.lock();
        let offset = index.checked_sub(state.min_bucket_id)?;
        if offset < 0 {
            return None;
        }
        state.counts.get(offset as usize).copied()
    }

    /// Render one line per bucket, oldest first:
    /// `#<bucket start>: [<fill bar>] <count>/<limit>`.
    pub fn write_status<W: Write>(&self, w: &mut W) -> fmt::Result {
        let state = self.state.lock();

        for (i, count) in state.counts.iter().enumerate() {
            let id = state.min_bucket_id + i as i64;
            match bucket_start(id, self.bucket_span_secs) {
                Some(start) => write!(w, "#{}: ", start)?,
                None => write!(w, "#bucket {}: ", id)?,
            }
            write_bar(w, *count, state.limit, STATUS_BAR_WIDTH)?;
            writeln!(w, " {}/{}", count, state.limit)?;
        }
        Ok(())
    }

    /// [`write_status`](Self::write_status) into a fresh string.
    pub fn status(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_status(&mut out);
        out
    }
}

/// Bucket id of `t`: seconds since the epoch divided by the span, floored.
pub(crate) fn bucket_id(t: DateTime<Utc>, bucket_span_secs: u64) -> i64 {
    t.timestamp().div_euclid(bucket_span_secs as i64)
}

/// Start time of bucket `id`.
fn bucket_start(id: i64, bucket_span_secs: u64) -> Option<DateTime<Utc>> {
    let secs = id.checked_mul(bucket_span_secs as i64)?;
    DateTime::from_timestamp(secs, 0)
}

/// `[####____]` with `floor(current / limit * width)` filled cells.
fn write_bar<W: Write>(w: &mut W, current: u64, limit: u64, width: u64) -> fmt::Result {
    let filled = if limit == 0 {
        if current > 0 {
            width
        } else {
            0
        }
    } else {
        (current.saturating_mul(width) / limit).min(width)
    };

    w.write_char('[')?;
    for i in 0..width {
        w.write_char(if i < filled { '#' } else { '_' })?;
    }
    w.write_char(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 12, 19, 19, 30, 25).unwrap()
    }

    #[test]
    fn test_current_bucket_overflow() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);

        assert!(counter.allow(now));
        assert!(counter.allow(now));
        assert!(!counter.allow(now), "bucket must be exceeded");
    }

    #[test]
    fn test_raise_limit_after_saturation() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);

        assert!(counter.allow(now));
        assert!(counter.allow(now));
        assert!(!counter.allow(now));

        counter.set_limit(3);
        assert!(counter.allow(now));
        assert!(!counter.allow(now), "bucket must be exceeded");
        assert_eq!(counter.limit(), 3);
    }

    #[test]
    fn test_lower_limit_rejects_immediately() {
        let now = reference();
        let counter = BucketCounter::new(60, 5, 5, now);

        for _ in 0..3 {
            assert!(counter.allow(now));
        }
        counter.set_limit(2);
        assert!(!counter.allow(now));
        assert_eq!(counter.count_at(now), Some(3));
    }

    #[test]
    fn test_set_limit_keeps_window() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);
        let min_before = counter.min_bucket_id();

        counter.set_limit(10);
        assert_eq!(counter.min_bucket_id(), min_before);
        assert_eq!(counter.bucket_span_secs(), 60);
        assert_eq!(counter.window_size(), 5);
    }

    #[test]
    fn test_add_to_oldest_bucket() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);
        let oldest = now - Duration::minutes(4);

        assert!(counter.allow(oldest));
        assert!(counter.allow(oldest));
        assert!(!counter.allow(oldest));
    }

    #[test]
    fn test_older_than_window_rejected() {
        let now = reference();
        let counter = BucketCounter::new(60, 100, 5, now);

        assert!(!counter.allow(now - Duration::minutes(5)));
        assert_eq!(counter.count_at(now - Duration::minutes(5)), None);
    }

    #[test]
    fn test_old_bucket_shifts_out() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);
        let oldest = now - Duration::minutes(4);

        assert!(counter.allow(now + Duration::minutes(1)));
        assert!(!counter.allow(oldest), "oldest bucket must be shifted");
        assert_eq!(counter.window_size(), 5);
    }

    #[test]
    fn test_slide_keeps_recent_counts() {
        let now = reference();
        let counter = BucketCounter::new(60, 2, 5, now);

        assert!(counter.allow(now));
        assert!(counter.allow(now));
        assert!(counter.allow(now + Duration::minutes(2)));

        // The original bucket is still inside the window and still full.
        assert!(!counter.allow(now));
        assert_eq!(counter.count_at(now), Some(2));
        assert_eq!(counter.count_at(now + Duration::minutes(2)), Some(1));
    }

    #[test]
    fn test_far_jump_resets_every_bucket() {
        let now = reference();
        let counter = BucketCounter::new(60, 1, 3, now);

        assert!(counter.allow(now));
        assert!(counter.allow(now - Duration::minutes(1)));

        let later = now + Duration::minutes(10);
        assert!(counter.allow(later));
        assert_eq!(counter.window_size(), 3);
        assert_eq!(counter.count_at(later - Duration::minutes(1)), Some(0));
        assert_eq!(counter.count_at(later - Duration::minutes(2)), Some(0));
        assert!(counter.allow(later - Duration::minutes(2)));
    }

    #[test]
    fn test_min_bucket_id_only_grows() {
        let now = reference();
        let counter = BucketCounter::new(60, 10, 3, now);
        let start = counter.min_bucket_id();

        counter.allow(now + Duration::minutes(1));
        let after_slide = counter.min_bucket_id();
        assert_eq!(after_slide, start + 1);

        counter.allow(now - Duration::minutes(1));
        assert_eq!(counter.min_bucket_id(), after_slide);
    }

    #[test]
    fn test_rejected_calls_touch_counter() {
        let now = reference();
        let counter = BucketCounter::new(60, 0, 2, now);
        let touched = Utc::now() + Duration::hours(1);

        assert!(!counter.allow_at(now, touched));
        assert_eq!(counter.last_touched(), touched);

        let later = touched + Duration::seconds(5);
        assert!(!counter.allow_at(now - Duration::hours(1), later));
        assert_eq!(counter.last_touched(), later);
    }

    #[test]
    fn test_touch_keeps_counts() {
        let now = reference();
        let counter = BucketCounter::new(60, 1, 2, now);
        assert!(counter.allow_at(now, now));

        let later = Utc::now() + Duration::hours(2);
        counter.touch(later);
        assert_eq!(counter.last_touched(), later);
        assert_eq!(counter.count_at(now), Some(1));
    }

    #[test]
    fn test_negative_timestamps_floor() {
        let t = Utc.timestamp_opt(-1, 0).unwrap();
        assert_eq!(bucket_id(t, 60), -1);
        assert_eq!(bucket_id(Utc.timestamp_opt(59, 0).unwrap(), 60), 0);
    }

    #[test]
    fn test_write_status() {
        let t = reference();
        let counter = BucketCounter::new(60, 2, 2, t);
        counter.allow(t);

        assert_eq!(
            counter.status(),
            "#2018-12-19 19:29:00 UTC: [____________________] 0/2\n\
             #2018-12-19 19:30:00 UTC: [##########__________] 1/2\n"
        );
    }

    #[test]
    fn test_bar() {
        let mut out = String::new();
        write_bar(&mut out, 3, 5, 10).unwrap();
        assert_eq!(out, "[######____]");
    }

    #[test]
    fn test_bar_saturates() {
        let mut out = String::new();
        write_bar(&mut out, 7, 5, 4).unwrap();
        assert_eq!(out, "[####]");

        let mut out = String::new();
        write_bar(&mut out, 0, 0, 4).unwrap();
        assert_eq!(out, "[____]");
    }
}
