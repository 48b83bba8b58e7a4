//! Mining difficulty ("work") and its rolling 24 hour history
//!
//! Work is the largest acceptable 48-bit digest prefix, so lower work means a
//! harder target. It is retargeted after every accepted block from the time
//! the block took relative to the target block time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Minutes in the trailing window reported by [`WorkTracker::work_over_time`].
pub const WORK_HISTORY_MINUTES: usize = 1440;

/// Largest value a 12 hex character digest prefix can take.
pub const MAX_DIGEST_VALUE: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSample {
    pub minute: DateTime<Utc>,
    pub work: u64,
}

/// Truncate to the start of the minute.
pub fn minute_of(time: DateTime<Utc>) -> DateTime<Utc> {
    let secs = time.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(time)
}

/// Computes the next work value from the current one and the time the last
/// block took. Implementations must be pure.
pub trait RetargetPolicy: Send + Sync + std::fmt::Debug {
    fn next_work(&self, current: u64, elapsed: Duration) -> u64;
}

/// Moves work proportionally to how far the solve time was from target,
/// limited to `work_factor` per target-length of deviation and to four
/// targets in total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionalRetarget {
    pub seconds_per_block: u64,
    pub work_factor: f64,
    pub min_work: u64,
    pub max_work: u64,
}

impl Default for ProportionalRetarget {
    fn default() -> Self {
        Self {
            seconds_per_block: 300,
            work_factor: 0.025,
            min_work: 1,
            max_work: 100_000,
        }
    }
}

const MAX_SOLVE_RATIO: f64 = 4.0;

impl RetargetPolicy for ProportionalRetarget {
    fn next_work(&self, current: u64, elapsed: Duration) -> u64 {
        let target = self.seconds_per_block.max(1) as f64;
        let ratio = (elapsed.as_secs_f64() / target).clamp(0.0, MAX_SOLVE_RATIO);
        let work = current as f64;
        let next = (work + work * self.work_factor * (ratio - 1.0)).round();
        let next = if next.is_finite() && next > 0.0 { next as u64 } else { 0 };
        next.clamp(self.min_work, self.max_work)
    }
}

#[derive(Debug)]
struct WorkState {
    work: u64,
    samples: VecDeque<WorkSample>,
}

#[derive(Debug)]
pub struct WorkTracker {
    state: Mutex<WorkState>,
    policy: Box<dyn RetargetPolicy>,
}

impl WorkTracker {
    pub fn new(initial_work: u64, policy: Box<dyn RetargetPolicy>) -> Self {
        Self::with_samples(initial_work, Vec::new(), policy)
    }

    /// Restore from stored samples; they are sorted and deduplicated by minute.
    pub fn with_samples(work: u64, mut samples: Vec<WorkSample>, policy: Box<dyn RetargetPolicy>) -> Self {
        samples.sort_by_key(|s| s.minute);
        samples.dedup_by_key(|s| s.minute);
        let mut samples: VecDeque<WorkSample> = samples.into();
        while samples.len() > WORK_HISTORY_MINUTES {
            samples.pop_front();
        }
        Self {
            state: Mutex::new(WorkState { work, samples }),
            policy,
        }
    }

    pub fn current_work(&self) -> u64 {
        self.state.lock().work
    }

    pub fn set_work(&self, work: u64) {
        self.state.lock().work = work;
    }

    /// The work that would follow a block solved after `elapsed`.
    pub fn next_work(&self, current: u64, elapsed: Duration) -> u64 {
        self.policy.next_work(current, elapsed)
    }

    /// The sample `record_sample(now, work)` would append, if any.
    pub fn sample_for(&self, now: DateTime<Utc>, work: u64) -> Option<WorkSample> {
        let minute = minute_of(now);
        let state = self.state.lock();
        match state.samples.back() {
            Some(last) if last.minute >= minute => None,
            _ => Some(WorkSample { minute, work }),
        }
    }

    /// Append a minute-aligned sample; the first sample of a minute wins.
    /// Returns the sample when one was appended.
    pub fn record_sample(&self, now: DateTime<Utc>, work: u64) -> Option<WorkSample> {
        let minute = minute_of(now);
        let mut state = self.state.lock();
        if state.samples.back().is_some_and(|last| last.minute >= minute) {
            return None;
        }
        let sample = WorkSample { minute, work };
        state.samples.push_back(sample);
        let cutoff = minute - ChronoDuration::minutes(WORK_HISTORY_MINUTES as i64 - 1);
        while state.samples.front().is_some_and(|s| s.minute < cutoff) {
            state.samples.pop_front();
        }
        Some(sample)
    }

    pub fn samples(&self) -> Vec<WorkSample> {
        self.state.lock().samples.iter().copied().collect()
    }

    /// One value per minute for the trailing 24 hours ending at `now`,
    /// oldest first. Minutes without a sample repeat the previous value.
    pub fn work_over_time(&self, now: DateTime<Utc>) -> Vec<u64> {
        let state = self.state.lock();
        let end = minute_of(now);
        let start = end - ChronoDuration::minutes(WORK_HISTORY_MINUTES as i64 - 1);

        let mut in_window = state
            .samples
            .iter()
            .filter(|s| s.minute >= start && s.minute <= end)
            .peekable();
        let before_window = state.samples.iter().filter(|s| s.minute < start).last();
        let mut last = before_window
            .or_else(|| state.samples.iter().find(|s| s.minute >= start && s.minute <= end))
            .map(|s| s.work)
            .unwrap_or(state.work);

        let mut out = Vec::with_capacity(WORK_HISTORY_MINUTES);
        for i in 0..WORK_HISTORY_MINUTES {
            let minute = start + ChronoDuration::minutes(i as i64);
            while let Some(sample) = in_window.peek() {
                if sample.minute > minute {
                    break;
                }
                last = sample.work;
                in_window.next();
            }
            out.push(last);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker(work: u64) -> WorkTracker {
        WorkTracker::new(work, Box::new(ProportionalRetarget::default()))
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_retarget_moves_with_solve_time() {
        let policy = ProportionalRetarget::default();
        assert_eq!(policy.next_work(18_750, Duration::from_secs(300)), 18_750);
        // Instant solve: 2.5% harder.
        assert_eq!(policy.next_work(18_750, Duration::from_secs(0)), 18_281);
        // Slow solve is capped at four targets: 7.5% easier.
        assert_eq!(policy.next_work(18_750, Duration::from_secs(1200)), 20_156);
        assert_eq!(policy.next_work(18_750, Duration::from_secs(100_000)), 20_156);
    }

    #[test]
    fn test_retarget_is_bounded() {
        let policy = ProportionalRetarget::default();
        assert_eq!(policy.next_work(100_000, Duration::from_secs(3600)), 100_000);
        assert_eq!(policy.next_work(1, Duration::from_secs(0)), 1);
    }

    #[test]
    fn test_one_sample_per_minute() {
        let work = tracker(100);
        assert!(work.record_sample(at(10, 0, 5), 100).is_some());
        assert!(work.record_sample(at(10, 0, 59), 90).is_none());
        assert!(work.sample_for(at(10, 0, 30), 80).is_none());
        assert!(work.sample_for(at(10, 1, 0), 80).is_some());
        let samples = work.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].minute, at(10, 0, 0));
        assert_eq!(samples[0].work, 100);
    }

    #[test]
    fn test_old_samples_are_evicted() {
        let work = tracker(100);
        let start = at(0, 0, 0);
        for i in 0..1500 {
            work.record_sample(start + ChronoDuration::minutes(i), i as u64);
        }
        let samples = work.samples();
        assert_eq!(samples.len(), WORK_HISTORY_MINUTES);
        assert_eq!(samples[0].work, 60);
    }

    #[test]
    fn test_work_over_time_fills_gaps() {
        let work = tracker(500);
        let now = at(12, 0, 30);
        work.record_sample(now - ChronoDuration::minutes(10), 100);
        work.record_sample(now - ChronoDuration::minutes(5), 200);

        let series = work.work_over_time(now);
        assert_eq!(series.len(), WORK_HISTORY_MINUTES);
        // Leading minutes take the first known value.
        assert_eq!(series[0], 100);
        assert_eq!(series[WORK_HISTORY_MINUTES - 11], 100);
        assert_eq!(series[WORK_HISTORY_MINUTES - 7], 100);
        assert_eq!(series[WORK_HISTORY_MINUTES - 6], 200);
        assert_eq!(series[WORK_HISTORY_MINUTES - 1], 200);
    }

    #[test]
    fn test_work_over_time_without_samples_uses_current_work() {
        let work = tracker(777);
        let series = work.work_over_time(Utc::now());
        assert_eq!(series.len(), WORK_HISTORY_MINUTES);
        assert!(series.iter().all(|w| *w == 777));
    }

    #[test]
    fn test_work_over_time_carries_value_from_before_window() {
        let now = at(12, 0, 0);
        let stale = WorkSample {
            minute: now - ChronoDuration::minutes(3000),
            work: 42,
        };
        let work = WorkTracker::with_samples(9, vec![stale], Box::new(ProportionalRetarget::default()));
        let series = work.work_over_time(now);
        assert!(series.iter().all(|w| *w == 42));
    }
}
