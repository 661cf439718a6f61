//! Maps irregular device frames onto a fixed output rate.
//!
//! All times are host clock ticks (100 ns). The pacer never looks at the
//! device; it only decides whether to wait before the next sample, whether
//! frames were missed, and what timestamps the sample carries.

use std::time::Duration;

use crate::capture::frame::{ticks_to_duration, UNITS};

/// Waits shorter than this are skipped
pub const MIN_WAIT: i64 = UNITS / 1000;

/// Decision and timestamps for one output sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedFrame {
    /// Time to sleep before producing the sample
    pub wait: Option<Duration>,
    pub start: i64,
    pub end: i64,
    /// The timeline was re-anchored because frames were missed
    pub discontinuity: bool,
    /// Frames newly counted as dropped by this decision
    pub newly_dropped: u64,
}

#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: i64,
    start: Option<i64>,
    stream_time: i64,
    dropped_time: i64,
    frame_count: u64,
    dropped_count: u64,
}

impl FramePacer {
    /// `interval` is the average time per frame, in ticks
    pub fn new(interval: i64) -> Self {
        Self {
            interval: interval.max(1),
            start: None,
            stream_time: 0,
            dropped_time: 0,
            frame_count: 0,
            dropped_count: 0,
        }
    }

    /// Forget the run; the next frame starts a new timeline
    pub fn reset(&mut self) {
        *self = Self::new(self.interval);
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Plan the next sample for a clock reading of `now`
    pub fn next_frame(&mut self, now: i64) -> PacedFrame {
        let start = *self.start.get_or_insert(now);
        if self.frame_count == 0 {
            self.dropped_time = 0;
        }

        let elapsed_target = self.frame_count as i64 * self.interval;
        let delta = (now - start) - elapsed_target;

        let mut wait = None;
        let mut discontinuity = false;
        let mut newly_dropped = 0;

        if delta < self.dropped_time {
            // ahead of schedule
            let ahead = self.dropped_time - delta;
            if ahead >= MIN_WAIT {
                wait = Some(ticks_to_duration(ahead));
            }
        } else if (delta / self.interval) as u64 > self.dropped_count {
            let dropped = (delta / self.interval) as u64;
            newly_dropped = dropped - self.dropped_count;
            self.dropped_count = dropped;
            self.dropped_time = dropped as i64 * self.interval;
            self.stream_time = now - start;
            discontinuity = true;
        }

        let frame = PacedFrame {
            wait,
            start: self.stream_time,
            end: self.stream_time + self.interval,
            discontinuity,
            newly_dropped,
        };

        self.stream_time += self.interval;
        self.frame_count += 1;
        frame
    }
}
