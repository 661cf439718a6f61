//! Running mean over the most recent focus points

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::frame::FocusPoint;

/// Samples averaged by the smoother
pub const FOCUS_HISTORY: usize = 30;

/// Damps per-frame tracking jitter. Outlives device connections so a
/// reconnect does not make the crop jump.
pub struct FocusSmoother {
    history: HeapRb<FocusPoint>,
}

impl FocusSmoother {
    pub fn new() -> Self {
        Self {
            history: HeapRb::new(FOCUS_HISTORY),
        }
    }

    /// Record a sample, overwriting the oldest when full, and return the
    /// mean of everything recorded
    pub fn push(&mut self, point: FocusPoint) -> FocusPoint {
        self.history.push_overwrite(point);
        self.mean().unwrap_or(point)
    }

    pub fn mean(&self) -> Option<FocusPoint> {
        let count = self.history.occupied_len() as i64;
        if count == 0 {
            return None;
        }

        let (sx, sy) = self
            .history
            .iter()
            .fold((0i64, 0i64), |(sx, sy), p| (sx + i64::from(p.x), sy + i64::from(p.y)));
        Some(FocusPoint::new((sx / count) as i32, (sy / count) as i32))
    }

    pub fn len(&self) -> usize {
        self.history.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for FocusSmoother {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn mean_covers_only_populated_entries() {
        let mut smoother = FocusSmoother::new();
        assert_eq!(smoother.mean(), None);

        assert_eq!(smoother.push(FocusPoint::new(10, 20)), FocusPoint::new(10, 20));
        assert_eq!(smoother.push(FocusPoint::new(20, 40)), FocusPoint::new(15, 30));
        assert_eq!(smoother.len(), 2);
    }

    #[test]
    fn constant_input_converges_within_window() {
        let mut smoother = FocusSmoother::new();
        for _ in 0..FOCUS_HISTORY {
            smoother.push(FocusPoint::new(-500, 900));
        }

        let target = FocusPoint::new(640, 360);
        let mut out = FocusPoint::default();
        for _ in 0..FOCUS_HISTORY {
            out = smoother.push(target);
        }
        assert_eq!(out, target);
        assert_eq!(smoother.len(), FOCUS_HISTORY);
    }

    #[test]
    fn clear_forgets_history() {
        let mut smoother = FocusSmoother::new();
        smoother.push(FocusPoint::new(1, 1));
        smoother.clear();
        assert!(smoother.is_empty());
        assert_eq!(smoother.push(FocusPoint::new(7, 9)), FocusPoint::new(7, 9));
    }

    proptest! {
        #[test]
        fn output_stays_in_bounding_box_of_window(
            points in prop::collection::vec((-4000i32..4000, -4000i32..4000), 1..100)
        ) {
            let mut smoother = FocusSmoother::new();
            for (i, &(x, y)) in points.iter().enumerate() {
                let out = smoother.push(FocusPoint::new(x, y));

                let window = &points[(i + 1).saturating_sub(FOCUS_HISTORY)..=i];
                let (min_x, max_x) = window.iter().fold((i32::MAX, i32::MIN), |(lo, hi), p| (lo.min(p.0), hi.max(p.0)));
                let (min_y, max_y) = window.iter().fold((i32::MAX, i32::MIN), |(lo, hi), p| (lo.min(p.1), hi.max(p.1)));
                prop_assert!((min_x..=max_x).contains(&out.x));
                prop_assert!((min_y..=max_y).contains(&out.y));
            }
        }
    }
}
