//! Temporal smoothing of per-frame vehicle counts.
//!
//! A single frame over- or under-counts (a passing car, an occluded one).
//! The estimate reported downstream is the median of a bounded window of
//! recent raw counts (`DEFAULT_WINDOW` unless configured), clamped to the
//! slot total.

use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 9;

/// Median over a bounded window of recent raw occupancy counts.
///
/// Before the window fills, the median covers whatever samples exist. For an
/// even number of samples the two middle values are averaged, rounding down.
#[derive(Clone, Debug)]
pub struct MedianSmoother {
    window: VecDeque<usize>,
    capacity: usize,
}

impl MedianSmoother {
    /// A capacity of zero is treated as one (no smoothing).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a raw count and return the smoothed count.
    pub fn push(&mut self, raw: usize) -> usize {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(raw);
        self.median()
    }

    fn median(&self) -> usize {
        let mut sorted: Vec<usize> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        match sorted.len() {
            0 => 0,
            n if n % 2 == 1 => sorted[mid],
            _ => (sorted[mid - 1] + sorted[mid]) / 2,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MedianSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Stable occupancy estimate: `free_count + occupied_count == total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmoothedEstimate {
    pub free_count: usize,
    pub occupied_count: usize,
}

impl SmoothedEstimate {
    pub fn from_counts(smoothed_raw: usize, total_slots: usize) -> Self {
        let occupied_count = smoothed_raw.min(total_slots);
        Self {
            free_count: total_slots - occupied_count,
            occupied_count,
        }
    }

    pub fn total_slots(&self) -> usize {
        self.free_count + self.occupied_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_outlier_is_suppressed() {
        let mut smoother = MedianSmoother::default();
        let mut last = 0;
        for raw in [3, 10, 4, 4, 4, 4, 4, 4, 4] {
            last = smoother.push(raw);
        }
        assert_eq!(last, 4);
        assert_eq!(smoother.len(), 9);
    }

    #[test]
    fn warm_up_uses_available_samples() {
        let mut smoother = MedianSmoother::default();
        assert_eq!(smoother.push(7), 7);
        // Even-length median rounds down.
        assert_eq!(smoother.push(4), 5);
        assert_eq!(smoother.push(9), 7);
    }

    #[test]
    fn oldest_sample_is_evicted() {
        let mut smoother = MedianSmoother::new(3);
        for raw in [1, 1, 1] {
            smoother.push(raw);
        }
        assert_eq!(smoother.push(8), 1);
        assert_eq!(smoother.push(8), 8);
        assert_eq!(smoother.len(), 3);
    }

    #[test]
    fn estimate_is_clamped_to_total() {
        let est = SmoothedEstimate::from_counts(20, 16);
        assert_eq!(est, SmoothedEstimate { free_count: 0, occupied_count: 16 });

        for raw in 0..30 {
            let est = SmoothedEstimate::from_counts(raw, 16);
            assert_eq!(est.total_slots(), 16);
        }
    }

    #[test]
    fn no_slots_means_nothing_free() {
        let est = SmoothedEstimate::from_counts(3, 0);
        assert_eq!((est.free_count, est.occupied_count), (0, 0));
    }
}
