//! Acceptance tracking and weighted-sample statistics.

use std::collections::VecDeque;

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Sliding-window acceptance rate of a proposal mechanism.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceTracker {
    window: usize,
    queue: VecDeque<bool>,
    accepted: usize,
    total_accepted: u64,
    total: u64,
}

impl AcceptanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            queue: VecDeque::with_capacity(window.max(1)),
            accepted: 0,
            total_accepted: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, accepted: bool) {
        self.queue.push_back(accepted);
        self.accepted += accepted as usize;
        self.total += 1;
        self.total_accepted += accepted as u64;
        if self.queue.len() > self.window {
            if let Some(true) = self.queue.pop_front() {
                self.accepted -= 1;
            }
        }
    }

    /// Acceptance rate over the window; `None` before anything was recorded.
    pub fn rate(&self) -> Option<f64> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.accepted as f64 / self.queue.len() as f64)
        }
    }

    /// Acceptance rate over everything ever recorded.
    pub fn overall_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.total_accepted as f64 / self.total as f64)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Kish effective sample size `(sum w)^2 / sum w^2` of a set of weights.
pub fn kish_ess(weights: ArrayView1<f64>) -> f64 {
    let sum = weights.sum();
    let sum_sq = weights.dot(&weights);
    if sum_sq > 0.0 {
        sum * sum / sum_sq
    } else {
        0.0
    }
}

/// Weighted mean and standard deviation of each column of `samples`.
///
/// `weights` need not be normalized.
pub fn weighted_mean_std(
    samples: ArrayView2<f64>,
    weights: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let total = weights.sum();
    let dim = samples.ncols();
    if samples.nrows() == 0 || !(total > 0.0) {
        return (
            Array1::from_elem(dim, f64::NAN),
            Array1::from_elem(dim, f64::NAN),
        );
    }
    let w = weights.insert_axis(Axis(1));
    let mean = (&samples * &w).sum_axis(Axis(0)) / total;
    let centered = &samples - &mean.view().insert_axis(Axis(0));
    let var = (centered.mapv(|x| x * x) * &w).sum_axis(Axis(0)) / total;
    (mean, var.mapv(f64::sqrt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn window_forgets_old_entries() {
        let mut tracker = AcceptanceTracker::new(4);
        assert_eq!(tracker.rate(), None);
        for _ in 0..4 {
            tracker.record(true);
        }
        assert_eq!(tracker.rate(), Some(1.0));
        for _ in 0..4 {
            tracker.record(false);
        }
        assert_eq!(tracker.rate(), Some(0.0));
        assert_eq!(tracker.overall_rate(), Some(0.5));
        assert_eq!(tracker.total(), 8);
    }

    #[test]
    fn ess_of_uniform_weights_is_count() {
        let w = Array1::from_elem(10, 0.1);
        assert_abs_diff_eq!(kish_ess(w.view()), 10.0, epsilon = 1e-12);
        let w = array![1.0, 0.0, 0.0];
        assert_abs_diff_eq!(kish_ess(w.view()), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn weighted_moments() {
        let samples = array![[0.0, 1.0], [2.0, 1.0]];
        let weights = array![1.0, 3.0];
        let (mean, std) = weighted_mean_std(samples.view(), weights.view());
        assert_abs_diff_eq!(mean, array![1.5, 1.0], epsilon = 1e-12);
        assert_abs_diff_eq!(std, array![0.75_f64.sqrt(), 0.0], epsilon = 1e-12);
    }
}
