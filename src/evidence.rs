//! Evidence bookkeeping for nested sampling.
//!
//! The prior volume shrinks deterministically by its expected factor: after `i`
//! iterations with `N` live points, `ln X_i = -i / N`. The dead point removed at
//! iteration `i` is assigned the width `w_i = X_{i-1} - X_i`.
//!
//! The uncertainty of `ln Z` is `sqrt(H / N)`, from the information `H` accumulated over
//! the run. It stands in for an estimate built from the spread of live-point
//! likelihoods, which this module does not compute.

use num_traits::Float;

/// `ln(exp(a) + exp(b))` without overflow, treating `-inf` as zero weight.
pub fn logaddexp<T: Float>(a: T, b: T) -> T {
    if a == T::neg_infinity() {
        return b;
    }
    if b == T::neg_infinity() {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `ln sum exp(x_i)` over a slice.
pub fn logsumexp<T: Float>(xs: &[T]) -> T {
    let max = xs.iter().copied().fold(T::neg_infinity(), T::max);
    if max == T::neg_infinity() || max == T::infinity() {
        return max;
    }
    let sum = xs
        .iter()
        .fold(T::zero(), |acc, &x| acc + (x - max).exp());
    max + sum.ln()
}

/// Running evidence estimate of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceState {
    n_live: usize,
    iteration: usize,
    log_z: f64,
    information: f64,
    log_volume: f64,
    /// `ln(1 - e^{-1/N})`, the width of one shrinkage step relative to the current volume.
    log_shrink_width: f64,
}

impl EvidenceState {
    pub fn new(n_live: usize) -> Self {
        let n = n_live as f64;
        Self {
            n_live,
            iteration: 0,
            log_z: f64::NEG_INFINITY,
            information: 0.0,
            log_volume: 0.0,
            log_shrink_width: (-(-1.0 / n).exp_m1()).ln(),
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn log_z(&self) -> f64 {
        self.log_z
    }

    /// Information `H` (negative relative entropy of posterior to prior) in nats.
    pub fn information(&self) -> f64 {
        self.information
    }

    pub fn log_z_variance(&self) -> f64 {
        self.information.max(0.0) / self.n_live as f64
    }

    pub fn log_z_err(&self) -> f64 {
        self.log_z_variance().sqrt()
    }

    /// Current log prior volume enclosed by the live set.
    pub fn log_volume(&self) -> f64 {
        self.log_volume
    }

    /// Log prior volume after the next call to [`advance`](Self::advance).
    pub fn next_log_volume(&self) -> f64 {
        -((self.iteration + 1) as f64) / self.n_live as f64
    }

    /// Shrinks the prior volume by one step and accumulates the removed point.
    ///
    /// Returns `(ln X_i, ln w_i)` for the point with log-likelihood `log_l`.
    pub fn advance(&mut self, log_l: f64) -> (f64, f64) {
        let log_width = self.log_volume + self.log_shrink_width;
        self.iteration += 1;
        self.log_volume = -(self.iteration as f64) / self.n_live as f64;
        self.add_contribution(log_l, log_width);
        (self.log_volume, log_width)
    }

    /// Log-weight given to each live point when the remaining volume is split evenly.
    pub fn final_log_width(&self) -> f64 {
        self.log_volume - (self.n_live as f64).ln()
    }

    /// Adds a point of likelihood `log_l` occupying prior mass `exp(log_width)`.
    pub fn add_contribution(&mut self, log_l: f64, log_width: f64) {
        let log_wl = log_l + log_width;
        if log_wl == f64::NEG_INFINITY {
            return;
        }
        let log_z_new = logaddexp(self.log_z, log_wl);
        let old_term = if self.log_z == f64::NEG_INFINITY {
            0.0
        } else {
            (self.log_z - log_z_new).exp() * (self.information + self.log_z)
        };
        self.information = (log_wl - log_z_new).exp() * log_l + old_term - log_z_new;
        self.log_z = log_z_new;
    }

    /// `ln(L_max X)`, an upper estimate of the evidence still held by the live set.
    pub fn log_remaining(&self, max_live_log_l: f64) -> f64 {
        max_live_log_l + self.log_volume
    }

    /// `ln(Z + L_max X) - ln Z`; infinite while nothing has been accumulated.
    pub fn delta_log_z(&self, max_live_log_l: f64) -> f64 {
        if self.log_z == f64::NEG_INFINITY {
            return f64::INFINITY;
        }
        logaddexp(self.log_z, self.log_remaining(max_live_log_l)) - self.log_z
    }

    /// Whether the remaining evidence is small relative to what has been accumulated.
    pub fn converged(&self, max_live_log_l: f64, dlogz: f64) -> bool {
        self.delta_log_z(max_live_log_l) < dlogz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn logaddexp_matches_direct_sum() {
        assert_abs_diff_eq!(logaddexp(1.0_f64, 2.0), (1f64.exp() + 2f64.exp()).ln(), epsilon = 1e-12);
        assert_eq!(logaddexp(f64::NEG_INFINITY, 3.0), 3.0);
        assert_abs_diff_eq!(logaddexp(-1000.0_f64, -1000.0), -1000.0 + 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn logsumexp_handles_empty_and_large() {
        assert_eq!(logsumexp::<f64>(&[]), f64::NEG_INFINITY);
        assert_abs_diff_eq!(logsumexp(&[1000.0_f64, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn volume_strictly_decreases() {
        let mut ev = EvidenceState::new(10);
        let mut last = ev.log_volume();
        for i in 0..100 {
            let next = ev.next_log_volume();
            let (log_x, _) = ev.advance(i as f64 * 0.1);
            assert_eq!(log_x, next);
            assert!(log_x < last);
            last = log_x;
        }
        assert_abs_diff_eq!(ev.log_volume(), -10.0, epsilon = 1e-12);
    }

    #[test]
    fn widths_and_final_share_sum_to_unit_prior() {
        let n = 25;
        let mut ev = EvidenceState::new(n);
        let mut log_ws = Vec::new();
        for _ in 0..300 {
            let (_, log_w) = ev.advance(0.0);
            log_ws.push(log_w);
        }
        for _ in 0..n {
            log_ws.push(ev.final_log_width());
        }
        assert_abs_diff_eq!(logsumexp(&log_ws), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn constant_likelihood_gives_exact_evidence() {
        let n = 50;
        let log_l = -2.0;
        let mut ev = EvidenceState::new(n);
        for _ in 0..500 {
            ev.advance(log_l);
        }
        for _ in 0..n {
            ev.add_contribution(log_l, ev.final_log_width());
        }
        assert_abs_diff_eq!(ev.log_z(), log_l, epsilon = 1e-10);
        assert_abs_diff_eq!(ev.information(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn log_z_error_comes_from_information() {
        // L = 1 on the innermost e^-2 of the prior and 0 elsewhere: H = 2 nats.
        let n = 20;
        let mut ev = EvidenceState::new(n);
        for _ in 0..40 {
            ev.advance(f64::NEG_INFINITY);
        }
        for _ in 0..400 {
            ev.advance(0.0);
        }
        for _ in 0..n {
            ev.add_contribution(0.0, ev.final_log_width());
        }
        assert_abs_diff_eq!(ev.log_z(), -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ev.information(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ev.log_z_err(), (2.0 / n as f64).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn log_z_is_monotone() {
        let mut ev = EvidenceState::new(20);
        let mut last = ev.log_z();
        for i in 0..200 {
            ev.advance(-10.0 + 0.05 * i as f64);
            assert!(ev.log_z() >= last);
            last = ev.log_z();
        }
    }

    #[test]
    fn convergence_criterion() {
        let mut ev = EvidenceState::new(10);
        assert!(!ev.converged(0.0, 0.5));
        for _ in 0..200 {
            ev.advance(0.0);
        }
        // X = e^-20, so the remaining mass is negligible.
        assert!(ev.converged(0.0, 0.5));
        assert!(ev.delta_log_z(0.0) > 0.0);
    }
}
