/*!
# Posterior reconstruction

Each dead point carries the prior mass `w_i` it was assigned, so its posterior weight is
`p_i = w_i L_i / Z`. [`posterior_weights`] computes the normalized weights,
[`resample`] turns them into equal-weight samples by multinomial resampling, and
[`refine`] decorrelates the duplicates with independent random-walk Metropolis chains
over the posterior (uniform prior on the unit cube), run in parallel with one seeded
random stream per chain.
*/

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_distr::StandardNormal;

use crate::archive::DeadPointArchive;
use crate::core::{run_chains, MarkovChain};
use crate::dev_tools::Timer;
use crate::error::{NestError, Result};
use crate::likelihood::{in_unit_cube, Adapter};
use crate::stats::{kish_ess, weighted_mean_std};

/// Refinement step size relative to the spread of the resampled points.
const REFINE_STEP_SCALE: f64 = 0.5;
const MIN_SPREAD: f64 = 1e-9;

/// Normalized posterior weight of every archived point, `exp(ln w + ln L - ln Z)`.
pub fn posterior_weights(archive: &DeadPointArchive, log_z: f64) -> Array1<f64> {
    let weights = archive
        .log_contributions()
        .mapv(|c| if log_z.is_finite() { (c - log_z).exp() } else { 0.0 });
    let total = weights.sum();
    if total > 0.0 {
        weights / total
    } else {
        weights
    }
}

/// Equal-weight posterior draws.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSamples {
    pub unit: Array2<f64>,
    pub physical: Array2<f64>,
    pub log_likelihood: Array1<f64>,
}

impl PosteriorSamples {
    pub fn empty(dim: usize) -> Self {
        Self {
            unit: Array2::zeros((0, dim)),
            physical: Array2::zeros((0, dim)),
            log_likelihood: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.unit.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Draws `n` archive entries with replacement, with probability proportional to `weights`.
pub fn resample<R: Rng + ?Sized>(
    archive: &DeadPointArchive,
    weights: ArrayView1<f64>,
    n: usize,
    rng: &mut R,
) -> Result<PosteriorSamples> {
    let dim = archive.last().map_or(0, |d| d.point.dim());
    if n == 0 {
        return Ok(PosteriorSamples::empty(dim));
    }
    if weights.len() != archive.len() {
        return Err(NestError::ShapeMismatch {
            context: "posterior weights",
            expected: vec![archive.len()],
            found: vec![weights.len()],
        });
    }
    let index = WeightedIndex::new(weights.iter())
        .map_err(|e| NestError::InvariantViolation(format!("cannot resample: {e}")))?;

    let entries = archive.entries();
    let mut samples = PosteriorSamples {
        unit: Array2::zeros((n, dim)),
        physical: Array2::zeros((n, dim)),
        log_likelihood: Array1::zeros(n),
    };
    for k in 0..n {
        let point = &entries[index.sample(rng)].point;
        samples.unit.row_mut(k).assign(&point.unit);
        samples.physical.row_mut(k).assign(&point.physical);
        samples.log_likelihood[k] = point.log_likelihood;
    }
    Ok(samples)
}

/// State of one refinement chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorState {
    pub unit: Array1<f64>,
    pub physical: Array1<f64>,
    pub log_likelihood: f64,
}

/// Random-walk Metropolis chain targeting `L(x)` on the unit cube.
pub struct PosteriorChain<'a, 'f> {
    adapter: &'a Adapter<'f>,
    sigma: Array1<f64>,
    state: PosteriorState,
    rng: SmallRng,
    accepted: usize,
}

impl<'a, 'f> PosteriorChain<'a, 'f> {
    pub fn new(adapter: &'a Adapter<'f>, sigma: Array1<f64>, start: PosteriorState, seed: u64) -> Self {
        Self {
            adapter,
            sigma,
            state: start,
            rng: SmallRng::seed_from_u64(seed),
            accepted: 0,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

impl MarkovChain for PosteriorChain<'_, '_> {
    type State = PosteriorState;

    fn step(&mut self) -> Result<&PosteriorState> {
        let mut proposal = self.state.unit.clone();
        for (u, s) in proposal.iter_mut().zip(self.sigma.iter()) {
            let z: f64 = self.rng.sample(StandardNormal);
            *u += s * z;
        }
        let Some(unit) = proposal.as_slice().filter(|u| in_unit_cube(u)) else {
            return Ok(&self.state);
        };
        let (physical, logl) = self.adapter.evaluate_point(unit)?;
        if logl.is_finite() && self.rng.gen::<f64>().ln() < logl - self.state.log_likelihood {
            self.state = PosteriorState {
                unit: proposal,
                physical,
                log_likelihood: logl,
            };
            self.accepted += 1;
        }
        Ok(&self.state)
    }

    fn current_state(&self) -> &PosteriorState {
        &self.state
    }
}

/// Runs an `n_steps` Metropolis chain from every sample in parallel; chain `k` is
/// seeded with `seed + k`.
pub fn refine(
    samples: &PosteriorSamples,
    adapter: &Adapter<'_>,
    n_steps: usize,
    seed: u64,
) -> Result<PosteriorSamples> {
    if n_steps == 0 || samples.is_empty() {
        return Ok(samples.clone());
    }
    let mut timer = Timer::new();
    let sigma = samples
        .unit
        .std_axis(Axis(0), 0.0)
        .mapv(|s| REFINE_STEP_SCALE * s.max(MIN_SPREAD));

    let mut chains: Vec<PosteriorChain> = (0..samples.len())
        .map(|k| {
            let start = PosteriorState {
                unit: samples.unit.row(k).to_owned(),
                physical: samples.physical.row(k).to_owned(),
                log_likelihood: samples.log_likelihood[k],
            };
            PosteriorChain::new(adapter, sigma.clone(), start, seed.wrapping_add(k as u64))
        })
        .collect();
    run_chains(&mut chains, n_steps)?;

    let mut refined = samples.clone();
    let mut accepted = 0;
    for (k, chain) in chains.iter().enumerate() {
        let state = chain.current_state();
        refined.unit.row_mut(k).assign(&state.unit);
        refined.physical.row_mut(k).assign(&state.physical);
        refined.log_likelihood[k] = state.log_likelihood;
        accepted += chain.accepted();
    }
    timer.log(format!(
        "refined {} posterior samples with {n_steps} steps each, acceptance {:.3}",
        chains.len(),
        accepted as f64 / (chains.len() * n_steps) as f64
    ));
    Ok(refined)
}

/// Weighted summary of the posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    /// Kish effective sample size of the posterior weights.
    pub ess: f64,
    /// Posterior mean of each physical parameter.
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

pub fn summarize(archive: &DeadPointArchive, weights: ArrayView1<f64>) -> PosteriorSummary {
    let (mean, std) = weighted_mean_std(archive.physical_matrix().view(), weights);
    PosteriorSummary {
        ess: kish_ess(weights),
        mean,
        std,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DeadPoint;
    use crate::evidence::logsumexp;
    use crate::likelihood::IdentityTransform;
    use crate::point::{Origin, Point};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayView2};

    fn gaussian(x: ArrayView2<f64>) -> Array1<f64> {
        x.map_axis(Axis(1), |row| {
            -0.5 * row.mapv(|v| ((v - 0.5) / 0.1).powi(2)).sum()
        })
    }

    fn archive_of(points: &[([f64; 2], f64)], n_live: f64) -> DeadPointArchive {
        let mut archive = DeadPointArchive::new();
        for (i, (u, logl)) in points.iter().enumerate() {
            let iteration = i + 1;
            archive.push(DeadPoint {
                point: Point {
                    id: i as u64,
                    unit: array![u[0], u[1]],
                    physical: array![u[0], u[1]],
                    log_likelihood: *logl,
                    log_volume: None,
                    origin: Origin::Initial,
                },
                log_volume: -(iteration as f64) / n_live,
                log_weight: -((iteration - 1) as f64) / n_live + (-(-1.0 / n_live).exp_m1()).ln(),
                iteration,
            });
        }
        archive
    }

    fn sample_archive() -> DeadPointArchive {
        archive_of(
            &[
                ([0.1, 0.1], -8.0),
                ([0.3, 0.6], -3.0),
                ([0.45, 0.5], -0.5),
                ([0.5, 0.52], -0.02),
            ],
            4.0,
        )
    }

    #[test]
    fn weights_are_normalized() {
        let archive = sample_archive();
        let log_z = logsumexp(archive.log_contributions().as_slice().unwrap());
        let w = posterior_weights(&archive, log_z);
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        assert!(w[3] > w[2] && w[2] > w[1] && w[1] > w[0]);
    }

    #[test]
    fn resampling_follows_the_weights() {
        let archive = sample_archive();
        let weights = array![0.0, 0.0, 0.25, 0.75];
        let mut rng = SmallRng::seed_from_u64(0);
        let samples = resample(&archive, weights.view(), 4000, &mut rng).unwrap();
        assert_eq!(samples.len(), 4000);
        let last = samples
            .log_likelihood
            .iter()
            .filter(|&&l| l == -0.02)
            .count();
        assert!(samples.log_likelihood.iter().all(|&l| l == -0.02 || l == -0.5));
        assert_abs_diff_eq!(last as f64 / 4000.0, 0.75, epsilon = 0.03);
    }

    #[test]
    fn resampling_rejects_zero_weights() {
        let archive = sample_archive();
        let weights = Array1::zeros(4);
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(matches!(
            resample(&archive, weights.view(), 10, &mut rng),
            Err(NestError::InvariantViolation(_))
        ));
        assert!(resample(&archive, Array1::ones(3).view(), 10, &mut rng).is_err());
    }

    #[test]
    fn refinement_is_reproducible_and_stays_in_the_cube() {
        let adapter = Adapter::new(&gaussian, &IdentityTransform, 2);
        let mut rng = SmallRng::seed_from_u64(2);
        let start = Array2::from_shape_fn((64, 2), |_| 0.4 + 0.2 * rng.gen::<f64>());
        let (physical, logl) = adapter.evaluate(start.view()).unwrap();
        let samples = PosteriorSamples {
            unit: start,
            physical,
            log_likelihood: logl,
        };

        let a = refine(&samples, &adapter, 50, 11).unwrap();
        let b = refine(&samples, &adapter, 50, 11).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.unit, samples.unit);
        assert!(a.unit.iter().all(|u| (0.0..=1.0).contains(u)));
        let mean = a.physical.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean, array![0.5, 0.5], epsilon = 0.05);
    }

    #[test]
    fn zero_steps_leaves_samples_untouched() {
        let adapter = Adapter::new(&gaussian, &IdentityTransform, 2);
        let samples = PosteriorSamples::empty(2);
        assert_eq!(refine(&samples, &adapter, 10, 0).unwrap(), samples);
    }

    #[test]
    fn summary_uses_the_weights() {
        let archive = sample_archive();
        let weights = array![0.0, 0.0, 0.5, 0.5];
        let summary = summarize(&archive, weights.view());
        assert_abs_diff_eq!(summary.ess, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean, array![0.475, 0.51], epsilon = 1e-12);
    }
}
