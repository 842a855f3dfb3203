/*!
# Nested sampling run controller

[`NestedSampler`] owns the user's likelihood and prior transform together with a
[`NestedSamplerConfig`]. [`NestedSampler::run`] executes one complete run:

1. Draw `num_live_points` uniform live points with finite likelihood.
2. Repeatedly remove the worst live point, credit it with the prior mass of one
   shrinkage step and replace it with a point strictly above its likelihood, found by
   the [`ProposalEngine`].
3. Stop once the evidence still held by the live set is negligible (`dlogz`), when a
   cap on iterations or likelihood calls is reached, or when a [`StopHandle`] fires.
4. Fold the remaining live points into the archive, compute posterior weights and,
   if requested, equal-weight posterior samples.

## Example

```rust
use flownest::config::NestedSamplerConfig;
use flownest::sampler::{NestedSampler, StopReason};
use ndarray::{Array1, Array2, ArrayView2, Axis};

// Unit Gaussian likelihood with a uniform prior on [-5, 5]^2.
let loglike = |x: ArrayView2<f64>| -> Array1<f64> {
    x.map_axis(Axis(1), |row| {
        -0.5 * row.dot(&row) - (2.0 * std::f64::consts::PI).ln()
    })
};
let transform = |u: ArrayView2<f64>| -> Array2<f64> { u.mapv(|v| 10.0 * v - 5.0) };

let config = NestedSamplerConfig::default()
    .set_num_live_points(50)
    .set_seed(1);
let mut sampler = NestedSampler::new(["x", "y"], loglike, transform, config).unwrap();
let result = sampler.run().unwrap();

assert_eq!(result.summary.stop_reason, StopReason::Converged);
// The evidence is close to the prior density 1/100.
assert!((result.log_z + 100f64.ln()).abs() < 1.5);
```
*/

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::archive::{DeadPoint, DeadPointArchive};
use crate::config::NestedSamplerConfig;
use crate::dev_tools::Timer;
use crate::error::{NestError, Result, RunFailure};
use crate::evidence::EvidenceState;
use crate::likelihood::{Adapter, LogLikelihood, PriorTransform};
use crate::live::LivePointSet;
use crate::point::PointIds;
use crate::posterior::{posterior_weights, refine, resample, summarize, PosteriorSamples};
use crate::proposal::{Constraint, ModeTransition, ProposalEngine, ProposalMode};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The remaining evidence fell below `dlogz`.
    Converged,
    MaxIterations,
    MaxLikelihoodCalls,
    /// A [`StopHandle`] was triggered.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Converged => "converged",
            StopReason::MaxIterations => "iteration limit reached",
            StopReason::MaxLikelihoodCalls => "likelihood-call limit reached",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Shareable flag that ends a running sampler after its current iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clears the flag so the sampler can be run again.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Run statistics reported at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub param_names: Vec<String>,
    pub log_z: f64,
    pub log_z_err: f64,
    /// Information `H` in nats.
    pub information: f64,
    /// Main-loop iterations; the folded-in live points are not counted.
    pub iterations: usize,
    pub likelihood_calls: u64,
    pub stop_reason: StopReason,
    /// Kish effective sample size of the posterior weights.
    pub ess: f64,
    pub flow_fits: usize,
    pub flow_fallbacks: usize,
    pub flow_training_failures: usize,
    /// Replacement searches that used up their attempt budget.
    pub proposal_failures: usize,
    /// Iterations per likelihood call.
    pub efficiency: f64,
    /// Random-walk steps that moved each coordinate.
    pub coordinate_moves: Vec<u64>,
    /// Overall acceptance of random-walk and flow candidates.
    pub random_walk_acceptance: Option<f64>,
    pub flow_acceptance: Option<f64>,
    pub posterior_mean: Array1<f64>,
    pub posterior_std: Array1<f64>,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "nested sampling {} after {:.2?}", self.stop_reason, self.elapsed)?;
        writeln!(f, "  ln Z             = {:.4} +/- {:.4}", self.log_z, self.log_z_err)?;
        writeln!(f, "  information      = {:.4} nats", self.information)?;
        writeln!(f, "  iterations       = {}", self.iterations)?;
        writeln!(
            f,
            "  likelihood calls = {} (efficiency {:.4})",
            self.likelihood_calls, self.efficiency
        )?;
        writeln!(f, "  posterior ESS    = {:.1}", self.ess)?;
        writeln!(
            f,
            "  flow fits        = {} (fallbacks {}, training failures {})",
            self.flow_fits, self.flow_fallbacks, self.flow_training_failures
        )?;
        writeln!(f, "  proposal failures = {}", self.proposal_failures)?;
        if let Some(rate) = self.random_walk_acceptance {
            writeln!(f, "  random-walk acceptance = {rate:.3}")?;
        }
        if let Some(rate) = self.flow_acceptance {
            writeln!(f, "  flow acceptance  = {rate:.3}")?;
        }
        let width = self.param_names.iter().map(String::len).max().unwrap_or(0).max(9);
        writeln!(f, "  {:<width$} {:>12} {:>12}", "parameter", "mean", "std")?;
        for ((name, mean), std) in self
            .param_names
            .iter()
            .zip(self.posterior_mean.iter())
            .zip(self.posterior_std.iter())
        {
            writeln!(f, "  {name:<width$} {mean:>12.5} {std:>12.5}")?;
        }
        Ok(())
    }
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct NestedResult {
    pub log_z: f64,
    pub log_z_err: f64,
    /// Dead points in removal order, followed by the folded-in live points.
    pub archive: DeadPointArchive,
    /// Normalized posterior weight of each archive entry.
    pub weights: Array1<f64>,
    /// Equal-weight posterior samples; empty unless `test_samples > 0`.
    pub samples: PosteriorSamples,
    /// Proposal mode used at each main-loop iteration.
    pub mode_trace: Vec<ProposalMode>,
    pub transitions: Vec<ModeTransition>,
    pub summary: RunSummary,
}

impl NestedResult {
    /// Physical coordinates of the equal-weight posterior samples.
    pub fn posterior_samples(&self) -> &Array2<f64> {
        &self.samples.physical
    }
}

/// A nested sampler over a user likelihood and prior transform.
pub struct NestedSampler {
    param_names: Vec<String>,
    loglike: Box<dyn LogLikelihood>,
    transform: Box<dyn PriorTransform>,
    config: NestedSamplerConfig,
    stop: StopHandle,
}

impl NestedSampler {
    /// Creates a sampler whose dimensionality is the number of `param_names`.
    pub fn new<I, S, L, T>(
        param_names: I,
        loglike: L,
        transform: T,
        config: NestedSamplerConfig,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        L: LogLikelihood + 'static,
        T: PriorTransform + 'static,
    {
        let param_names: Vec<String> = param_names.into_iter().map(Into::into).collect();
        config.validate(param_names.len())?;
        Ok(Self {
            param_names,
            loglike: Box::new(loglike),
            transform: Box::new(transform),
            config,
            stop: StopHandle::new(),
        })
    }

    pub fn dim(&self) -> usize {
        self.param_names.len()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn config(&self) -> &NestedSamplerConfig {
        &self.config
    }

    /// A handle that stops [`run`](Self::run) after its current iteration, from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) =
            ProgressStyle::with_template("{prefix:8} [{elapsed_precise}] {spinner} {pos} it | {msg}")
        {
            pb.set_style(style);
        }
        pb.set_prefix("NS");
        pb
    }

    /// Runs nested sampling to completion.
    ///
    /// Reaching `max_iterations`, `max_likelihood_calls` or a stop request still
    /// produces a result; only fatal errors are returned as [`RunFailure`].
    pub fn run(&mut self) -> Result<NestedResult, RunFailure> {
        let config = &self.config;
        let dim = self.param_names.len();
        let n_live = config.num_live_points;
        let adapter = Adapter::new(self.loglike.as_ref(), self.transform.as_ref(), dim);
        let fail = |iterations: usize, source: NestError| RunFailure {
            iterations,
            likelihood_calls: adapter.calls(),
            source,
        };

        let started = Instant::now();
        let mut timer = Timer::new();
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let mut ids = PointIds::new();
        let mut live =
            LivePointSet::initialize(n_live, &adapter, &mut rng, &mut ids).map_err(|e| fail(0, e))?;
        timer.log(format!(
            "drew {n_live} live points with {} likelihood calls",
            adapter.calls()
        ));
        info!(
            "nested sampling: {n_live} live points, {dim} parameters, {} random-walk steps, flow = {}, switch = {}",
            config.chain_length(dim),
            config.flow,
            config.switch
        );

        let mut evidence = EvidenceState::new(n_live);
        let mut archive = DeadPointArchive::new();
        let mut engine = ProposalEngine::new(config, dim);
        let mut mode_trace = Vec::new();
        let mut proposal_failures = 0;
        let mut last_threshold = f64::NEG_INFINITY;
        let pb = self.progress_bar();

        let stop_reason = loop {
            let max_live = live.max_log_likelihood();
            if evidence.converged(max_live, config.dlogz) {
                break StopReason::Converged;
            }
            if config
                .max_iterations
                .is_some_and(|max| evidence.iteration() >= max)
            {
                break StopReason::MaxIterations;
            }
            if config
                .max_likelihood_calls
                .is_some_and(|max| adapter.calls() >= max)
            {
                break StopReason::MaxLikelihoodCalls;
            }
            if self.stop.is_stopped() {
                break StopReason::Cancelled;
            }

            let iteration = evidence.iteration() + 1;
            if let Some(t) = engine.update_mode(iteration, archive.len(), evidence.log_volume()) {
                info!(
                    "iteration {iteration}: switching to {} proposals after {} dead points (ln X = {:.3})",
                    t.to, t.dead_count, t.log_volume
                );
            }

            let (worst_id, threshold) = live
                .worst()
                .map(|p| (p.id, p.log_likelihood))
                .ok_or_else(|| fail(iteration, NestError::InvariantViolation("the live set is empty".into())))?;
            if threshold < last_threshold {
                return Err(fail(
                    iteration,
                    NestError::InvariantViolation(format!(
                        "threshold decreased from {last_threshold} to {threshold}"
                    )),
                ));
            }
            last_threshold = threshold;

            let constraint = Constraint {
                live: &live,
                adapter: &adapter,
                threshold,
                log_volume: evidence.next_log_volume(),
                call_limit: config.max_likelihood_calls,
            };
            let proposed = match engine.propose(iteration, &constraint, &mut rng, &mut ids) {
                Err(e @ NestError::ProposalExhausted { .. }) => {
                    proposal_failures += 1;
                    warn!("iteration {iteration}: {e}; widening the random-walk step and retrying");
                    engine.widen_step();
                    engine.propose(iteration, &constraint, &mut rng, &mut ids)
                }
                other => other,
            };
            let replacement = match proposed {
                Ok(point) => point,
                // The unfinished iteration is dropped; nothing has been credited for it yet.
                Err(NestError::CallBudgetSpent { .. }) => break StopReason::MaxLikelihoodCalls,
                Err(e) => return Err(fail(iteration, e)),
            };

            let (log_volume, log_width) = evidence.advance(threshold);
            mode_trace.push(engine.mode());
            let removed = live
                .replace(worst_id, replacement, threshold)
                .map_err(|e| fail(iteration, e))?;
            archive.push(DeadPoint {
                point: removed,
                log_volume,
                log_weight: log_width,
                iteration,
            });

            pb.inc(1);
            if let Some(interval) = config.log_interval {
                if iteration % interval == 0 {
                    let message = format!(
                        "ln Z = {:.3} +/- {:.3}, dlogz = {:.3}, ln X = {:.3}, calls = {}, mode = {}",
                        evidence.log_z(),
                        evidence.log_z_err(),
                        evidence.delta_log_z(live.max_log_likelihood()),
                        log_volume,
                        adapter.calls(),
                        engine.mode()
                    );
                    info!("iteration {iteration}: {message}");
                    pb.set_message(message);
                }
            }
        };
        let iterations = evidence.iteration();

        // The live set shares the remaining volume equally.
        let final_volume = evidence.log_volume();
        let final_width = evidence.final_log_width();
        for (k, point) in live.into_sorted_points().into_iter().enumerate() {
            let remaining = (n_live - k - 1) as f64 / n_live as f64;
            evidence.add_contribution(point.log_likelihood, final_width);
            archive.push(DeadPoint {
                point,
                log_volume: final_volume + remaining.ln(),
                log_weight: final_width,
                iteration: iterations + k + 1,
            });
        }
        pb.finish_with_message(format!(
            "{stop_reason}: ln Z = {:.3} +/- {:.3}",
            evidence.log_z(),
            evidence.log_z_err()
        ));

        let weights = posterior_weights(&archive, evidence.log_z());
        let posterior = summarize(&archive, weights.view());
        let samples = if config.test_samples > 0 {
            let drawn = resample(&archive, weights.view(), config.test_samples, &mut rng)
                .map_err(|e| fail(iterations, e))?;
            refine(&drawn, &adapter, config.test_mcmc_steps, config.seed)
                .map_err(|e| fail(iterations, e))?
        } else {
            PosteriorSamples::empty(dim)
        };

        let likelihood_calls = adapter.calls();
        let summary = RunSummary {
            param_names: self.param_names.clone(),
            log_z: evidence.log_z(),
            log_z_err: evidence.log_z_err(),
            information: evidence.information(),
            iterations,
            likelihood_calls,
            stop_reason,
            ess: posterior.ess,
            flow_fits: engine.flow_fits(),
            flow_fallbacks: engine.flow_fallbacks(),
            flow_training_failures: engine.training_failures(),
            proposal_failures,
            efficiency: if likelihood_calls > 0 {
                iterations as f64 / likelihood_calls as f64
            } else {
                0.0
            },
            coordinate_moves: engine.random_walk().coordinate_moves().to_vec(),
            random_walk_acceptance: engine.random_walk().acceptance().overall_rate(),
            flow_acceptance: engine.flow().and_then(|f| f.acceptance().overall_rate()),
            posterior_mean: posterior.mean,
            posterior_std: posterior.std,
            elapsed: started.elapsed(),
        };
        timer.log("posterior reconstruction finished");
        info!("{summary}");

        Ok(NestedResult {
            log_z: summary.log_z,
            log_z_err: summary.log_z_err,
            archive,
            weights,
            samples,
            mode_trace,
            transitions: engine.transitions().to_vec(),
            summary,
        })
    }
}
