/*!
# Replacement proposals

The [`ProposalEngine`] finds a new point strictly above the current likelihood threshold
`L*` whenever the sampler removes the worst live point. It starts in
[`ProposalMode::RandomWalk`] and moves once, and for good, to
[`ProposalMode::FlowGuided`] when [`switch_ready`] fires.

- **Random walk**: a constrained chain starts at a random live point and takes
  [`chain_length`](NestedSamplerConfig::chain_length) Gaussian steps whose per-coordinate
  scale is `step_scale * std(live coordinate)`. A step is accepted when it stays in the
  unit cube and exceeds `L*`. The end point is returned, provided the chain moved at least
  once. The step scale adapts towards [`TARGET_ACCEPTANCE`].
- **Flow-guided**: a [`DensityEstimator`] is fit to the live points and periodically
  refit. Its samples are screened (unit cube, finite density, density floor), thinned
  towards the uniform constrained prior and evaluated in batches. Every evaluated
  candidate above `L*` goes into a pool; later iterations take pooled points that still
  exceed their threshold before drawing again. If nothing is found after
  `max_flow_draws` batches, the iteration falls back to the random walk.

Searches stop with [`NestError::CallBudgetSpent`] once the adapter has made
[`Constraint::call_limit`] calls.

With a slow/fast split of the coordinates ([`SlowFastPartition`]), random-walk steps
alternate between moving only the slow and only the fast coordinates.
*/

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;

use log::{debug, warn};
use ndarray::{Array1, ArrayView1, Axis};
use ndarray_stats::QuantileExt;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::NestedSamplerConfig;
use crate::error::{NestError, Result};
use crate::flow::{build_flow, DensityEstimator, FitReport};
use crate::likelihood::{in_unit_cube, Adapter};
use crate::live::LivePointSet;
use crate::point::{Origin, Point, PointIds};
use crate::stats::AcceptanceTracker;

/// Acceptance rate the random-walk step scale is tuned towards.
pub const TARGET_ACCEPTANCE: f64 = 0.35;
pub const MIN_STEP_SCALE: f64 = 1e-4;
pub const MAX_STEP_SCALE: f64 = 1.0;
/// Flow samples whose log-density is this far below the lowest live log-density are discarded.
pub const FLOW_DENSITY_MARGIN: f64 = 2.0;

const INITIAL_STEP_SCALE: f64 = 0.5;
const ADAPT_RATE: f64 = 0.2;
const ACCEPTANCE_WINDOW: usize = 100;
/// Floor of the per-coordinate live spread used to size steps.
const MIN_SPREAD: f64 = 1e-9;

/// The mechanism used to propose replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProposalMode {
    #[default]
    RandomWalk,
    FlowGuided,
}

impl fmt::Display for ProposalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalMode::RandomWalk => write!(f, "random-walk"),
            ProposalMode::FlowGuided => write!(f, "flow-guided"),
        }
    }
}

/// Whether the switch to flow-guided proposals should happen.
///
/// A negative `switch` never fires. `switch >= 1` is a number of dead points;
/// `0 <= switch < 1` is a prior-volume fraction, compared against `exp(log_volume)`.
pub fn switch_ready(switch: f64, dead_count: usize, log_volume: f64) -> bool {
    if !(switch >= 0.0) {
        return false;
    }
    if switch >= 1.0 {
        dead_count as f64 >= switch
    } else {
        log_volume <= switch.ln()
    }
}

/// A recorded change of proposal mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeTransition {
    /// Iteration from which the new mode is used.
    pub iteration: usize,
    pub dead_count: usize,
    pub log_volume: f64,
    pub from: ProposalMode,
    pub to: ProposalMode,
}

/// What a replacement must satisfy, and what it is evaluated with.
pub struct Constraint<'a, 'f> {
    pub live: &'a LivePointSet,
    pub adapter: &'a Adapter<'f>,
    /// Current likelihood threshold `ln L*`; replacements must exceed it strictly.
    pub threshold: f64,
    /// Log prior volume at the time of the search, stored on the new point.
    pub log_volume: f64,
    /// Total adapter calls after which searching stops.
    pub call_limit: Option<u64>,
}

impl Constraint<'_, '_> {
    /// Likelihood evaluations left before `call_limit`; `None` when unlimited.
    pub fn remaining_calls(&self) -> Option<u64> {
        self.call_limit
            .map(|limit| limit.saturating_sub(self.adapter.calls()))
    }

    fn budget_spent(&self) -> NestError {
        NestError::CallBudgetSpent {
            limit: self.call_limit.unwrap_or(u64::MAX),
        }
    }

    /// Evaluates `candidate`, returning its physical coordinates and log-likelihood when
    /// it lies in the unit cube and exceeds the threshold.
    fn admit(&self, candidate: &Array1<f64>) -> Result<Option<(Array1<f64>, f64)>> {
        match candidate.as_slice() {
            Some(u) if in_unit_cube(u) => {
                if self.remaining_calls() == Some(0) {
                    return Err(self.budget_spent());
                }
                let (physical, logl) = self.adapter.evaluate_point(u)?;
                Ok((logl > self.threshold).then_some((physical, logl)))
            }
            _ => Ok(None),
        }
    }

    fn point(
        &self,
        ids: &mut PointIds,
        unit: Array1<f64>,
        physical: Array1<f64>,
        log_likelihood: f64,
        origin: Origin,
    ) -> Point {
        Point {
            id: ids.next_id(),
            unit,
            physical,
            log_likelihood,
            log_volume: Some(self.log_volume),
            origin,
        }
    }
}

/// Split of the coordinates into a slow leading block and a fast remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowFastPartition {
    dim: usize,
    num_slow: usize,
    period: usize,
}

impl SlowFastPartition {
    pub fn new(dim: usize, num_slow: usize, period: usize) -> Self {
        Self {
            dim,
            num_slow: num_slow.min(dim),
            period: period.max(1),
        }
    }

    /// Whether both a slow and a fast block exist.
    pub fn is_split(&self) -> bool {
        self.num_slow > 0 && self.num_slow < self.dim
    }

    /// Coordinates moved by the `step`-th step (1-based).
    pub fn active(&self, step: u64) -> Range<usize> {
        if !self.is_split() {
            0..self.dim
        } else if step % self.period as u64 == 0 {
            0..self.num_slow
        } else {
            self.num_slow..self.dim
        }
    }
}

/// Gaussian random-walk proposals constrained to `L > L*`.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    chain_length: usize,
    max_attempts: usize,
    step_scale: f64,
    partition: SlowFastPartition,
    tracker: AcceptanceTracker,
    steps: u64,
    moves: Vec<u64>,
}

impl RandomWalk {
    pub fn new(dim: usize, config: &NestedSamplerConfig) -> Self {
        Self {
            chain_length: config.chain_length(dim),
            max_attempts: config.max_proposal_attempts,
            step_scale: INITIAL_STEP_SCALE,
            partition: SlowFastPartition::new(dim, config.num_slow, config.slow_period),
            tracker: AcceptanceTracker::new(ACCEPTANCE_WINDOW),
            steps: 0,
            moves: vec![0; dim],
        }
    }

    pub fn step_scale(&self) -> f64 {
        self.step_scale
    }

    /// Steps of each constrained chain.
    pub fn chain_length(&self) -> usize {
        self.chain_length
    }

    pub fn acceptance(&self) -> &AcceptanceTracker {
        &self.tracker
    }

    /// How many steps moved each coordinate.
    pub fn coordinate_moves(&self) -> &[u64] {
        &self.moves
    }

    /// Doubles the step scale, up to [`MAX_STEP_SCALE`].
    pub fn widen_step(&mut self) {
        self.step_scale = (2.0 * self.step_scale).min(MAX_STEP_SCALE);
    }

    /// Per-coordinate step sizes for the current live set.
    fn step_sizes(&self, live: &LivePointSet) -> Array1<f64> {
        live.unit_matrix()
            .std_axis(Axis(0), 0.0)
            .mapv(|s| self.step_scale * s.max(MIN_SPREAD))
    }

    /// Moves the coordinates active at the next step by `sigma * N(0, 1)`.
    pub fn perturb<R: Rng + ?Sized>(
        &mut self,
        from: ArrayView1<f64>,
        sigma: ArrayView1<f64>,
        rng: &mut R,
    ) -> Array1<f64> {
        self.steps += 1;
        let mut out = from.to_owned();
        for i in self.partition.active(self.steps) {
            let z: f64 = StandardNormal.sample(rng);
            out[i] += sigma[i] * z;
            self.moves[i] += 1;
        }
        out
    }

    /// Finds a replacement above `c.threshold`, failing with
    /// [`NestError::ProposalExhausted`] once the attempt budget is spent and with
    /// [`NestError::CallBudgetSpent`] at the call limit.
    pub fn propose<R: Rng + ?Sized>(
        &mut self,
        c: &Constraint<'_, '_>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Point> {
        let sigma = self.step_sizes(c.live);
        let result = self.constrained_chain(c, sigma.view(), rng, ids);
        self.adapt();
        result
    }

    fn exhausted(&self, c: &Constraint<'_, '_>) -> NestError {
        NestError::ProposalExhausted {
            threshold: c.threshold,
            attempts: self.max_attempts,
        }
    }

    fn constrained_chain<R: Rng + ?Sized>(
        &mut self,
        c: &Constraint<'_, '_>,
        sigma: ArrayView1<f64>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Point> {
        let start = c
            .live
            .random_member(rng)
            .ok_or_else(|| NestError::InvariantViolation("the live set is empty".into()))?;
        let mut unit = start.unit.clone();
        let mut physical = start.physical.clone();
        let mut logl = start.log_likelihood;
        let mut accepted = 0;
        let mut steps = 0;

        // The start may sit exactly at L*, so at least one accepted move is required.
        while steps < self.chain_length || accepted == 0 {
            if steps >= self.max_attempts {
                return Err(self.exhausted(c));
            }
            let candidate = self.perturb(unit.view(), sigma, rng);
            steps += 1;
            match c.admit(&candidate)? {
                Some((p, l)) => {
                    unit = candidate;
                    physical = p;
                    logl = l;
                    accepted += 1;
                    self.tracker.record(true);
                }
                None => self.tracker.record(false),
            }
        }
        Ok(c.point(ids, unit, physical, logl, Origin::RandomWalk))
    }

    fn adapt(&mut self) {
        if let Some(rate) = self.tracker.rate() {
            let log_scale = self.step_scale.ln() + ADAPT_RATE * (rate - TARGET_ACCEPTANCE);
            self.step_scale = log_scale.exp().clamp(MIN_STEP_SCALE, MAX_STEP_SCALE);
        }
    }
}

/// An evaluated flow sample that exceeded the threshold it was drawn under.
#[derive(Debug, Clone)]
struct Pooled {
    unit: Array1<f64>,
    physical: Array1<f64>,
    log_likelihood: f64,
}

/// Proposals drawn from a density model fit to the live points.
pub struct FlowProposal {
    estimator: Box<dyn DensityEstimator>,
    retrain_interval: usize,
    batch_size: usize,
    max_draws: usize,
    last_fit: Option<usize>,
    fits: usize,
    tracker: AcceptanceTracker,
    pool: VecDeque<Pooled>,
}

impl FlowProposal {
    pub fn new(estimator: Box<dyn DensityEstimator>, config: &NestedSamplerConfig) -> Self {
        Self {
            estimator,
            retrain_interval: config.retrain_interval(),
            batch_size: config.flow_batch_size.max(1),
            max_draws: config.max_flow_draws.max(1),
            last_fit: None,
            fits: 0,
            tracker: AcceptanceTracker::new(ACCEPTANCE_WINDOW),
            pool: VecDeque::new(),
        }
    }

    /// Successful fits so far.
    pub fn fits(&self) -> usize {
        self.fits
    }

    pub fn acceptance(&self) -> &AcceptanceTracker {
        &self.tracker
    }

    pub fn is_ready(&self) -> bool {
        self.estimator.is_fitted()
    }

    /// Evaluated samples waiting to be used by later iterations.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Whether a fit is due at `iteration`. A failed fit also waits a full interval.
    pub fn needs_fit(&self, iteration: usize) -> bool {
        match self.last_fit {
            None => true,
            Some(at) => iteration >= at + self.retrain_interval,
        }
    }

    /// Refits the model on the live unit-cube coordinates. A new model empties the pool.
    pub fn fit<R: Rng>(
        &mut self,
        live: &LivePointSet,
        iteration: usize,
        rng: &mut R,
    ) -> Result<FitReport> {
        self.last_fit = Some(iteration);
        let report = self.estimator.fit(live.unit_matrix().view(), rng)?;
        self.fits += 1;
        self.pool.clear();
        Ok(report)
    }

    /// Takes the oldest pooled sample above the threshold, dropping those below it.
    fn take_pooled(&mut self, c: &Constraint<'_, '_>, ids: &mut PointIds) -> Option<Point> {
        while let Some(p) = self.pool.pop_front() {
            if p.log_likelihood > c.threshold {
                return Some(c.point(ids, p.unit, p.physical, p.log_likelihood, Origin::Flow));
            }
        }
        None
    }

    /// Returns a pooled sample above the threshold, or draws batches from the model
    /// until one exceeds it.
    ///
    /// Returns `Ok(None)` when `max_flow_draws` batches produced nothing.
    pub fn propose<R: Rng>(
        &mut self,
        c: &Constraint<'_, '_>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Option<Point>> {
        if let Some(point) = self.take_pooled(c, ids) {
            return Ok(Some(point));
        }

        let live_log_q: Array1<f64> = self
            .estimator
            .log_density(c.live.unit_matrix().view())?
            .into_iter()
            .filter(|l| l.is_finite())
            .collect();
        let Ok(&reference) = live_log_q.min() else {
            return Ok(None);
        };
        let floor = reference - FLOW_DENSITY_MARGIN;

        for _ in 0..self.max_draws {
            let (candidates, log_q) = self.estimator.sample(self.batch_size, rng)?;
            let mut keep: Vec<usize> = (0..candidates.nrows())
                .filter(|&i| {
                    let lq = log_q[i];
                    candidates.row(i).as_slice().is_some_and(in_unit_cube)
                        && lq.is_finite()
                        && lq >= floor
                        && rng.gen::<f64>() < (reference - lq).exp()
                })
                .collect();
            if keep.is_empty() {
                continue;
            }
            if let Some(remaining) = c.remaining_calls() {
                if remaining == 0 {
                    return Err(c.budget_spent());
                }
                keep.truncate(remaining.try_into().unwrap_or(usize::MAX));
            }

            let survivors = candidates.select(Axis(0), &keep);
            let (physical, logl) = c.adapter.evaluate(survivors.view())?;
            for (k, &l) in logl.iter().enumerate() {
                let accepted = l > c.threshold;
                self.tracker.record(accepted);
                if accepted {
                    self.pool.push_back(Pooled {
                        unit: survivors.row(k).to_owned(),
                        physical: physical.row(k).to_owned(),
                        log_likelihood: l,
                    });
                }
            }
            if let Some(point) = self.take_pooled(c, ids) {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }
}

/// Owns the proposal state of a run and chooses the mechanism per iteration.
pub struct ProposalEngine {
    mode: ProposalMode,
    switch: f64,
    random_walk: RandomWalk,
    flow: Option<FlowProposal>,
    transitions: Vec<ModeTransition>,
    flow_fallbacks: usize,
    training_failures: usize,
}

impl ProposalEngine {
    /// Builds the engine for a `dim`-dimensional problem, with the configured flow when
    /// flow proposals are enabled.
    pub fn new(config: &NestedSamplerConfig, dim: usize) -> Self {
        let flow = config
            .flow_enabled()
            .then(|| FlowProposal::new(build_flow(config, dim), config));
        Self::assemble(config, dim, flow)
    }

    /// Builds the engine around a caller-supplied density estimator.
    pub fn with_estimator(
        config: &NestedSamplerConfig,
        dim: usize,
        estimator: Box<dyn DensityEstimator>,
    ) -> Self {
        let flow = config
            .flow_enabled()
            .then(|| FlowProposal::new(estimator, config));
        Self::assemble(config, dim, flow)
    }

    fn assemble(config: &NestedSamplerConfig, dim: usize, flow: Option<FlowProposal>) -> Self {
        Self {
            mode: ProposalMode::RandomWalk,
            switch: config.switch,
            random_walk: RandomWalk::new(dim, config),
            flow,
            transitions: Vec::new(),
            flow_fallbacks: 0,
            training_failures: 0,
        }
    }

    pub fn mode(&self) -> ProposalMode {
        self.mode
    }

    pub fn transitions(&self) -> &[ModeTransition] {
        &self.transitions
    }

    pub fn random_walk(&self) -> &RandomWalk {
        &self.random_walk
    }

    pub fn flow(&self) -> Option<&FlowProposal> {
        self.flow.as_ref()
    }

    pub fn flow_fits(&self) -> usize {
        self.flow.as_ref().map_or(0, FlowProposal::fits)
    }

    /// Flow-guided iterations that ended up using the random walk.
    pub fn flow_fallbacks(&self) -> usize {
        self.flow_fallbacks
    }

    pub fn training_failures(&self) -> usize {
        self.training_failures
    }

    pub fn widen_step(&mut self) {
        self.random_walk.widen_step();
    }

    /// Moves to flow-guided proposals once [`switch_ready`] fires. Never moves back.
    pub fn update_mode(
        &mut self,
        iteration: usize,
        dead_count: usize,
        log_volume: f64,
    ) -> Option<ModeTransition> {
        if self.mode == ProposalMode::FlowGuided
            || self.flow.is_none()
            || !switch_ready(self.switch, dead_count, log_volume)
        {
            return None;
        }
        let transition = ModeTransition {
            iteration,
            dead_count,
            log_volume,
            from: self.mode,
            to: ProposalMode::FlowGuided,
        };
        self.mode = ProposalMode::FlowGuided;
        self.transitions.push(transition);
        Some(transition)
    }

    /// Proposes a replacement strictly above `c.threshold`.
    pub fn propose<R: Rng>(
        &mut self,
        iteration: usize,
        c: &Constraint<'_, '_>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Point> {
        if self.mode == ProposalMode::FlowGuided {
            if let Some(point) = self.try_flow(iteration, c, rng, ids)? {
                return Ok(point);
            }
            self.flow_fallbacks += 1;
        }
        self.random_walk.propose(c, rng, ids)
    }

    fn try_flow<R: Rng>(
        &mut self,
        iteration: usize,
        c: &Constraint<'_, '_>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Option<Point>> {
        let Some(flow) = self.flow.as_mut() else {
            return Ok(None);
        };

        if flow.needs_fit(iteration) {
            match flow.fit(c.live, iteration, rng) {
                Ok(report) => debug!(
                    "iteration {iteration}: flow fit {} done, loss {:.4}",
                    flow.fits(),
                    report.final_loss
                ),
                Err(e) if e.is_recoverable() => {
                    self.training_failures += 1;
                    warn!("iteration {iteration}: {e}; keeping the previous model");
                }
                Err(e) => return Err(e),
            }
        }
        if !flow.is_ready() {
            return Ok(None);
        }

        match flow.propose(c, rng, ids) {
            Ok(point) => Ok(point),
            Err(e) if e.is_recoverable() => {
                warn!("iteration {iteration}: flow sampling failed: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
