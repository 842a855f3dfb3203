/*!
# Run configuration

[`NestedSamplerConfig`] collects every option the sampler recognizes. Defaults follow
the usual command-line defaults of the reference driver scripts (1000 live points,
automatic random-walk chain length, flow proposals disabled). Options are set builder-style:

```rust
use flownest::config::{FlowKind, NestedSamplerConfig};

let config = NestedSamplerConfig::default()
    .set_num_live_points(200)
    .set_mcmc_steps(5)
    .set_flow(FlowKind::Nvp)
    .set_switch(500.0)
    .set_seed(42);
assert!(config.validate(2).is_ok());
```
*/

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{NestError, Result};

/// Random-walk steps per dimension when `mcmc_steps` is 0.
pub const AUTO_STEPS_PER_DIM: usize = 5;
/// Lower bound of the automatic random-walk chain length.
pub const AUTO_MIN_STEPS: usize = 25;

/// The family of generative flow used for flow-guided proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowKind {
    /// Affine coupling layers (RealNVP).
    #[default]
    Nvp,
    /// Additive, volume-preserving coupling layers (NICE).
    Nice,
}

impl FromStr for FlowKind {
    type Err = NestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nvp" | "realnvp" => Ok(FlowKind::Nvp),
            "nice" | "additive" => Ok(FlowKind::Nice),
            other => Err(NestError::InvalidConfig(format!(
                "unknown flow '{other}', expected 'nvp' or 'nice'"
            ))),
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Nvp => write!(f, "nvp"),
            FlowKind::Nice => write!(f, "nice"),
        }
    }
}

/// Settings for a nested sampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedSamplerConfig {
    /// Size of the live-point population.
    pub num_live_points: usize,
    /// Constrained random-walk steps per replacement. 0 picks the chain length from the
    /// dimension, see [`chain_length`](Self::chain_length).
    pub mcmc_steps: usize,
    /// Flow family for flow-guided proposals.
    pub flow: FlowKind,
    /// Number of coupling blocks in the flow.
    pub num_blocks: usize,
    /// Width of the hidden layers of each coupling network.
    pub hidden_dim: usize,
    /// Number of hidden layers of each coupling network.
    pub num_layers: usize,
    /// Optimizer steps per flow fit.
    pub train_iters: usize,
    /// Switch point to flow proposals. Negative disables flow proposals, values in
    /// `[0, 1)` are a prior-volume fraction, values `>= 1` a dead-point count.
    pub switch: f64,
    /// Standard deviation of the jitter added to flow training inputs; negative disables it.
    pub noise: f64,
    /// Number of leading coordinates that are slow to evaluate.
    pub num_slow: usize,
    /// Equal-weight posterior samples to draw after the run.
    pub test_samples: usize,
    /// Random-walk steps used to decorrelate each resampled posterior draw.
    pub test_mcmc_steps: usize,
    /// Iterations between progress reports. `None` disables reporting.
    pub log_interval: Option<usize>,
    /// Output directory owned by the caller's logging layer. Not used by the engine.
    pub log_dir: Option<PathBuf>,
    /// Whether the caller's logging layer appends a run number to `log_dir`.
    pub append_run_num: bool,

    /// Global seed; every random stream of a run is derived from it.
    pub seed: u64,
    /// Stop once `ln(Z + L_max X) - ln Z` drops below this value.
    pub dlogz: f64,
    /// Hard cap on iterations.
    pub max_iterations: Option<usize>,
    /// Hard cap on likelihood evaluations made while sampling. A replacement search that
    /// reaches it is abandoned and the run ends with the iterations completed so far.
    /// Posterior refinement runs after the loop and is not capped.
    pub max_likelihood_calls: Option<u64>,
    /// Candidates a single replacement search may try before giving up.
    pub max_proposal_attempts: usize,
    /// Iterations between flow refits; defaults to `num_live_points`.
    pub flow_retrain_interval: Option<usize>,
    /// Candidates drawn from the flow per batch.
    pub flow_batch_size: usize,
    /// Flow batches drawn before falling back to the random walk for an iteration.
    pub max_flow_draws: usize,
    /// Adam learning rate for flow fits.
    pub learning_rate: f64,
    /// Every `slow_period`-th random-walk step moves the slow coordinates.
    pub slow_period: usize,
    /// Show an interactive spinner with progress messages.
    pub show_progress: bool,
}

impl Default for NestedSamplerConfig {
    fn default() -> Self {
        Self {
            num_live_points: 1000,
            mcmc_steps: 0,
            flow: FlowKind::Nvp,
            num_blocks: 5,
            hidden_dim: 128,
            num_layers: 1,
            train_iters: 50,
            switch: -1.0,
            noise: -1.0,
            num_slow: 0,
            test_samples: 0,
            test_mcmc_steps: 1000,
            log_interval: None,
            log_dir: None,
            append_run_num: true,
            seed: 0,
            dlogz: 0.5,
            max_iterations: None,
            max_likelihood_calls: None,
            max_proposal_attempts: 10_000,
            flow_retrain_interval: None,
            flow_batch_size: 100,
            max_flow_draws: 20,
            learning_rate: 5e-3,
            slow_period: 5,
            show_progress: false,
        }
    }
}

impl NestedSamplerConfig {
    pub fn set_num_live_points(mut self, n: usize) -> Self {
        self.num_live_points = n;
        self
    }

    pub fn set_mcmc_steps(mut self, steps: usize) -> Self {
        self.mcmc_steps = steps;
        self
    }

    pub fn set_flow(mut self, flow: FlowKind) -> Self {
        self.flow = flow;
        self
    }

    /// Sets the flow capacity: coupling blocks, hidden width and hidden depth.
    pub fn set_flow_capacity(mut self, num_blocks: usize, hidden_dim: usize, num_layers: usize) -> Self {
        self.num_blocks = num_blocks;
        self.hidden_dim = hidden_dim;
        self.num_layers = num_layers;
        self
    }

    pub fn set_train_iters(mut self, iters: usize) -> Self {
        self.train_iters = iters;
        self
    }

    pub fn set_switch(mut self, switch: f64) -> Self {
        self.switch = switch;
        self
    }

    pub fn set_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    pub fn set_num_slow(mut self, num_slow: usize) -> Self {
        self.num_slow = num_slow;
        self
    }

    /// Sets posterior resampling size and the refinement steps per resampled point.
    pub fn set_test_samples(mut self, samples: usize, mcmc_steps: usize) -> Self {
        self.test_samples = samples;
        self.test_mcmc_steps = mcmc_steps;
        self
    }

    pub fn set_log_interval(mut self, interval: usize) -> Self {
        self.log_interval = Some(interval);
        self
    }

    pub fn set_log_dir(mut self, dir: impl Into<PathBuf>, append_run_num: bool) -> Self {
        self.log_dir = Some(dir.into());
        self.append_run_num = append_run_num;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_dlogz(mut self, dlogz: f64) -> Self {
        self.dlogz = dlogz;
        self
    }

    pub fn set_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn set_max_likelihood_calls(mut self, max: u64) -> Self {
        self.max_likelihood_calls = Some(max);
        self
    }

    pub fn set_max_proposal_attempts(mut self, max: usize) -> Self {
        self.max_proposal_attempts = max;
        self
    }

    pub fn set_flow_retrain_interval(mut self, interval: usize) -> Self {
        self.flow_retrain_interval = Some(interval);
        self
    }

    pub fn set_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn set_slow_period(mut self, period: usize) -> Self {
        self.slow_period = period;
        self
    }

    pub fn set_show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Iterations between flow refits.
    pub fn retrain_interval(&self) -> usize {
        self.flow_retrain_interval
            .unwrap_or(self.num_live_points)
            .max(1)
    }

    /// Random-walk steps per replacement for a `dim`-dimensional problem:
    /// `mcmc_steps`, or `max(AUTO_MIN_STEPS, AUTO_STEPS_PER_DIM * dim)` when it is 0.
    pub fn chain_length(&self, dim: usize) -> usize {
        if self.mcmc_steps > 0 {
            self.mcmc_steps
        } else {
            (AUTO_STEPS_PER_DIM * dim).max(AUTO_MIN_STEPS)
        }
    }

    /// Whether flow proposals can ever be used in this run.
    pub fn flow_enabled(&self) -> bool {
        self.switch >= 0.0
    }

    /// Checks every option against the dimensionality `dim` of the problem.
    pub fn validate(&self, dim: usize) -> Result<()> {
        let invalid = |msg: String| Err(NestError::InvalidConfig(msg));
        if dim == 0 {
            return invalid("the parameter space must have at least one dimension".into());
        }
        if self.num_live_points == 0 {
            return invalid("num_live_points must be positive".into());
        }
        if self.num_slow > dim {
            return invalid(format!(
                "num_slow = {} exceeds the dimensionality {dim}",
                self.num_slow
            ));
        }
        if self.switch.is_nan() {
            return invalid("switch must not be NaN".into());
        }
        if self.noise.is_nan() {
            return invalid("noise must not be NaN".into());
        }
        if !(self.dlogz > 0.0) {
            return invalid(format!("dlogz must be positive, got {}", self.dlogz));
        }
        if self.max_proposal_attempts == 0 {
            return invalid("max_proposal_attempts must be positive".into());
        }
        if self.chain_length(dim) >= self.max_proposal_attempts {
            return invalid(format!(
                "a random-walk chain of {} steps does not fit in max_proposal_attempts = {}",
                self.chain_length(dim),
                self.max_proposal_attempts
            ));
        }
        if self.log_interval == Some(0) {
            return invalid("log_interval must be positive".into());
        }
        if self.slow_period == 0 {
            return invalid("slow_period must be positive".into());
        }
        if self.flow_enabled() {
            if self.num_blocks == 0 || self.hidden_dim == 0 || self.num_layers == 0 {
                return invalid(
                    "num_blocks, hidden_dim and num_layers must be positive when flow proposals are enabled"
                        .into(),
                );
            }
            if self.flow_batch_size == 0 || self.max_flow_draws == 0 {
                return invalid("flow_batch_size and max_flow_draws must be positive".into());
            }
            if !(self.learning_rate > 0.0) {
                return invalid(format!(
                    "learning_rate must be positive, got {}",
                    self.learning_rate
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NestedSamplerConfig::default();
        assert!(config.validate(2).is_ok());
        assert!(!config.flow_enabled());
        assert_eq!(config.retrain_interval(), 1000);
    }

    #[test]
    fn flow_kind_parses() {
        assert_eq!("nvp".parse::<FlowKind>().unwrap(), FlowKind::Nvp);
        assert_eq!("NICE".parse::<FlowKind>().unwrap(), FlowKind::Nice);
        assert!("maf".parse::<FlowKind>().is_err());
        assert_eq!(FlowKind::Nvp.to_string(), "nvp");
    }

    #[test]
    fn rejects_bad_values() {
        let base = NestedSamplerConfig::default();
        assert!(base.clone().set_num_live_points(0).validate(2).is_err());
        assert!(base.clone().set_num_slow(3).validate(2).is_err());
        assert!(base.clone().set_dlogz(0.0).validate(2).is_err());
        assert!(base.clone().set_log_interval(0).validate(2).is_err());
        assert!(base
            .clone()
            .set_switch(10.0)
            .set_flow_capacity(0, 16, 1)
            .validate(2)
            .is_err());
        assert!(base.validate(0).is_err());
    }

    #[test]
    fn zero_mcmc_steps_picks_a_chain_length() {
        let config = NestedSamplerConfig::default();
        assert_eq!(config.chain_length(2), AUTO_MIN_STEPS);
        assert_eq!(config.chain_length(10), 50);
        assert_eq!(config.clone().set_mcmc_steps(3).chain_length(10), 3);
        assert!(config
            .clone()
            .set_max_proposal_attempts(20)
            .validate(2)
            .is_err());
        assert!(config
            .set_mcmc_steps(5)
            .set_max_proposal_attempts(20)
            .validate(2)
            .is_ok());
    }

    #[test]
    fn num_slow_equal_to_dim_is_allowed() {
        let config = NestedSamplerConfig::default().set_num_slow(2);
        assert!(config.validate(2).is_ok());
    }
}
