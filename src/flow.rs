/*!
# Coupling-layer normalizing flows

Density estimators used for flow-guided proposals. The sampler only depends on the
[`DensityEstimator`] capability (`fit`, `sample`, `log_density`); the concrete
[`CouplingFlow`] is a stack of coupling blocks trained with the `burn` crate:

- [`FlowKind::Nvp`]: affine coupling (RealNVP), `y = x_a ⊕ (x_b ⊙ exp(s(x_a)) + t(x_a))`.
- [`FlowKind::Nice`]: additive coupling (NICE), `y = x_a ⊕ (x_b + t(x_a))`.

Consecutive blocks alternate which half of the coordinates is conditioned on. Inputs
are standardized with the mean and standard deviation of the training set before
entering the network, and the base density is a standard normal. All points exchanged
with the caller are in unit-cube coordinates.

```rust
use burn::backend::{Autodiff, NdArray};
use flownest::config::FlowKind;
use flownest::flow::{CouplingFlow, DensityEstimator, FlowSettings};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

let mut rng = SmallRng::seed_from_u64(0);
let data = Array2::from_shape_fn((64, 2), |_| 0.4 + 0.2 * rng.gen::<f64>());

let settings = FlowSettings { kind: FlowKind::Nvp, num_blocks: 2, hidden_dim: 16, ..Default::default() };
let mut flow = CouplingFlow::<Autodiff<NdArray>>::new(2, settings);
flow.fit(data.view(), &mut rng).unwrap();

let (points, log_q) = flow.sample(10, &mut rng).unwrap();
assert_eq!(points.dim(), (10, 2));
assert_eq!(log_q.len(), 10);
```
*/

use std::f64::consts::PI;

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::RngCore;
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::config::{FlowKind, NestedSamplerConfig};
use crate::dev_tools::Timer;
use crate::error::{NestError, Result};

/// CPU backend with autodiff used when no backend is chosen explicitly.
pub type DefaultBackend = Autodiff<NdArray>;

/// Smallest per-coordinate scale used to standardize training data.
const MIN_SCALE: f64 = 1e-12;

/// A density model over the unit cube with a fit/sample/evaluate contract.
pub trait DensityEstimator {
    /// Fits the model to `samples` (`[n, D]`, unit-cube coordinates), replacing any
    /// previous fit.
    fn fit(&mut self, samples: ArrayView2<f64>, rng: &mut dyn RngCore) -> Result<FitReport>;

    /// Draws `n` points and their log-densities.
    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Result<(Array2<f64>, Array1<f64>)>;

    /// Log-density of each row of `points`.
    fn log_density(&self, points: ArrayView2<f64>) -> Result<Array1<f64>>;

    fn is_fitted(&self) -> bool;
}

/// Outcome of a successful fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Mean negative log-likelihood of the training set at the last optimizer step.
    pub final_loss: f64,
    pub iterations: usize,
}

/// Capacity and training settings of a [`CouplingFlow`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    pub kind: FlowKind,
    pub num_blocks: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub train_iters: usize,
    pub learning_rate: f64,
    /// Jitter standard deviation in unit-cube units; disabled when not positive.
    pub noise: f64,
    pub seed: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            kind: FlowKind::Nvp,
            num_blocks: 4,
            hidden_dim: 32,
            num_layers: 1,
            train_iters: 50,
            learning_rate: 5e-3,
            noise: -1.0,
            seed: 0,
        }
    }
}

impl From<&NestedSamplerConfig> for FlowSettings {
    fn from(config: &NestedSamplerConfig) -> Self {
        Self {
            kind: config.flow,
            num_blocks: config.num_blocks,
            hidden_dim: config.hidden_dim,
            num_layers: config.num_layers,
            train_iters: config.train_iters,
            learning_rate: config.learning_rate,
            noise: config.noise,
            seed: config.seed,
        }
    }
}

/// Conditioner network of one coupling block: an MLP producing a log-scale and a shift.
#[derive(Module, Debug)]
pub struct CouplingNet<B: Backend> {
    hidden: Vec<Linear<B>>,
    scale: Linear<B>,
    shift: Linear<B>,
}

impl<B: Backend> CouplingNet<B> {
    fn new(dim: usize, hidden_dim: usize, num_layers: usize, device: &B::Device) -> Self {
        let hidden = (0..num_layers)
            .map(|i| {
                let d_in = if i == 0 { dim } else { hidden_dim };
                LinearConfig::new(d_in, hidden_dim).init(device)
            })
            .collect();
        // Zero-initialized heads make every block start as the identity map.
        let head = || {
            LinearConfig::new(hidden_dim, dim)
                .with_initializer(Initializer::Zeros)
                .init(device)
        };
        Self {
            hidden,
            scale: head(),
            shift: head(),
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self
            .hidden
            .iter()
            .fold(x, |h, layer| relu(layer.forward(h)));
        (self.scale.forward(h.clone()).tanh(), self.shift.forward(h))
    }
}

/// The stack of coupling blocks.
#[derive(Module, Debug)]
pub struct FlowNetwork<B: Backend> {
    blocks: Vec<CouplingNet<B>>,
}

/// Mask of shape `[n, dim]`, 1 on the coordinates block `block` conditions on.
fn coupling_mask<B: Backend>(n: usize, dim: usize, block: usize, device: &B::Device) -> Tensor<B, 2> {
    let row: Vec<f64> = (0..dim)
        .map(|i| if (i + block) % 2 == 0 { 1.0 } else { 0.0 })
        .collect();
    let data: Vec<f64> = row.iter().copied().cycle().take(n * dim).collect();
    Tensor::from_data(TensorData::new(data, [n, dim]).convert::<B::FloatElem>(), device)
}

impl<B: Backend> FlowNetwork<B> {
    fn new(dim: usize, settings: &FlowSettings, device: &B::Device) -> Self {
        let blocks = (0..settings.num_blocks)
            .map(|_| CouplingNet::new(dim, settings.hidden_dim, settings.num_layers, device))
            .collect();
        Self { blocks }
    }

    /// Maps data to the latent space, returning the latent points and `ln |det J|`.
    fn to_latent(&self, x: Tensor<B, 2>, affine: bool) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, dim] = x.dims();
        let device = x.device();
        let mut z = x;
        let mut log_det = Tensor::<B, 1>::zeros([n], &device);
        for (k, block) in self.blocks.iter().enumerate() {
            let mask = coupling_mask::<B>(n, dim, k, &device);
            let free = mask.clone().neg().add_scalar(1.0);
            let fixed = z.clone() * mask;
            let (s, t) = block.forward(fixed.clone());
            let t = t * free.clone();
            if affine {
                let s = s * free.clone();
                z = fixed + free * (z * s.clone().exp() + t);
                log_det = log_det + s.sum_dim(1).squeeze(1);
            } else {
                z = fixed + free * (z + t);
            }
        }
        (z, log_det)
    }

    /// Maps latent points back to data space.
    fn from_latent(&self, z: Tensor<B, 2>, affine: bool) -> Tensor<B, 2> {
        let [n, dim] = z.dims();
        let device = z.device();
        let mut x = z;
        for (k, block) in self.blocks.iter().enumerate().rev() {
            let mask = coupling_mask::<B>(n, dim, k, &device);
            let free = mask.clone().neg().add_scalar(1.0);
            let fixed = x.clone() * mask;
            let (s, t) = block.forward(fixed.clone());
            let t = t * free.clone();
            x = if affine {
                let s = s * free.clone();
                fixed + free * ((x - t) * s.neg().exp())
            } else {
                fixed + free * (x - t)
            };
        }
        x
    }

    /// Log-density of `x` under the flow with a standard normal base.
    fn log_prob(&self, x: Tensor<B, 2>, affine: bool) -> Tensor<B, 1> {
        let dim = x.dims()[1];
        let (z, log_det) = self.to_latent(x, affine);
        let base = z
            .powi_scalar(2)
            .sum_dim(1)
            .squeeze::<1>(1)
            .mul_scalar(-0.5)
            .sub_scalar(0.5 * dim as f64 * (2.0 * PI).ln());
        base + log_det
    }
}

fn standardize(u: ArrayView2<f64>, center: &Array1<f64>, scale: &Array1<f64>) -> Array2<f64> {
    (&u - &center.view().insert_axis(Axis(0))) / &scale.view().insert_axis(Axis(0))
}

fn to_tensor<B: Backend>(a: ArrayView2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (n, d) = a.dim();
    let data: Vec<f64> = a.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, [n, d]).convert::<B::FloatElem>(), device)
}

fn tensor_values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f64>> {
    t.into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| NestError::FlowTraining(format!("reading tensor data failed: {e:?}")))
}

/// A coupling-layer flow over the unit cube, trained on backend `B`.
pub struct CouplingFlow<B: AutodiffBackend> {
    dim: usize,
    settings: FlowSettings,
    device: B::Device,
    model: Option<FlowNetwork<B>>,
    /// Standardization of the last training set.
    center: Array1<f64>,
    scale: Array1<f64>,
    fits: usize,
}

impl<B: AutodiffBackend> CouplingFlow<B> {
    pub fn new(dim: usize, settings: FlowSettings) -> Self {
        Self {
            dim,
            settings,
            device: B::Device::default(),
            model: None,
            center: Array1::zeros(dim),
            scale: Array1::ones(dim),
            fits: 0,
        }
    }

    /// Number of completed fits.
    pub fn fits(&self) -> usize {
        self.fits
    }

    fn affine(&self) -> bool {
        self.settings.kind == FlowKind::Nvp
    }

    fn standardize(&self, u: ArrayView2<f64>) -> Array2<f64> {
        standardize(u, &self.center, &self.scale)
    }

    /// `ln |du/dy|` of the standardization, the same for every point.
    fn log_scale_sum(&self) -> f64 {
        self.scale.iter().map(|s| s.ln()).sum()
    }

    fn check_width(&self, points: ArrayView2<f64>) -> Result<()> {
        if points.ncols() != self.dim {
            return Err(NestError::ShapeMismatch {
                context: "flow input",
                expected: vec![points.nrows(), self.dim],
                found: points.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn fitted_model(&self) -> Result<FlowNetwork<B::InnerBackend>> {
        self.model
            .as_ref()
            .map(|m| m.valid())
            .ok_or_else(|| NestError::FlowTraining("the flow has not been fitted".into()))
    }
}

impl<B: AutodiffBackend> DensityEstimator for CouplingFlow<B> {
    fn fit(&mut self, samples: ArrayView2<f64>, rng: &mut dyn RngCore) -> Result<FitReport> {
        self.check_width(samples)?;
        let n = samples.nrows();
        if n < 2 {
            return Err(NestError::FlowTraining(format!(
                "need at least two training points, got {n}"
            )));
        }

        let mut timer = Timer::new();
        let center = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| NestError::FlowTraining("empty training set".into()))?;
        let scale = samples.std_axis(Axis(0), 0.0).mapv(|s| s.max(MIN_SCALE));
        if center.iter().chain(scale.iter()).any(|v| !v.is_finite()) {
            return Err(NestError::FlowTraining(
                "training set has non-finite coordinates".into(),
            ));
        }

        B::seed(self.settings.seed.wrapping_add(self.fits as u64));
        let affine = self.affine();
        let mut model = FlowNetwork::<B>::new(self.dim, &self.settings, &self.device);
        let mut optim = AdamConfig::new().init();
        let jitter = if self.settings.noise > 0.0 {
            Normal::new(0.0, self.settings.noise).ok()
        } else {
            None
        };

        let mut final_loss = f64::NAN;
        for iter in 0..self.settings.train_iters {
            let batch = match &jitter {
                Some(normal) => {
                    let noisy = samples.mapv(|u| u + normal.sample(&mut *rng));
                    standardize(noisy.view(), &center, &scale)
                }
                None => standardize(samples, &center, &scale),
            };
            let x = to_tensor::<B>(batch.view(), &self.device);
            let loss = model.log_prob(x, affine).mean().neg();
            final_loss = loss.clone().into_scalar().to_f64();
            if !final_loss.is_finite() {
                return Err(NestError::FlowTraining(format!(
                    "loss became {final_loss} at iteration {iter}"
                )));
            }
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(self.settings.learning_rate, model, grads);
        }

        // A failed fit leaves the previous model and its standardization in place.
        self.model = Some(model);
        self.center = center;
        self.scale = scale;
        self.fits += 1;
        timer.log(format!(
            "fitted {} flow on {n} points, loss {final_loss:.4}",
            self.settings.kind
        ));
        Ok(FitReport {
            final_loss,
            iterations: self.settings.train_iters,
        })
    }

    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Result<(Array2<f64>, Array1<f64>)> {
        let model = self.fitted_model()?;
        if n == 0 {
            return Ok((Array2::zeros((0, self.dim)), Array1::zeros(0)));
        }
        let z: Vec<f64> = (0..n * self.dim)
            .map(|_| StandardNormal.sample(&mut *rng))
            .collect();
        let z = Tensor::<B::InnerBackend, 2>::from_data(
            TensorData::new(z, [n, self.dim])
                .convert::<<B::InnerBackend as Backend>::FloatElem>(),
            &self.device,
        );
        let y = model.from_latent(z, self.affine());
        let y = Array2::from_shape_vec((n, self.dim), tensor_values(y)?)
            .map_err(|e| NestError::FlowTraining(e.to_string()))?;
        let u = &y * &self.scale.view().insert_axis(Axis(0))
            + &self.center.view().insert_axis(Axis(0));
        let log_q = self.log_density(u.view())?;
        Ok((u, log_q))
    }

    fn log_density(&self, points: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.check_width(points)?;
        let model = self.fitted_model()?;
        if points.nrows() == 0 {
            return Ok(Array1::zeros(0));
        }
        let y = self.standardize(points);
        let x = to_tensor::<B::InnerBackend>(y.view(), &self.device);
        let log_q = tensor_values(model.log_prob(x, self.affine()))?;
        let correction = self.log_scale_sum();
        Ok(log_q.into_iter().map(|l| l - correction).collect())
    }

    fn is_fitted(&self) -> bool {
        self.model.is_some()
    }
}

/// Builds the density estimator configured for a run on the default backend.
pub fn build_flow(config: &NestedSamplerConfig, dim: usize) -> Box<dyn DensityEstimator> {
    Box::new(CouplingFlow::<DefaultBackend>::new(
        dim,
        FlowSettings::from(config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    type BackendType = Autodiff<NdArray>;

    fn settings(kind: FlowKind, train_iters: usize) -> FlowSettings {
        FlowSettings {
            kind,
            num_blocks: 2,
            hidden_dim: 16,
            num_layers: 1,
            train_iters,
            learning_rate: 5e-3,
            noise: -1.0,
            seed: 7,
        }
    }

    fn box_data(rng: &mut SmallRng, n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(_, j)| {
            if j == 0 {
                0.2 + 0.1 * rng.gen::<f64>()
            } else {
                0.6 + 0.3 * rng.gen::<f64>()
            }
        })
    }

    #[test]
    fn unfitted_flow_refuses_to_sample() {
        let flow = CouplingFlow::<BackendType>::new(2, settings(FlowKind::Nvp, 5));
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(!flow.is_fitted());
        assert!(matches!(
            flow.sample(3, &mut rng),
            Err(NestError::FlowTraining(_))
        ));
    }

    #[test]
    fn untrained_fit_is_the_standardized_gaussian() {
        let mut rng = SmallRng::seed_from_u64(1);
        let data = box_data(&mut rng, 200);
        let mut flow = CouplingFlow::<BackendType>::new(2, settings(FlowKind::Nvp, 0));
        flow.fit(data.view(), &mut rng).unwrap();

        let center = data.mean_axis(Axis(0)).unwrap();
        let scale = data.std_axis(Axis(0), 0.0);
        let at_center = flow
            .log_density(center.view().insert_axis(Axis(0)))
            .unwrap()[0];
        let expected = -(2.0 * PI).ln() - scale.mapv(f64::ln).sum();
        assert_abs_diff_eq!(at_center, expected, epsilon = 1e-3);
    }

    #[test]
    fn samples_follow_the_training_data() {
        let mut rng = SmallRng::seed_from_u64(2);
        let data = box_data(&mut rng, 256);
        let mut flow = CouplingFlow::<BackendType>::new(2, settings(FlowKind::Nvp, 30));
        let report = flow.fit(data.view(), &mut rng).unwrap();
        assert!(report.final_loss.is_finite());
        assert_eq!(flow.fits(), 1);

        let (points, log_q) = flow.sample(500, &mut rng).unwrap();
        assert_eq!(points.dim(), (500, 2));
        assert!(log_q.iter().all(|l| l.is_finite()));
        let mean = points.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean[0], 0.25, epsilon = 0.05);
        assert_abs_diff_eq!(mean[1], 0.75, epsilon = 0.08);
    }

    #[test]
    fn sample_log_density_matches_evaluation() {
        let mut rng = SmallRng::seed_from_u64(3);
        let data = box_data(&mut rng, 128);
        for kind in [FlowKind::Nvp, FlowKind::Nice] {
            let mut flow = CouplingFlow::<BackendType>::new(2, settings(kind, 10));
            flow.fit(data.view(), &mut rng).unwrap();
            let (points, log_q) = flow.sample(20, &mut rng).unwrap();
            let again = flow.log_density(points.view()).unwrap();
            assert_abs_diff_eq!(log_q, again, epsilon = 1e-9);
        }
    }

    #[test]
    fn fit_rejects_tiny_or_misshaped_sets() {
        let mut rng = SmallRng::seed_from_u64(4);
        let mut flow = CouplingFlow::<BackendType>::new(2, settings(FlowKind::Nvp, 1));
        assert!(flow.fit(Array2::zeros((1, 2)).view(), &mut rng).is_err());
        assert!(matches!(
            flow.fit(Array2::zeros((10, 3)).view(), &mut rng),
            Err(NestError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn jitter_still_trains() {
        let mut rng = SmallRng::seed_from_u64(5);
        let data = box_data(&mut rng, 64);
        let mut s = settings(FlowKind::Nvp, 5);
        s.noise = 0.01;
        let mut flow = CouplingFlow::<BackendType>::new(2, s);
        assert!(flow.fit(data.view(), &mut rng).is_ok());
    }
}
