/*!
User-facing likelihood and prior-transform traits, and the [`Adapter`] that applies
them to batches of unit-cube points.

Both traits are vectorized over the batch (row) dimension and are implemented for
closures with the matching signature:

```rust
use flownest::likelihood::{Adapter, LogLikelihood, PriorTransform};
use ndarray::{array, Array1, Array2, ArrayView2, Axis};

let loglike = |x: ArrayView2<f64>| -> Array1<f64> {
    x.map_axis(Axis(1), |row| -0.5 * row.dot(&row))
};
let transform = |u: ArrayView2<f64>| -> Array2<f64> { u.mapv(|v| 10.0 * v - 5.0) };

let adapter = Adapter::new(&loglike, &transform, 2);
let (physical, logl) = adapter.evaluate(array![[0.5, 0.5]].view()).unwrap();
assert_eq!(physical, array![[0.0, 0.0]]);
assert_eq!(logl[0], 0.0);
assert_eq!(adapter.calls(), 1);
```
*/

use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{NestError, Result};

/// A log-likelihood evaluated on a batch of physical points of shape `[n, D]`.
pub trait LogLikelihood: Send + Sync {
    /// Returns one log-likelihood per row of `physical`.
    fn log_likelihood(&self, physical: ArrayView2<f64>) -> Array1<f64>;
}

impl<F> LogLikelihood for F
where
    F: Fn(ArrayView2<f64>) -> Array1<f64> + Send + Sync,
{
    fn log_likelihood(&self, physical: ArrayView2<f64>) -> Array1<f64> {
        self(physical)
    }
}

/// Maps a batch of unit-cube points of shape `[n, D]` to physical space.
pub trait PriorTransform: Send + Sync {
    fn transform(&self, unit: ArrayView2<f64>) -> Array2<f64>;
}

impl<F> PriorTransform for F
where
    F: Fn(ArrayView2<f64>) -> Array2<f64> + Send + Sync,
{
    fn transform(&self, unit: ArrayView2<f64>) -> Array2<f64> {
        self(unit)
    }
}

/// The identity transform: the unit cube is the parameter space.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl PriorTransform for IdentityTransform {
    fn transform(&self, unit: ArrayView2<f64>) -> Array2<f64> {
        unit.to_owned()
    }
}

/// Applies the prior transform and the log-likelihood to batches of unit-cube points,
/// validating shapes and counting evaluations.
pub struct Adapter<'a> {
    loglike: &'a dyn LogLikelihood,
    transform: &'a dyn PriorTransform,
    dim: usize,
    calls: AtomicU64,
}

impl<'a> Adapter<'a> {
    pub fn new(
        loglike: &'a dyn LogLikelihood,
        transform: &'a dyn PriorTransform,
        dim: usize,
    ) -> Self {
        Self {
            loglike,
            transform,
            dim,
            calls: AtomicU64::new(0),
        }
    }

    /// Dimensionality of the parameter space.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of likelihood evaluations so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Transforms `unit` and evaluates the likelihood on every row.
    ///
    /// Non-finite log-likelihoods are replaced by `-inf` so that they are always
    /// rejected against any finite threshold.
    pub fn evaluate(&self, unit: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>)> {
        let n = unit.nrows();
        if unit.ncols() != self.dim {
            return Err(NestError::ShapeMismatch {
                context: "unit-cube batch",
                expected: vec![n, self.dim],
                found: unit.shape().to_vec(),
            });
        }
        if n == 0 {
            return Ok((Array2::zeros((0, self.dim)), Array1::zeros(0)));
        }

        let physical = self.transform.transform(unit);
        if physical.shape() != [n, self.dim] {
            return Err(NestError::ShapeMismatch {
                context: "prior transform output",
                expected: vec![n, self.dim],
                found: physical.shape().to_vec(),
            });
        }

        let logl = self.loglike.log_likelihood(physical.view());
        self.calls.fetch_add(n as u64, Ordering::Relaxed);
        if logl.len() != n {
            return Err(NestError::ShapeMismatch {
                context: "log-likelihood output",
                expected: vec![n],
                found: vec![logl.len()],
            });
        }

        let logl = logl.mapv_into(|l| if l.is_finite() { l } else { f64::NEG_INFINITY });
        Ok((physical, logl))
    }

    /// Evaluates a single unit-cube point.
    pub fn evaluate_point(&self, unit: &[f64]) -> Result<(Array1<f64>, f64)> {
        let batch = ArrayView2::from_shape((1, unit.len()), unit).map_err(|_| {
            NestError::ShapeMismatch {
                context: "unit-cube point",
                expected: vec![self.dim],
                found: vec![unit.len()],
            }
        })?;
        let (physical, logl) = self.evaluate(batch)?;
        let row = physical.index_axis_move(Axis(0), 0);
        Ok((row, logl[0]))
    }
}

/// Whether every coordinate lies in the closed unit interval.
pub fn in_unit_cube(u: &[f64]) -> bool {
    u.iter().all(|&x| (0.0..=1.0).contains(&x))
}
