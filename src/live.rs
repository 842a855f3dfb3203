//! The live-point population.

use log::debug;
use ndarray::{Array2, Axis};
use rand::Rng;

use crate::error::{NestError, Result};
use crate::likelihood::Adapter;
use crate::point::{Origin, Point, PointIds};

/// Maximum number of draw rounds when initializing the live set.
pub const MAX_INIT_ROUNDS: usize = 100;

/// A fixed-size set of live points kept sorted by `(log_likelihood, id)`.
///
/// The first element is always the worst point; ties in likelihood are broken by
/// insertion order, so the earliest inserted point is removed first.
#[derive(Debug, Clone)]
pub struct LivePointSet {
    points: Vec<Point>,
}

fn rank(p: &Point) -> (f64, u64) {
    (p.log_likelihood, p.id)
}

fn precedes(a: &Point, b: &Point) -> bool {
    let (la, ia) = rank(a);
    let (lb, ib) = rank(b);
    la < lb || (la == lb && ia < ib)
}

impl LivePointSet {
    /// Draws `n` i.i.d. uniform points with finite likelihood.
    ///
    /// Points whose likelihood is not finite are discarded and redrawn; after
    /// [`MAX_INIT_ROUNDS`] rounds the call fails with [`NestError::Initialization`].
    pub fn initialize<R: Rng + ?Sized>(
        n: usize,
        adapter: &Adapter<'_>,
        rng: &mut R,
        ids: &mut PointIds,
    ) -> Result<Self> {
        let dim = adapter.dim();
        let mut points: Vec<Point> = Vec::with_capacity(n);

        for round in 0..MAX_INIT_ROUNDS {
            let missing = n - points.len();
            if missing == 0 {
                break;
            }
            let unit = Array2::from_shape_fn((missing, dim), |_| rng.gen::<f64>());
            let (physical, logl) = adapter.evaluate(unit.view())?;
            let before = points.len();
            for (i, &l) in logl.iter().enumerate() {
                if l.is_finite() {
                    points.push(Point {
                        id: ids.next_id(),
                        unit: unit.row(i).to_owned(),
                        physical: physical.row(i).to_owned(),
                        log_likelihood: l,
                        log_volume: Some(0.0),
                        origin: Origin::Initial,
                    });
                }
            }
            if points.len() - before < missing {
                debug!(
                    "init round {round}: {} of {missing} draws had a finite likelihood",
                    points.len() - before
                );
            }
        }

        if points.len() < n {
            return Err(NestError::Initialization {
                found: points.len(),
                needed: n,
                rounds: MAX_INIT_ROUNDS,
            });
        }

        Ok(Self::from_points(points))
    }

    /// Builds a live set from already evaluated points.
    pub fn from_points(mut points: Vec<Point>) -> Self {
        points.sort_by(|a, b| {
            a.log_likelihood
                .total_cmp(&b.log_likelihood)
                .then(a.id.cmp(&b.id))
        });
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The point with the lowest log-likelihood.
    pub fn worst(&self) -> Option<&Point> {
        self.points.first()
    }

    /// The highest log-likelihood in the set.
    pub fn max_log_likelihood(&self) -> f64 {
        self.points
            .last()
            .map_or(f64::NEG_INFINITY, |p| p.log_likelihood)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Point> {
        self.points.get(index)
    }

    /// A uniformly chosen live point.
    pub fn random_member<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Point> {
        if self.points.is_empty() {
            return None;
        }
        self.points.get(rng.gen_range(0..self.points.len()))
    }

    /// Unit-cube coordinates of all live points as an `[n, D]` array.
    pub fn unit_matrix(&self) -> Array2<f64> {
        let dim = self.points.first().map_or(0, Point::dim);
        let mut out = Array2::zeros((self.points.len(), dim));
        for (mut row, p) in out.axis_iter_mut(Axis(0)).zip(&self.points) {
            row.assign(&p.unit);
        }
        out
    }

    /// Removes the point `old_id` and inserts `new`.
    ///
    /// `new` must strictly exceed `threshold`; anything else means the proposal
    /// machinery handed back an invalid point and is reported as an invariant
    /// violation without touching the set.
    pub fn replace(&mut self, old_id: u64, new: Point, threshold: f64) -> Result<Point> {
        if !(new.log_likelihood > threshold) {
            return Err(NestError::InvariantViolation(format!(
                "replacement {} has ln L = {} which does not exceed ln L* = {threshold}",
                new.id, new.log_likelihood
            )));
        }
        if self.points.iter().any(|p| p.id == new.id) {
            return Err(NestError::InvariantViolation(format!(
                "point {} is already live",
                new.id
            )));
        }
        let pos = self
            .points
            .iter()
            .position(|p| p.id == old_id)
            .ok_or_else(|| {
                NestError::InvariantViolation(format!("point {old_id} is not live"))
            })?;
        let old = self.points.remove(pos);
        let at = self.points.partition_point(|p| precedes(p, &new));
        self.points.insert(at, new);
        Ok(old)
    }

    /// Consumes the set, returning its points in ascending likelihood order.
    pub fn into_sorted_points(self) -> Vec<Point> {
        self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::IdentityTransform;
    use ndarray::{array, Array1, ArrayView2};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn point(id: u64, logl: f64) -> Point {
        Point {
            id,
            unit: array![0.5],
            physical: array![0.5],
            log_likelihood: logl,
            log_volume: None,
            origin: Origin::Initial,
        }
    }

    fn sum_loglike(x: ArrayView2<f64>) -> Array1<f64> {
        x.sum_axis(Axis(1))
    }

    #[test]
    fn initialize_fills_the_set() {
        let adapter = Adapter::new(&sum_loglike, &IdentityTransform, 3);
        let mut rng = SmallRng::seed_from_u64(42);
        let mut ids = PointIds::new();
        let live = LivePointSet::initialize(50, &adapter, &mut rng, &mut ids).unwrap();
        assert_eq!(live.len(), 50);
        assert_eq!(adapter.calls(), 50);
        let logls: Vec<f64> = live.iter().map(|p| p.log_likelihood).collect();
        assert!(logls.windows(2).all(|w| w[0] <= w[1]));
        assert!(live
            .iter()
            .all(|p| p.unit.iter().all(|u| (0.0..1.0).contains(u))));
    }

    #[test]
    fn initialize_redraws_non_finite_points() {
        let half_nan = |x: ArrayView2<f64>| -> Array1<f64> {
            x.map_axis(Axis(1), |r| if r[0] < 0.5 { f64::NAN } else { r[0] })
        };
        let adapter = Adapter::new(&half_nan, &IdentityTransform, 1);
        let mut rng = SmallRng::seed_from_u64(1);
        let live = LivePointSet::initialize(40, &adapter, &mut rng, &mut PointIds::new()).unwrap();
        assert_eq!(live.len(), 40);
        assert!(live.iter().all(|p| p.log_likelihood.is_finite()));
        assert!(adapter.calls() > 40);
    }

    #[test]
    fn initialize_gives_up() {
        let all_nan = |x: ArrayView2<f64>| -> Array1<f64> { Array1::from_elem(x.nrows(), f64::NAN) };
        let adapter = Adapter::new(&all_nan, &IdentityTransform, 2);
        let mut rng = SmallRng::seed_from_u64(3);
        let err = LivePointSet::initialize(10, &adapter, &mut rng, &mut PointIds::new()).unwrap_err();
        assert_eq!(
            err,
            NestError::Initialization {
                found: 0,
                needed: 10,
                rounds: MAX_INIT_ROUNDS
            }
        );
    }

    #[test]
    fn worst_breaks_ties_by_insertion_order() {
        let live = LivePointSet::from_points(vec![point(3, 1.0), point(1, 1.0), point(2, 2.0)]);
        assert_eq!(live.worst().unwrap().id, 1);
        assert_eq!(live.max_log_likelihood(), 2.0);
    }

    #[test]
    fn replace_keeps_size_and_order() {
        let mut live = LivePointSet::from_points(vec![point(0, 0.0), point(1, 1.0), point(2, 3.0)]);
        let old = live.replace(0, point(3, 2.0), 0.0).unwrap();
        assert_eq!(old.id, 0);
        assert_eq!(live.len(), 3);
        let ids: Vec<u64> = live.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn replace_rejects_points_at_threshold() {
        let mut live = LivePointSet::from_points(vec![point(0, 0.0), point(1, 1.0)]);
        let err = live.replace(0, point(2, 0.0), 0.0).unwrap_err();
        assert!(matches!(err, NestError::InvariantViolation(_)));
        let err = live.replace(0, point(2, f64::NAN), 0.0).unwrap_err();
        assert!(matches!(err, NestError::InvariantViolation(_)));
        assert_eq!(live.len(), 2);
        assert_eq!(live.worst().unwrap().id, 0);
    }

    #[test]
    fn replace_rejects_duplicates_and_unknown_ids() {
        let mut live = LivePointSet::from_points(vec![point(0, 0.0), point(1, 1.0)]);
        assert!(live.replace(0, point(1, 5.0), 0.0).is_err());
        assert!(live.replace(7, point(2, 5.0), 0.0).is_err());
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn unit_matrix_has_one_row_per_point() {
        let live = LivePointSet::from_points(vec![point(0, 0.0), point(1, 1.0)]);
        assert_eq!(live.unit_matrix().shape(), &[2, 1]);
    }
}
