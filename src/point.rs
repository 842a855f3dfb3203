//! Evaluated points of the parameter space.

use ndarray::Array1;

/// Which mechanism produced a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Drawn uniformly when the live set was initialized.
    Initial,
    /// Produced by a constrained random walk.
    RandomWalk,
    /// Drawn from the trained flow.
    Flow,
}

/// A point with its unit-cube and physical coordinates and its log-likelihood.
///
/// Points are never modified after evaluation; the live set and the dead-point
/// archive only move them around.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Run-unique identity; also breaks likelihood ties by insertion order.
    pub id: u64,
    pub unit: Array1<f64>,
    pub physical: Array1<f64>,
    pub log_likelihood: f64,
    /// Log prior volume of the run at the time the point was created.
    pub log_volume: Option<f64>,
    pub origin: Origin,
}

impl Point {
    pub fn dim(&self) -> usize {
        self.unit.len()
    }
}

/// Hands out run-unique point ids.
#[derive(Debug, Clone, Default)]
pub struct PointIds {
    next: u64,
}

impl PointIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}
