//! Append-only archive of removed (dead) points.

use ndarray::{Array1, Array2, Axis};

use crate::point::Point;

/// A removed live point with the prior volume it was assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadPoint {
    pub point: Point,
    /// Log prior volume enclosed by the live set right after removal.
    pub log_volume: f64,
    /// Log of the prior mass assigned to this point.
    pub log_weight: f64,
    /// 1-based iteration at which the point was removed. Points folded in at the
    /// end of a run continue the numbering.
    pub iteration: usize,
}

impl DeadPoint {
    /// `ln(w L)`, the log of this point's evidence contribution.
    pub fn log_contribution(&self) -> f64 {
        self.log_weight + self.point.log_likelihood
    }
}

/// Dead points in removal order. Entries are only ever appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadPointArchive {
    entries: Vec<DeadPoint>,
}

impl DeadPointArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dead: DeadPoint) {
        self.entries.push(dead);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DeadPoint] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeadPoint> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&DeadPoint> {
        self.entries.last()
    }

    pub fn log_likelihoods(&self) -> Array1<f64> {
        self.entries.iter().map(|d| d.point.log_likelihood).collect()
    }

    pub fn log_volumes(&self) -> Array1<f64> {
        self.entries.iter().map(|d| d.log_volume).collect()
    }

    pub fn log_contributions(&self) -> Array1<f64> {
        self.entries.iter().map(DeadPoint::log_contribution).collect()
    }

    /// Physical coordinates of all dead points as an `[n, D]` array.
    pub fn physical_matrix(&self) -> Array2<f64> {
        let dim = self.entries.first().map_or(0, |d| d.point.dim());
        let mut out = Array2::zeros((self.entries.len(), dim));
        for (mut row, d) in out.axis_iter_mut(Axis(0)).zip(&self.entries) {
            row.assign(&d.point.physical);
        }
        out
    }
}
