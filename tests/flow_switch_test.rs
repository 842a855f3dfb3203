//! Runs that switch from random-walk to flow-guided proposals.

use flownest::point::Origin;
use flownest::proposal::ProposalMode;
use flownest::{FlowKind, NestedSampler, NestedSamplerConfig, StopReason};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::f64::consts::PI;

fn gaussian(x: ArrayView2<f64>) -> Array1<f64> {
    x.map_axis(Axis(1), |row| -0.5 * row.dot(&row) - (2.0 * PI).ln())
}

fn box_prior(u: ArrayView2<f64>) -> Array2<f64> {
    u.mapv(|v| 10.0 * v - 5.0)
}

fn flow_config(kind: FlowKind, switch: f64) -> NestedSamplerConfig {
    NestedSamplerConfig::default()
        .set_num_live_points(200)
        .set_flow(kind)
        .set_flow_capacity(2, 32, 1)
        .set_train_iters(20)
        .set_switch(switch)
        .set_log_interval(250)
        .set_seed(2024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_once_after_500_dead_points() {
        let mut sampler =
            NestedSampler::new(["x", "y"], gaussian, box_prior, flow_config(FlowKind::Nvp, 500.0))
                .unwrap();
        let result = sampler.run().unwrap();

        assert_eq!(result.summary.stop_reason, StopReason::Converged);
        assert!(result.summary.iterations > 500);

        assert_eq!(result.transitions.len(), 1);
        let t = result.transitions[0];
        assert_eq!(t.from, ProposalMode::RandomWalk);
        assert_eq!(t.to, ProposalMode::FlowGuided);
        assert_eq!(t.dead_count, 500);
        assert_eq!(t.iteration, 501);

        let (before, after) = result.mode_trace.split_at(500);
        assert!(before.iter().all(|&m| m == ProposalMode::RandomWalk));
        assert!(after.iter().all(|&m| m == ProposalMode::FlowGuided));

        assert!(result.summary.flow_fits >= 1);
        assert!(result
            .archive
            .iter()
            .any(|d| d.point.origin == Origin::Flow));
        assert!(
            (result.log_z + 100f64.ln()).abs() < 0.6,
            "ln Z = {} +/- {}",
            result.log_z,
            result.log_z_err
        );
    }

    #[test]
    fn volume_switch_with_additive_flow() {
        let config = flow_config(FlowKind::Nice, 0.05).set_num_live_points(100);
        let mut sampler = NestedSampler::new(["x", "y"], gaussian, box_prior, config).unwrap();
        let result = sampler.run().unwrap();

        assert_eq!(result.transitions.len(), 1);
        let t = result.transitions[0];
        assert!(t.log_volume <= 0.05f64.ln());
        // ln X_i = -i/N, so the first iteration with X <= 0.05 is fixed.
        assert_eq!(t.dead_count, (-(0.05f64.ln()) * 100.0).ceil() as usize);
        assert!(result.log_z.is_finite());
        assert!((result.log_z + 100f64.ln()).abs() < 0.8);
    }

    #[test]
    fn disabled_switch_stays_on_random_walk() {
        let config = flow_config(FlowKind::Nvp, -1.0).set_num_live_points(60);
        let mut sampler = NestedSampler::new(["x", "y"], gaussian, box_prior, config).unwrap();
        let result = sampler.run().unwrap();
        assert!(result.transitions.is_empty());
        assert_eq!(result.summary.flow_fits, 0);
        assert!(result
            .archive
            .iter()
            .all(|d| d.point.origin != Origin::Flow));
    }
}
