//! The eggbox likelihood `(2 + prod cos(z_i / 2))^5` on [0, 10 pi]^2 has 18 modes and a
//! reference evidence of `ln Z ≈ 235.88`.

use flownest::{NestedSampler, NestedSamplerConfig, StopReason};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::f64::consts::PI;

fn eggbox(z: ArrayView2<f64>) -> Array1<f64> {
    z.map_axis(Axis(1), |row| {
        let chi: f64 = row.iter().map(|v| (v / 2.0).cos()).product();
        (2.0 + chi).powi(5)
    })
}

fn eggbox_prior(u: ArrayView2<f64>) -> Array2<f64> {
    u.mapv(|v| v * 10.0 * PI)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eggbox_evidence() {
        let config = NestedSamplerConfig::default()
            .set_num_live_points(400)
            .set_seed(17);
        let mut sampler = NestedSampler::new(["a", "b"], eggbox, eggbox_prior, config).unwrap();
        let result = sampler.run().unwrap();

        assert_eq!(result.summary.stop_reason, StopReason::Converged);
        assert!(
            (result.log_z - 235.88).abs() < 1.0,
            "ln Z = {} +/- {}",
            result.log_z,
            result.log_z_err
        );
        // Posterior mass sits on the peaks, symmetric about the centre of the box.
        let centre = 5.0 * PI;
        for mean in result.summary.posterior_mean.iter() {
            assert!((mean - centre).abs() < 3.0, "mean = {mean}");
        }
    }
}
