use flownest::{FlowKind, NestedSampler, NestedSamplerConfig};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::error::Error;
use std::f64::consts::PI;

/// Evidence of a correlated 2D Gaussian under a uniform prior on [-5, 5]^2,
/// switching to flow proposals after 500 dead points.
fn main() -> Result<(), Box<dyn Error>> {
    let rho: f64 = 0.8;
    let det = 1.0 - rho * rho;
    let loglike = move |x: ArrayView2<f64>| -> Array1<f64> {
        x.map_axis(Axis(1), |r| {
            let q = (r[0] * r[0] - 2.0 * rho * r[0] * r[1] + r[1] * r[1]) / det;
            -0.5 * q - (2.0 * PI).ln() - 0.5 * det.ln()
        })
    };
    let transform = |u: ArrayView2<f64>| -> Array2<f64> { u.mapv(|v| 10.0 * v - 5.0) };

    let config = NestedSamplerConfig::default()
        .set_num_live_points(500)
        .set_mcmc_steps(25)
        .set_flow("nvp".parse::<FlowKind>()?)
        .set_flow_capacity(3, 64, 1)
        .set_switch(500.0)
        .set_test_samples(1000, 50)
        .set_show_progress(true)
        .set_log_interval(500)
        .set_seed(42);

    let mut sampler = NestedSampler::new(["x", "y"], loglike, transform, config)?;
    let result = sampler.run()?;

    println!("{}", result.summary);
    println!("expected ln Z = {:.4}", -(100f64.ln()));
    println!(
        "{} equal-weight posterior samples, first: {}",
        result.posterior_samples().nrows(),
        result.posterior_samples().row(0)
    );
    Ok(())
}
