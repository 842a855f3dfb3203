use flownest::{NestedSampler, NestedSamplerConfig};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::error::Error;
use std::f64::consts::PI;

/// The multimodal eggbox likelihood on [0, 10 pi]^D.
fn main() -> Result<(), Box<dyn Error>> {
    let dim: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);
    let names: Vec<String> = (b'a'..=b'z')
        .take(dim)
        .map(|c| (c as char).to_string())
        .collect();

    let loglike = |z: ArrayView2<f64>| -> Array1<f64> {
        z.map_axis(Axis(1), |row| {
            let chi: f64 = row.iter().map(|v| (v / 2.0).cos()).product();
            (2.0 + chi).powi(5)
        })
    };
    let transform = |u: ArrayView2<f64>| -> Array2<f64> { u.mapv(|v| v * 10.0 * PI) };

    let config = NestedSamplerConfig::default()
        .set_num_live_points(1000)
        .set_log_interval(20)
        .set_log_dir("logs/eggbox", false)
        .set_show_progress(true);

    let mut sampler = NestedSampler::new(names, loglike, transform, config)?;
    let result = sampler.run()?;
    println!("{}", result.summary);
    Ok(())
}
