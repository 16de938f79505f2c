//! Deterministic sampling kernel for the Monte Carlo engines.
//!
//! Every engine call constructs its own `Sampler` from a seed, so identical
//! inputs always reproduce identical draws.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal, Triangular};
use std::cmp::Ordering;

pub struct Sampler {
    rng: ChaCha8Rng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Triangular draw on [low, high]. A zero-width range returns `low`.
    pub fn triangular(&mut self, low: f64, mode: f64, high: f64) -> f64 {
        if !(high > low) {
            return low;
        }
        let mode = mode.clamp(low, high);
        match Triangular::new(low, high, mode) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => mode,
        }
    }

    pub fn standard_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }
}

/// Sorts `samples` in place (NaN-safe ordering).
pub fn sort_samples(samples: &mut [f64]) {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
}

/// Linear-interpolated percentile `q` ∈ [0, 100] of sorted samples.
pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// p5 / p50 / p95 of unsorted samples.
pub fn p5_p50_p95(samples: &mut [f64]) -> (f64, f64, f64) {
    sort_samples(samples);
    (
        percentile_sorted(samples, 5.0),
        percentile_sorted(samples, 50.0),
        percentile_sorted(samples, 95.0),
    )
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_draws() {
        let mut a = Sampler::new(7);
        let mut b = Sampler::new(7);
        for _ in 0..100 {
            assert_eq!(a.standard_normal().to_bits(), b.standard_normal().to_bits());
            let (x, y) = (a.triangular(0.1, 0.3, 0.9), b.triangular(0.1, 0.3, 0.9));
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn triangular_stays_in_range_and_centres_on_mode() {
        let mut s = Sampler::new(11);
        let mut draws: Vec<f64> = (0..20_000).map(|_| s.triangular(0.5, 0.6, 0.7)).collect();
        assert!(draws.iter().all(|d| (0.5..=0.7).contains(d)));
        let (_, p50, _) = p5_p50_p95(&mut draws);
        assert!((p50 - 0.6).abs() < 0.005);
    }

    #[test]
    fn degenerate_triangular_returns_point() {
        let mut s = Sampler::new(1);
        assert_eq!(s.triangular(0.4, 0.4, 0.4), 0.4);
    }

    #[test]
    fn normal_moments_are_plausible() {
        let mut s = Sampler::new(3);
        let draws: Vec<f64> = (0..50_000).map(|_| s.standard_normal()).collect();
        let m = mean(&draws);
        let var = draws.iter().map(|z| (z - m) * (z - m)).sum::<f64>() / draws.len() as f64;
        assert!(m.abs() < 0.02);
        assert!((var - 1.0).abs() < 0.03);
    }

    #[test]
    fn percentiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile_sorted(&sorted, 50.0), 3.0);
        assert_eq!(percentile_sorted(&sorted, 0.0), 1.0);
        assert_eq!(percentile_sorted(&sorted, 100.0), 5.0);
        assert!((percentile_sorted(&sorted, 5.0) - 1.2).abs() < 1e-12);
        assert_eq!(percentile_sorted(&[], 50.0), 0.0);
    }
}
