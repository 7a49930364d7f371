//! # Module: bayes
//!
//! ## Responsibility
//! Fallback parameter search for when the PID kernel stalls: a Gaussian
//! Process with an anisotropic RBF kernel, Latin-Hypercube candidate
//! generation, and Expected-Improvement-with-exploration acquisition, fit
//! with a handful of observations.
//!
//! A fresh implementation rather than a port of an existing optimizer; see
//! `DESIGN.md` for the grounding notes.
//!
//! ## NOT Responsible For
//! Deciding *when* to fall back to Bayesian search — that's the Adaptive
//! Controller's stall-counting logic.

use std::sync::Mutex;

use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// A rectangular search domain: one `(min, max)` bound per dimension.
#[derive(Debug, Clone)]
pub struct Bounds(pub Vec<(f64, f64)>);

impl Bounds {
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn midpoint(&self) -> Vec<f64> {
        self.0.iter().map(|(lo, hi)| (lo + hi) / 2.0).collect()
    }

    fn clamp(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.0)
            .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GpConfig {
    pub candidates: usize,
    /// Exploration weight `ξ` at sample count 0; decays toward 0 as samples accumulate.
    pub xi0: f64,
    /// Additive noise variance on the kernel diagonal.
    pub noise: f64,
    /// Per-dimension RBF length scales. Empty means "infer a default of 1.0 per dim".
    pub length_scales: Vec<f64>,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            candidates: 64,
            xi0: 0.1,
            noise: 1e-6,
            length_scales: Vec::new(),
        }
    }
}

/// Gaussian-process-backed Bayesian optimizer over a rectangular domain.
/// Samples are append-only; `suggest()` is compute-bound and must run
/// outside the metric-consume path.
pub struct BayesianOptimizer {
    bounds: Bounds,
    cfg: GpConfig,
    samples: Mutex<Vec<(Vec<f64>, f64)>>,
}

impl BayesianOptimizer {
    pub fn new(bounds: Bounds, cfg: GpConfig) -> Self {
        Self {
            bounds,
            cfg,
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn configure(&mut self, candidates: usize, xi: f64, noise: f64) {
        self.cfg.candidates = candidates;
        self.cfg.xi0 = xi;
        self.cfg.noise = noise;
    }

    pub fn set_length_scales(&mut self, scales: Vec<f64>) {
        self.cfg.length_scales = scales;
    }

    pub fn add_sample(&self, x: Vec<f64>, y: f64) {
        let x = self.bounds.clamp(&x);
        self.samples.lock().unwrap().push((x, y));
    }

    pub fn num_samples(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    /// The best `(x, y)` observed so far, minimizing `y` (the controller
    /// treats `y` as a cost/error signal to drive toward zero).
    pub fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
    }

    fn length_scales(&self) -> Vec<f64> {
        if self.cfg.length_scales.len() == self.bounds.dim() {
            self.cfg.length_scales.clone()
        } else {
            vec![1.0; self.bounds.dim()]
        }
    }

    fn kernel(&self, a: &[f64], b: &[f64], scales: &[f64]) -> f64 {
        let sq_dist: f64 = a
            .iter()
            .zip(b)
            .zip(scales)
            .map(|((ai, bi), l)| {
                let d = (ai - bi) / l.max(1e-9);
                d * d
            })
            .sum();
        (-0.5 * sq_dist).exp()
    }

    /// Posterior mean/variance at `x`, falling back to the GP prior
    /// (mean 0, variance 1) if the kernel matrix's Cholesky factorization
    /// fails numerically.
    fn predict(&self, x: &[f64], samples: &[(Vec<f64>, f64)]) -> (f64, f64) {
        if samples.is_empty() {
            return (0.0, 1.0);
        }
        let n = samples.len();
        let scales = self.length_scales();

        let mut k = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let mut v = self.kernel(&samples[i].0, &samples[j].0, &scales);
                if i == j {
                    v += self.cfg.noise;
                }
                k[(i, j)] = v;
            }
        }

        let chol = match k.clone().cholesky() {
            Some(c) => c,
            None => return (0.0, 1.0), // numerically degenerate: prior fallback
        };

        let k_star = DVector::from_iterator(n, samples.iter().map(|(sx, _)| self.kernel(x, sx, &scales)));
        let y = DVector::from_iterator(n, samples.iter().map(|(_, sy)| *sy));

        let alpha = chol.solve(&y);
        let mean = k_star.dot(&alpha);

        let v = chol.solve(&k_star);
        let k_star_star = self.kernel(x, x, &scales) + self.cfg.noise;
        let variance = (k_star_star - k_star.dot(&v)).max(1e-12);

        (mean, variance)
    }

    /// Expected-Improvement-with-exploration: `EI(μ, σ, y_best, ξ)`. We
    /// minimize, so improvement is `y_best - μ - ξ`.
    fn expected_improvement(mean: f64, variance: f64, y_best: f64, xi: f64) -> f64 {
        let sigma = variance.sqrt();
        if sigma < 1e-12 {
            return 0.0;
        }
        let improvement = y_best - mean - xi;
        let z = improvement / sigma;
        improvement * standard_normal_cdf(z) + sigma * standard_normal_pdf(z)
    }

    fn latin_hypercube(&self, n: usize) -> Vec<Vec<f64>> {
        let dim = self.bounds.dim();
        let mut rng = rand::thread_rng();
        // Per-dimension stratified permutation, then jitter within stratum.
        let mut strata: Vec<Vec<usize>> = (0..dim)
            .map(|_| {
                let mut idx: Vec<usize> = (0..n).collect();
                for i in (1..n).rev() {
                    let j = rng.gen_range(0..=i);
                    idx.swap(i, j);
                }
                idx
            })
            .collect();
        let _ = &mut strata;

        (0..n)
            .map(|i| {
                self.bounds
                    .0
                    .iter()
                    .enumerate()
                    .map(|(d, (lo, hi))| {
                        let stratum = strata[d][i] as f64;
                        let jitter: f64 = rng.gen_range(0.0..1.0);
                        let u = (stratum + jitter) / n as f64;
                        lo + u * (hi - lo)
                    })
                    .collect()
            })
            .collect()
    }

    /// Deterministic corner-walk used to cover the domain's extremes during
    /// the first `d+1` samples, before the GP has enough data to be useful.
    fn corner_walk_point(&self, sample_index: usize) -> Vec<f64> {
        // sample_index in [1, dim]: toggle bound d-1 from midpoint toward
        // its max, giving quasi-coverage of each axis's extreme in turn.
        let mid = self.bounds.midpoint();
        let mut x = mid.clone();
        if sample_index >= 1 && sample_index <= self.bounds.dim() {
            let d = sample_index - 1;
            x[d] = self.bounds.0[d].1;
        }
        x
    }

    /// Suggest the next parameter vector to try.
    pub fn suggest(&self) -> Vec<f64> {
        let samples = self.samples.lock().unwrap().clone();
        let dim = self.bounds.dim();

        if samples.is_empty() {
            return self.bounds.midpoint();
        }
        if samples.len() <= dim {
            return self.corner_walk_point(samples.len());
        }

        let y_best = samples
            .iter()
            .map(|(_, y)| *y)
            .fold(f64::INFINITY, f64::min);

        // Exploration weight decays toward exploitation as samples accumulate.
        let xi = self.cfg.xi0 / (1.0 + samples.len() as f64 * 0.1);

        let candidates = self.latin_hypercube(self.cfg.candidates.max(1));
        let mut best_x = candidates[0].clone();
        let mut best_score = f64::NEG_INFINITY;
        for c in &candidates {
            let (mean, var) = self.predict(c, &samples);
            let score = Self::expected_improvement(mean, var, y_best, xi);
            if score > best_score {
                best_score = score;
                best_x = c.clone();
            }
        }
        best_x
    }
}

fn standard_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz-Stegun rational approximation of the error function, accurate
/// to ~1.5e-7 — sufficient for an acquisition-function weighting term.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds2() -> Bounds {
        Bounds(vec![(0.0, 10.0), (0.0, 10.0)])
    }

    #[test]
    fn first_suggestion_is_midpoint() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        assert_eq!(opt.suggest(), vec![5.0, 5.0]);
    }

    #[test]
    fn corner_walk_covers_each_dimension_in_turn() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        opt.add_sample(vec![5.0, 5.0], 1.0);
        let x1 = opt.suggest();
        assert_eq!(x1[0], 10.0);
        opt.add_sample(x1, 0.9);
        let x2 = opt.suggest();
        assert_eq!(x2[1], 10.0);
    }

    #[test]
    fn suggestion_stays_within_bounds() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        for i in 0..10 {
            let x = opt.suggest();
            for (v, (lo, hi)) in x.iter().zip(&opt.bounds.0) {
                assert!(*v >= *lo && *v <= *hi);
            }
            opt.add_sample(x, (i as f64).sin());
        }
    }

    #[test]
    fn best_tracks_minimum_y() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        opt.add_sample(vec![1.0, 1.0], 5.0);
        opt.add_sample(vec![2.0, 2.0], 1.0);
        opt.add_sample(vec![3.0, 3.0], 9.0);
        let (x, y) = opt.best().unwrap();
        assert_eq!(x, vec![2.0, 2.0]);
        assert_eq!(y, 1.0);
    }

    #[test]
    fn num_samples_tracks_additions() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        assert_eq!(opt.num_samples(), 0);
        opt.add_sample(vec![1.0, 1.0], 1.0);
        assert_eq!(opt.num_samples(), 1);
    }

    #[test]
    fn degenerate_duplicate_samples_do_not_panic_prediction() {
        let opt = BayesianOptimizer::new(bounds2(), GpConfig::default());
        for _ in 0..5 {
            opt.add_sample(vec![5.0, 5.0], 1.0); // identical x -> singular kernel matrix
        }
        // suggest() must fall back gracefully rather than panic.
        let _ = opt.suggest();
    }
}
