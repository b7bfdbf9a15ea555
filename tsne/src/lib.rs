//! Exact t-SNE with the optimizer schedule of the reference Barnes-Hut implementation:
//! early exaggeration, a momentum switch, and per-parameter gains.
//!
//! The exact gradient is quadratic in the number of points.
// TODO: add a Barnes-Hut gradient for inputs beyond a few thousand points.
#![allow(non_snake_case)]
#![deny(warnings)]
#![deny(missing_docs)]

#[macro_use]
extern crate smart_default;

use anyhow::{bail, Error};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;

const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const PERPLEXITY_TOL: f64 = 1e-5;
const PERPLEXITY_MAX_STEPS: usize = 200;

/// Exact t-SNE. Configure the public fields, then call [`ExactTSNE::init`] once and
/// [`ExactTSNE::run_n`] until it reports completion.
#[derive(SmartDefault)]
pub struct ExactTSNE {
    /// output dimensions
    #[default = 2]
    pub n_dims: usize,
    /// target perplexity; lowered to `(n - 1) / 3` when larger
    #[default = 30.]
    pub perplexity: f64,
    /// seed of the initial layout
    #[default(None)]
    pub seed: Option<u64>,
    /// total gradient steps
    #[default = 1000]
    pub max_iter: usize,
    /// the early exaggeration is removed at this step
    #[default = 250]
    pub stop_lying_iter: usize,
    /// momentum goes from 0.5 to 0.8 at this step
    #[default = 250]
    pub mom_switch_iter: usize,
    /// gradient step size
    #[default = 200.]
    pub learning_rate: f64,
    /// factor applied to the input affinities before `stop_lying_iter`
    #[default = 12.]
    pub exaggeration: f64,
    #[default(Array2::zeros((0, 0)))]
    Y: Array2<f64>,
    #[default(Array2::zeros((0, 0)))]
    P: Array2<f64>,
    #[default(Array2::zeros((0, 0)))]
    uY: Array2<f64>,
    #[default(Array2::zeros((0, 0)))]
    gains: Array2<f64>,
    iter: usize,
}

/// Random state used when no seed is supplied
const RANDOM_STATE: u64 = 209_652_396;

impl ExactTSNE {
    /// Compute the input affinities of `X` (points x features) and draw the initial layout.
    pub fn init(&mut self, X: ArrayView2<f64>) -> Result<(), Error> {
        if self.n_dims == 0 {
            bail!("t-SNE needs at least one output dimension");
        }
        if X.iter().any(|v| !v.is_finite()) {
            bail!("t-SNE input contains non-finite values");
        }
        let N = X.nrows();
        self.iter = 0;
        self.Y = Array2::zeros((N, self.n_dims));
        self.uY = Array2::zeros((N, self.n_dims));
        self.gains = Array2::ones((N, self.n_dims));
        if N < 2 {
            self.P = Array2::zeros((N, N));
            return Ok(());
        }

        let max_perplexity = (N - 1) as f64 / 3.0;
        let perplexity = if self.perplexity > max_perplexity {
            warn!(
                "perplexity {} is too large for {} points, using {:.3}",
                self.perplexity, N, max_perplexity
            );
            max_perplexity
        } else {
            self.perplexity
        };

        let X = normalize_input(X);
        let D = squared_distances(X.view());
        let mut P = gaussian_perplexity(D.view(), perplexity);

        // symmetrize and normalize
        let Pt = P.t().to_owned();
        P += &Pt;
        let total = P.sum();
        if total > 0.0 {
            P /= total;
        }
        P *= self.exaggeration;
        self.P = P;

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed.unwrap_or(RANDOM_STATE));
        let normal = Normal::new(0.0, 1e-4)?;
        self.Y.iter_mut().for_each(|y| *y = normal.sample(&mut rng));
        debug!("t-SNE initialized: {} points, perplexity {:.3}", N, perplexity);
        Ok(())
    }

    /// Run up to `n` gradient steps. Returns true when all `max_iter` steps are done.
    pub fn run_n(&mut self, n: usize) -> bool {
        let N = self.Y.nrows();
        for _ in 0..n {
            if self.iter >= self.max_iter {
                break;
            }
            if N >= 2 {
                self.step();
            }
            self.iter += 1;
            if self.iter == self.stop_lying_iter {
                self.P /= self.exaggeration;
            }
        }
        self.iter >= self.max_iter
    }

    /// Run all remaining steps.
    pub fn run(&mut self) {
        let remaining = self.max_iter.saturating_sub(self.iter);
        self.run_n(remaining);
    }

    /// Kullback-Leibler divergence of the current layout against the input affinities
    /// (without exaggeration).
    pub fn kl_divergence(&self) -> f64 {
        let N = self.Y.nrows();
        if N < 2 {
            return 0.0;
        }
        let scale = if self.iter < self.stop_lying_iter {
            1.0 / self.exaggeration
        } else {
            1.0
        };
        let num = student_t_kernel(self.Y.view());
        let sum_q = num.sum();
        let mut kl = 0.0;
        Zip::from(&self.P).and(&num).for_each(|&p, &q| {
            let p = p * scale;
            if p > 0.0 {
                kl += p * (p / (q / sum_q).max(f64::MIN_POSITIVE)).ln();
            }
        });
        kl
    }

    /// Steps completed so far
    pub fn iterations(&self) -> usize {
        self.iter
    }

    /// The embedding, points x `n_dims`
    pub fn result(self) -> Array2<f64> {
        self.Y
    }

    fn step(&mut self) {
        let momentum = if self.iter < self.mom_switch_iter {
            INITIAL_MOMENTUM
        } else {
            FINAL_MOMENTUM
        };
        let dY = exact_gradient(self.P.view(), self.Y.view());

        Zip::from(&mut self.gains)
            .and(&dY)
            .and(&self.uY)
            .for_each(|g, &d, &u| {
                *g = if d.signum() != u.signum() { *g + 0.2 } else { *g * 0.8 };
                if *g < MIN_GAIN {
                    *g = MIN_GAIN;
                }
            });
        let eta = self.learning_rate;
        Zip::from(&mut self.uY)
            .and(&self.gains)
            .and(&dY)
            .for_each(|u, &g, &d| *u = momentum * *u - eta * g * d);
        self.Y += &self.uY;

        let mean = self.Y.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(self.n_dims));
        self.Y -= &mean;
    }
}

/// Center the columns and scale by the largest absolute value.
fn normalize_input(X: ArrayView2<f64>) -> Array2<f64> {
    let mut X = X.to_owned();
    if let Some(mean) = X.mean_axis(Axis(0)) {
        X -= &mean;
    }
    let max = X.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if max > 0.0 {
        X /= max;
    }
    X
}

fn squared_distances(X: ArrayView2<f64>) -> Array2<f64> {
    let N = X.nrows();
    let mut D = Array2::zeros((N, N));
    D.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let xi = X.row(i);
            for j in 0..N {
                row[j] = xi.iter().zip(X.row(j).iter()).map(|(a, b)| (a - b) * (a - b)).sum();
            }
        });
    D
}

/// Row-conditional Gaussian affinities; each row's bandwidth is found by binary search so
/// that its entropy matches `ln(perplexity)`.
fn gaussian_perplexity(D: ArrayView2<f64>, perplexity: f64) -> Array2<f64> {
    let N = D.nrows();
    let target = perplexity.ln();
    let mut P = Array2::zeros((N, N));
    P.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let d = D.row(i);
            let mut beta = 1.0f64;
            let mut min_beta = f64::NEG_INFINITY;
            let mut max_beta = f64::INFINITY;
            let mut sum_p = 0.0;

            for _ in 0..PERPLEXITY_MAX_STEPS {
                for j in 0..N {
                    row[j] = if j == i { 0.0 } else { (-beta * d[j]).exp() };
                }
                sum_p = f64::MIN_POSITIVE + row.sum();
                let mut h = 0.0;
                for j in 0..N {
                    h += beta * d[j] * row[j];
                }
                h = h / sum_p + sum_p.ln();

                let diff = h - target;
                if diff.abs() < PERPLEXITY_TOL {
                    break;
                }
                if diff > 0.0 {
                    min_beta = beta;
                    beta = if max_beta.is_infinite() { beta * 2.0 } else { (beta + max_beta) / 2.0 };
                } else {
                    max_beta = beta;
                    beta = if min_beta.is_infinite() { beta / 2.0 } else { (beta + min_beta) / 2.0 };
                }
            }
            row /= sum_p;
        });
    P
}

/// Unnormalized Student-t similarities `1 / (1 + |yi - yj|^2)`, zero on the diagonal.
fn student_t_kernel(Y: ArrayView2<f64>) -> Array2<f64> {
    let N = Y.nrows();
    let mut num = Array2::zeros((N, N));
    num.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let yi = Y.row(i);
            for j in 0..N {
                if j != i {
                    let d: f64 = yi.iter().zip(Y.row(j).iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                    row[j] = 1.0 / (1.0 + d);
                }
            }
        });
    num
}

fn exact_gradient(P: ArrayView2<f64>, Y: ArrayView2<f64>) -> Array2<f64> {
    let (N, dims) = Y.dim();
    let num = student_t_kernel(Y);
    let sum_q = num.sum().max(f64::MIN_POSITIVE);

    let mut dY = Array2::zeros((N, dims));
    dY.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut grad)| {
            for j in 0..N {
                if j == i {
                    continue;
                }
                let mult = (P[[i, j]] - num[[i, j]] / sum_q) * num[[i, j]];
                for d in 0..dims {
                    grad[d] += mult * (Y[[i, d]] - Y[[j, d]]);
                }
            }
        });
    dY
}
