#![allow(non_snake_case)]

use super::{from_dmatrix, to_dmatrix, Pca, SvdResult};
use anyhow::{format_err, Error};
use nalgebra::{DMatrix, DVector, SVD};
use ndarray::{Array1, ArrayView2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// Sweeps allowed for the bidiagonal SVD to converge
const SVD_MAX_ITER: usize = 10_000;

/// Settings for Randomized PCA
pub struct RandSvd {
    /// Multiple of the requested k to use in randomized projections
    pub l_multiplier: f64,

    /// Number of power iteration to perform
    pub n_iter: usize,

    /// Seed of the random projection
    pub seed: u64,
}

impl RandSvd {
    /// Create a new RandSvd with default settings.
    pub fn new() -> RandSvd {
        RandSvd {
            l_multiplier: 10.0,
            n_iter: 2,
            seed: 0,
        }
    }

    /// Projection columns used for a rank `k` decomposition
    pub fn projection_dims(&self, k: usize) -> usize {
        std::cmp::max(k + 4, ((k as f64) * self.l_multiplier) as usize)
    }
}

impl Default for RandSvd {
    fn default() -> Self {
        Self::new()
    }
}

impl Pca for RandSvd {
    fn run_pca(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error> {
        let l = self.projection_dims(k);
        if l >= matrix.nrows().min(matrix.ncols()) {
            return ExactSvd.run_pca(matrix, k);
        }
        svd_rand(matrix, k, l, self.n_iter, self.seed)
    }
}

/// Full SVD, used when the projection would not be smaller than the matrix
pub struct ExactSvd;

impl Pca for ExactSvd {
    fn run_pca(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error> {
        svd_exact(matrix, k)
    }
}

fn thin_svd(B: DMatrix<f64>) -> Result<(DMatrix<f64>, DVector<f64>, DMatrix<f64>), Error> {
    let svd = SVD::try_new(B, true, true, f64::EPSILON, SVD_MAX_ITER).ok_or_else(|| format_err!("SVD did not converge"))?;
    let u = svd.u.ok_or_else(|| format_err!("SVD returned no left singular vectors"))?;
    let v_t = svd.v_t.ok_or_else(|| format_err!("SVD returned no right singular vectors"))?;
    Ok((u, svd.singular_values, v_t))
}

/// Keep the `k` largest singular triplets, largest first. `v_t` is `r x n`.
fn top_k(u: DMatrix<f64>, sigma: DVector<f64>, v_t: DMatrix<f64>, k: usize) -> SvdResult {
    let mut order = (0..sigma.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| sigma[b].total_cmp(&sigma[a]).then(a.cmp(&b)));
    order.truncate(k);

    let U = DMatrix::from_fn(u.nrows(), order.len(), |i, j| u[(i, order[j])]);
    let V = DMatrix::from_fn(v_t.ncols(), order.len(), |i, j| v_t[(order[j], i)]);
    let s = Array1::from_iter(order.iter().map(|&j| sigma[j]));
    (from_dmatrix(&U), s, from_dmatrix(&V))
}

fn check_dims(m: usize, n: usize, k: usize) -> Result<(), Error> {
    if m < 2 || n < 2 {
        return Err(format_err!("The input matrix must be at least 2x2."));
    }
    if k == 0 || k > std::cmp::min(m, n) {
        return Err(format_err!("invalid k"));
    }
    Ok(())
}

/// Exact SVD of `A`, truncated to rank `k`
pub fn svd_exact(A: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error> {
    check_dims(A.nrows(), A.ncols(), k)?;
    let (u, sigma, v_t) = thin_svd(to_dmatrix(A))?;
    Ok(top_k(u, sigma, v_t, k))
}

/// Perform an SVD of matrix `A`, making a rank `k` approximation. Use `l` projection dimensions and `n_iter` power iterations.
#[inline(never)]
pub fn svd_rand(
    A: ArrayView2<f64>,
    k: usize, // svd rank
    l: usize,
    n_iter: usize, // power iterations
    seed: u64,
) -> Result<SvdResult, Error> {
    let m = A.nrows();
    let n = A.ncols();
    check_dims(m, n, k)?;

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let unif = Uniform::new(-1.0, 1.0);
    let A = to_dmatrix(A);

    if m >= n {
        let omega = to_dmatrix(ndarray::Array2::random_using((n, l), unif, &mut rng).view());
        let mut Q = (&A * omega).qr().q();

        for _ in 0..n_iter {
            Q = (A.transpose() * &Q).qr().q();
            Q = (&A * &Q).qr().q();
        }

        let B = Q.transpose() * &A;
        let (u, sigma, v_t) = thin_svd(B)?;
        Ok(top_k(&Q * u, sigma, v_t, k))
    } else {
        // n > m
        let omega = to_dmatrix(ndarray::Array2::random_using((l, m), unif, &mut rng).view());
        let mut Q = (omega * &A).transpose().qr().q();

        for _ in 0..n_iter {
            Q = (&A * &Q).qr().q();
            Q = (A.transpose() * &Q).qr().q();
        }

        let B = &A * &Q;
        let (u, sigma, v_t) = thin_svd(B)?;
        Ok(top_k(u, sigma, v_t * Q.transpose(), k))
    }
}
