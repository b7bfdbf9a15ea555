//! Principal components of the scaled variable genes.
//!
//! The decompositions run on `ndarray` inputs and use `nalgebra` for the QR and SVD
//! kernels; [`to_dmatrix`] / [`from_dmatrix`] convert between the two.

use crate::config::PcaParams;
use crate::error::{PipelineError, Stage};
use anyhow::Error;
use diff_exp::Statistics;
use log::{info, warn};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Randomized SVD method
pub mod rand_svd;

#[cfg(test)]
pub(crate) mod test;

use rand_svd::RandSvd;

/// Left singular vectors (`m x k`), singular values, right singular vectors (`n x k`)
pub type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Perform a SVD of a `matrix`, retaining `k` principal components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca {
    /// Compute a rank `k` decomposition of `matrix`, singular values in descending order
    fn run_pca(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdResult, Error>;
}

/// Copy an `ndarray` matrix into a `nalgebra` one
pub fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Copy a `nalgebra` matrix into an `ndarray` one
pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Principal components of a cells x genes matrix
#[derive(Clone, Debug, PartialEq)]
pub struct PcaEmbedding {
    /// cell scores `U * S`, cells x K
    pub embeddings: Array2<f64>,
    /// gene loadings `V`, genes x K
    pub loadings: Array2<f64>,
    /// `sigma / sqrt(cells - 1)` per component
    pub stdev: Array1<f64>,
    /// component variance over the total gene variance
    pub variance_explained: Array1<f64>,
}

impl PcaEmbedding {
    /// Number of components
    pub fn num_components(&self) -> usize {
        self.stdev.len()
    }

    /// Cell scores on the first `dims` components
    pub fn embeddings_upto(&self, dims: usize) -> ArrayView2<'_, f64> {
        let dims = dims.min(self.num_components());
        self.embeddings.slice_axis(Axis(1), (0..dims).into())
    }
}

/// Make each component's largest-magnitude loading positive
fn fix_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for j in 0..v.ncols() {
        let mut col = v.column(j).iter().copied().enumerate().collect::<Vec<_>>();
        col.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then(a.0.cmp(&b.0)));
        if matches!(col.first(), Some(&(_, x)) if x < 0.0) {
            v.column_mut(j).mapv_inplace(|x| -x);
            u.column_mut(j).mapv_inplace(|x| -x);
        }
    }
}

/// PCA of a scaled genes x cells matrix. The number of components is clamped to
/// `min(cells, genes)`.
pub fn run_pca(scaled: ArrayView2<f64>, params: &PcaParams) -> Result<PcaEmbedding, PipelineError> {
    let a = scaled.t();
    let (cells, genes) = a.dim();
    let max_k = cells.min(genes);
    let k = if params.num_components > max_k {
        warn!(
            "{} components requested from a {} cells x {} genes matrix; computing {}",
            params.num_components, cells, genes, max_k
        );
        max_k
    } else {
        params.num_components
    };

    if a.iter().all(|&x| x == 0.0) {
        warn!("scaled matrix has no variance; all {} components are zero", k);
        return Ok(PcaEmbedding {
            embeddings: Array2::zeros((cells, k)),
            loadings: Array2::zeros((genes, k)),
            stdev: Array1::zeros(k),
            variance_explained: Array1::zeros(k),
        });
    }

    let svd = RandSvd {
        l_multiplier: params.l_multiplier,
        n_iter: params.power_iterations,
        seed: params.seed,
    };
    let (mut u, sigma, mut v) = svd.run_pca(a, k).map_err(|e| PipelineError::numerical(Stage::Pca, e))?;
    fix_signs(&mut u, &mut v);

    let embeddings = &u * &sigma;
    let stdev = sigma.mapv(|s| s / ((cells - 1) as f64).sqrt());
    let total_var: f64 = scaled.axis_iter(Axis(0)).map(|g| g.to_vec().var(1.0)).sum();
    let variance_explained = if total_var > 0.0 {
        stdev.mapv(|s| s * s / total_var)
    } else {
        Array1::zeros(stdev.len())
    };

    info!(
        "pca: {} components of {} cells x {} genes, {:.1}% of variance",
        k,
        cells,
        genes,
        100.0 * variance_explained.sum()
    );
    Ok(PcaEmbedding {
        embeddings,
        loadings: v,
        stdev,
        variance_explained,
    })
}
