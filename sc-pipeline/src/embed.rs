//! t-SNE layout of the principal components, for display only.
use crate::config::TsneParams;
use crate::error::{PipelineError, Stage};
use log::info;
use ndarray::{Array2, ArrayView2};
use tsne::ExactTSNE;

/// Lay out the rows of `components` (cells x D) in `params.n_dims` dimensions
pub fn run_tsne(components: ArrayView2<'_, f64>, params: &TsneParams) -> Result<Array2<f64>, PipelineError> {
    let mut tsne = ExactTSNE::default();
    tsne.n_dims = params.n_dims;
    tsne.perplexity = params.perplexity;
    tsne.max_iter = params.max_iter;
    tsne.learning_rate = params.learning_rate;
    tsne.seed = Some(params.seed);
    tsne.init(components)
        .map_err(|e| PipelineError::numerical(Stage::Embedding, e))?;
    tsne.run();
    info!(
        "t-SNE: {} cells from {} components, KL divergence {:.4} after {} steps",
        components.nrows(),
        components.ncols(),
        tsne.kl_divergence(),
        tsne.iterations()
    );
    Ok(tsne.result())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;

    #[test]
    fn test_tsne_separates_groups() {
        // two tight groups far apart in 3 dimensions
        let x = Array2::from_shape_fn((30, 3), |(i, j)| {
            let offset = if i < 15 { 0.0 } else { 50.0 };
            offset + ((i * 7 + j * 3) % 5) as f64 * 0.1
        });
        let params = TsneParams {
            max_iter: 400,
            ..TsneParams::default()
        };
        let y = run_tsne(x.view(), &params).unwrap();
        assert_eq!(y.dim(), (30, 2));

        let a = y.select(Axis(0), &(0..15).collect::<Vec<_>>()).mean_axis(Axis(0)).unwrap();
        let b = y.select(Axis(0), &(15..30).collect::<Vec<_>>()).mean_axis(Axis(0)).unwrap();
        let between = (&a - &b).mapv(|v| v * v).sum().sqrt();
        let within = y
            .rows()
            .into_iter()
            .take(15)
            .map(|r| (&r - &a).mapv(|v| v * v).sum().sqrt())
            .fold(0.0, f64::max);
        assert!(between > within);

        let again = run_tsne(x.view(), &params).unwrap();
        assert_eq!(y, again);
    }

    #[test]
    fn test_three_dims() {
        let x = Array2::from_shape_fn((12, 4), |(i, j)| {
            let offset = if i < 6 { 0.0 } else { 20.0 };
            offset + (i * 3 + j) as f64 * 0.5
        });
        let params = TsneParams {
            n_dims: 3,
            perplexity: 3.0,
            max_iter: 50,
            ..TsneParams::default()
        };
        let y = run_tsne(x.view(), &params).unwrap();
        assert_eq!(y.dim(), (12, 3));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_non_finite_input() {
        let mut x = Array2::zeros((5, 2));
        x[[2, 1]] = f64::NAN;
        assert!(matches!(
            run_tsne(x.view(), &TsneParams::default()),
            Err(PipelineError::Numerical { stage: Stage::Embedding, .. })
        ));
    }
}
