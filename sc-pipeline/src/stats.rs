//! Statistics functions

use diff_exp::Statistics;
use ndarray::{ArrayView1, ArrayViewMut1};

/// Split items into `num_bins` equal-population bins. `order` lists item indices from
/// smallest to largest; the returned vector holds each item's bin.
pub fn equal_population_bins(order: &[usize], num_bins: usize) -> Vec<usize> {
    let n = order.len();
    let num_bins = num_bins.max(1);
    let mut bins = vec![0; n];
    for (rank, &item) in order.iter().enumerate() {
        bins[item] = rank * num_bins / n;
    }
    bins
}

/// Sample mean and standard deviation (n - 1) of a row
pub fn mean_sd(row: ArrayView1<f64>) -> (f64, f64) {
    let values = row.to_vec();
    (values.mean(), values.var(1.0).sqrt())
}

/// Center a row and divide by its standard deviation, then clip to `[-clip, clip]`.
/// Rows without spread become zero.
pub fn standardize_clip(mut row: ArrayViewMut1<f64>, clip: f64) {
    let (mean, sd) = mean_sd(row.view());
    if sd > 0.0 && sd.is_finite() {
        row.mapv_inplace(|v| ((v - mean) / sd).clamp(-clip, clip));
    } else {
        row.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_bins() {
        // items sorted as 3, 1, 0, 2, 4
        let bins = equal_population_bins(&[3, 1, 0, 2, 4], 2);
        assert_eq!(bins, vec![0, 0, 1, 0, 1]);
        assert_eq!(equal_population_bins(&[0, 1, 2], 10), vec![0, 3, 6]);
    }

    #[test]
    fn test_standardize() {
        let mut row = array![1.0, 2.0, 3.0, 4.0];
        standardize_clip(row.view_mut(), 10.0);
        assert_relative_eq!(row.sum(), 0.0, epsilon = 1e-12);
        let (_, sd) = mean_sd(row.view());
        assert_relative_eq!(sd, 1.0, epsilon = 1e-12);

        let mut row = array![0.0, 0.0, 0.0, 100.0];
        standardize_clip(row.view_mut(), 1.0);
        assert_eq!(row[3], 1.0);
        assert_eq!(row[0], -0.5);

        let mut flat = array![2.0, 2.0, 2.0];
        standardize_clip(flat.view_mut(), 10.0);
        assert_eq!(flat, array![0.0, 0.0, 0.0]);
    }
}
