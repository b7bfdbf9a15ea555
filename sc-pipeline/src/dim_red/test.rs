use super::rand_svd::{svd_exact, svd_rand, ExactSvd, RandSvd};
use super::*;
use approx::assert_relative_eq;
use ndarray::Array2;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;

fn seeded_rng() -> Pcg64Mcg {
    Pcg64Mcg::seed_from_u64(0)
}

/// `m x n` matrix of rank `rank` with geometrically decaying spectrum plus a little noise
fn low_rank(m: usize, n: usize, rank: usize) -> Array2<f64> {
    let mut rng = seeded_rng();
    let normal = Normal::new(0.0, 1.0).unwrap();
    let u = Array2::from_shape_fn((m, rank), |_| normal.sample(&mut rng));
    let v = Array2::from_shape_fn((rank, n), |_| normal.sample(&mut rng));
    let scale = Array1::from_iter((0..rank).map(|i| 0.5f64.powi(i as i32) * 10.0));
    let noise = Array2::from_shape_fn((m, n), |_| 0.01 * normal.sample(&mut rng));
    (&u * &scale).dot(&v) + noise
}

fn reconstruction_error(a: &Array2<f64>, (u, s, v): &SvdResult) -> f64 {
    let us = u * s;
    let diff = a.dot(v) - us;
    (diff.mapv(|x| x * x).sum() / diff.len() as f64).sqrt()
}

#[test]
fn test_rand_matches_exact() {
    for (m, n) in [(120, 60), (60, 120)] {
        let a = low_rank(m, n, 5);
        let exact = svd_exact(a.view(), 5).unwrap();
        let rand = svd_rand(a.view(), 5, 20, 2, 0).unwrap();
        for i in 0..5 {
            assert_relative_eq!(exact.1[i], rand.1[i], max_relative = 1e-4);
        }
        assert!(reconstruction_error(&a, &exact) < 1e-9);
        for i in 0..5 {
            let overlap = exact.2.column(i).dot(&rand.2.column(i));
            assert_relative_eq!(overlap.abs(), 1.0, epsilon = 1e-4);
        }
        assert_eq!(rand.0.dim(), (m, 5));
        assert_eq!(rand.2.dim(), (n, 5));
    }
}

#[test]
fn test_singular_values_descending() {
    let a = low_rank(40, 30, 8);
    let (_, s, _) = ExactSvd.run_pca(a.view(), 8).unwrap();
    for w in s.windows(2) {
        assert!(w[0] >= w[1]);
    }
}

#[test]
fn test_small_l_falls_through_to_exact() {
    let a = low_rank(12, 10, 3);
    let svd = RandSvd::default();
    assert!(svd.projection_dims(3) >= 10);
    let (_, s, _) = svd.run_pca(a.view(), 3).unwrap();
    let (_, e, _) = svd_exact(a.view(), 3).unwrap();
    assert_eq!(s, e);

    assert!(svd_exact(a.view(), 11).is_err());
    assert!(svd_rand(Array2::zeros((1, 5)).view(), 1, 2, 1, 0).is_err());
}

fn scaled_genes_by_cells() -> Array2<f64> {
    // genes x cells, rows centered
    let mut a = low_rank(80, 150, 4);
    for mut row in a.axis_iter_mut(ndarray::Axis(0)) {
        let mean = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|x| x - mean);
    }
    a
}

#[test]
fn test_run_pca() {
    let scaled = scaled_genes_by_cells();
    let params = PcaParams {
        num_components: 6,
        l_multiplier: 3.0,
        ..PcaParams::default()
    };
    let pca = run_pca(scaled.view(), &params).unwrap();
    assert_eq!(pca.embeddings.dim(), (150, 6));
    assert_eq!(pca.loadings.dim(), (80, 6));

    // sign convention
    for col in pca.loadings.columns() {
        let max = col.iter().copied().fold(0.0f64, |m, x| if x.abs() > m.abs() { x } else { m });
        assert!(max > 0.0);
    }

    // four real components carry nearly all of the variance
    let explained = pca.variance_explained.sum();
    assert!(explained <= 1.0 + 1e-9);
    assert!(pca.variance_explained.slice(ndarray::s![..4]).sum() > 0.99);

    // stdev of a component equals the sample sd of its cell scores
    let scores = pca.embeddings.column(0).to_vec();
    assert_relative_eq!(pca.stdev[0], scores.var(1.0).sqrt(), max_relative = 1e-9);

    let again = run_pca(scaled.view(), &params).unwrap();
    assert_eq!(pca, again);
}

#[test]
fn test_components_clamped() {
    let scaled = scaled_genes_by_cells().slice(ndarray::s![..5, ..]).to_owned();
    let pca = run_pca(scaled.view(), &PcaParams::default()).unwrap();
    assert_eq!(pca.num_components(), 5);
    assert_eq!(pca.embeddings_upto(3).ncols(), 3);
    assert_eq!(pca.embeddings_upto(30).ncols(), 5);
}

#[test]
fn test_zero_matrix() {
    let pca = run_pca(Array2::zeros((10, 25)).view(), &PcaParams::default()).unwrap();
    assert_eq!(pca.num_components(), 10);
    assert!(pca.embeddings.iter().all(|&x| x == 0.0));
}
