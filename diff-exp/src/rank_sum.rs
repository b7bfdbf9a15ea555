//! Wilcoxon rank-sum (Mann-Whitney U) test on pre-computed mid-ranks.
//!
//! Ranks are computed once per gene over all cells and then reused for every
//! cluster-vs-rest contrast, so a contrast only costs a pass over the ranks.

use statrs::function::erf::erfc;

/// Mid-ranks (1-based) of a sample, plus the tie term `sum(t^3 - t)` over groups of tied values.
#[derive(Clone, Debug, PartialEq)]
pub struct Ranks {
    /// rank of each value, in input order
    pub ranks: Vec<f64>,
    /// tie correction term
    pub tie_sum: f64,
}

/// Assign average ranks to `values`; tied values share the mean of their positions.
pub fn rank_average(values: &[f64]) -> Ranks {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));

    let mut ranks = vec![0.0; n];
    let mut tie_sum = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && values[order[j]] == values[order[i]] {
            j += 1;
        }
        // positions i+1 ..= j share their mean
        let rank = (i + 1 + j) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = rank;
        }
        let t = (j - i) as f64;
        tie_sum += t * t * t - t;
        i = j;
    }

    Ranks { ranks, tie_sum }
}

/// Outcome of one rank-sum contrast
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RankSumTest {
    /// Mann-Whitney U of the in-group
    pub u: f64,
    /// `U / (n_in * n_out)`: probability that a random in-group value exceeds a random out-group value
    pub auc: f64,
    /// continuity corrected normal score
    pub z: f64,
    /// two-sided p-value
    pub p_value: f64,
}

/// Two-sided Wilcoxon rank-sum test of the values flagged by `in_group` against the rest,
/// using the normal approximation with tie and continuity correction.
pub fn rank_sum_test(ranks: &Ranks, in_group: &[bool]) -> RankSumTest {
    assert_eq!(ranks.ranks.len(), in_group.len());

    let mut n_in = 0usize;
    let mut rank_sum_in = 0.0;
    for (&r, &is_in) in ranks.ranks.iter().zip(in_group) {
        if is_in {
            n_in += 1;
            rank_sum_in += r;
        }
    }
    let n_out = in_group.len() - n_in;
    if n_in == 0 || n_out == 0 {
        return RankSumTest {
            u: 0.0,
            auc: 0.5,
            z: 0.0,
            p_value: 1.0,
        };
    }

    let (n1, n2) = (n_in as f64, n_out as f64);
    let n = n1 + n2;
    let u = rank_sum_in - n1 * (n1 + 1.0) / 2.0;
    let auc = u / (n1 * n2);

    let sigma2 = n1 * n2 / 12.0 * ((n + 1.0) - ranks.tie_sum / (n * (n - 1.0)));
    if sigma2 <= 0.0 {
        // every value tied
        return RankSumTest {
            u,
            auc,
            z: 0.0,
            p_value: 1.0,
        };
    }

    let d = u - n1 * n2 / 2.0;
    let correction = if d > 0.0 {
        0.5
    } else if d < 0.0 {
        -0.5
    } else {
        0.0
    };
    let z = (d - correction) / sigma2.sqrt();
    RankSumTest {
        u,
        auc,
        z,
        p_value: two_sided_normal_p(z),
    }
}

/// `2 * P(Z > |z|)` for a standard normal `Z`, capped at 1.
pub fn two_sided_normal_p(z: f64) -> f64 {
    if !z.is_finite() {
        return if z.is_nan() { 1.0 } else { 0.0 };
    }
    // P(Z > |z|) = erfc(|z| / sqrt(2)) / 2
    erfc(z.abs() / std::f64::consts::SQRT_2).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mid_ranks() {
        let r = rank_average(&[2.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(r.ranks, vec![5.0, 2.0, 2.0, 4.0, 2.0]);
        assert_eq!(r.tie_sum, 24.0);

        let r = rank_average(&[3.0, 1.0, 2.0]);
        assert_eq!(r.ranks, vec![3.0, 1.0, 2.0]);
        assert_eq!(r.tie_sum, 0.0);
    }

    #[test]
    fn test_separated_groups() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let ranks = rank_average(&values);

        // low values in the group: wilcox.test(1:5, 6:10, exact = FALSE) gives p = 0.01219
        let low: Vec<bool> = (0..10).map(|i| i < 5).collect();
        let t = rank_sum_test(&ranks, &low);
        assert_eq!(t.u, 0.0);
        assert_eq!(t.auc, 0.0);
        assert!(t.z < 0.0);
        assert_relative_eq!(t.p_value, 0.01219, epsilon = 2e-4);

        let high: Vec<bool> = low.iter().map(|b| !b).collect();
        let t2 = rank_sum_test(&ranks, &high);
        assert_eq!(t2.auc, 1.0);
        assert_relative_eq!(t2.p_value, t.p_value, epsilon = 1e-12);
    }

    #[test]
    fn test_all_tied_and_empty_groups() {
        let ranks = rank_average(&[0.0; 6]);
        let t = rank_sum_test(&ranks, &[true, true, false, false, false, false]);
        assert_eq!(t.p_value, 1.0);
        assert_relative_eq!(t.auc, 0.5);

        let t = rank_sum_test(&ranks, &[false; 6]);
        assert_eq!(t.p_value, 1.0);
    }

    #[test]
    fn test_normal_tail() {
        assert_relative_eq!(two_sided_normal_p(0.0), 1.0);
        assert_relative_eq!(two_sided_normal_p(1.959963984540054), 0.05, epsilon = 1e-9);
        assert_relative_eq!(two_sided_normal_p(-1.959963984540054), 0.05, epsilon = 1e-9);
    }
}
