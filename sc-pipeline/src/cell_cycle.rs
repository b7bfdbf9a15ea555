//! Cell-cycle module scores.
//!
//! A module score is the mean expression of the signature genes minus the mean expression
//! of control genes drawn from the same average-expression bins. Each cell gets an S and a
//! G2M score and a phase call.
use crate::config::CellCycleParams;
use crate::matrix::Phase;
use crate::stats::equal_population_bins;
use diff_exp::Statistics;
use log::{info, warn};
use ndarray::{ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Per-cell S and G2M scores with the phase they imply
#[derive(Clone, Debug, PartialEq)]
pub struct CellCycleScores {
    /// S module score
    pub s: Vec<f64>,
    /// G2M module score
    pub g2m: Vec<f64>,
    /// phase call
    pub phase: Vec<Phase>,
}

/// Phase implied by a pair of scores: G1 when both are negative, otherwise the larger one
pub fn call_phase(s: f64, g2m: f64) -> Phase {
    if s < 0.0 && g2m < 0.0 {
        Phase::G1
    } else if s > g2m {
        Phase::S
    } else {
        Phase::G2M
    }
}

struct ModuleScorer<'a> {
    data: ArrayView2<'a, f64>,
    bins: Vec<usize>,
    bin_members: Vec<Vec<usize>>,
    controls_per_gene: usize,
}

impl<'a> ModuleScorer<'a> {
    fn new(data: ArrayView2<'a, f64>, gene_ids: &[String], num_bins: usize, controls_per_gene: usize) -> Self {
        let averages = data
            .axis_iter(Axis(0))
            .map(|row| row.to_vec().mean())
            .collect::<Vec<_>>();
        let mut order = (0..averages.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            averages[a]
                .partial_cmp(&averages[b])
                .unwrap_or(Ordering::Equal)
                .then_with(|| gene_ids[a].cmp(&gene_ids[b]))
        });
        let bins = equal_population_bins(&order, num_bins);
        let mut bin_members = vec![Vec::new(); num_bins.max(1)];
        for (g, &b) in bins.iter().enumerate() {
            bin_members[b].push(g);
        }
        ModuleScorer {
            data,
            bins,
            bin_members,
            controls_per_gene,
        }
    }

    /// Control genes of a signature: for each signature gene, draw up to
    /// `controls_per_gene` genes of its bin without replacement
    fn controls(&self, signature: &[usize], rng: &mut Pcg64Mcg) -> Vec<usize> {
        let mut controls = BTreeSet::new();
        for &g in signature {
            let members = &self.bin_members[self.bins[g]];
            controls.extend(members.choose_multiple(rng, self.controls_per_gene).copied());
        }
        controls.into_iter().collect()
    }

    fn mean_over(&self, genes: &[usize]) -> Vec<f64> {
        self.data
            .axis_iter(Axis(1))
            .map(|col| genes.iter().map(|&g| col[g]).collect::<Vec<_>>().mean())
            .collect()
    }

    fn score(&self, signature: &[usize], rng: &mut Pcg64Mcg) -> Vec<f64> {
        let controls = self.controls(signature, rng);
        let features = self.mean_over(signature);
        let background = self.mean_over(&controls);
        features.iter().zip(background).map(|(f, b)| f - b).collect()
    }
}

/// Score every cell of a log-normalized genes x cells matrix. Returns `None` (with a
/// warning) when either signature has no gene in the matrix.
pub fn score_cell_cycle(
    normalized: ArrayView2<f64>,
    gene_ids: &[String],
    params: &CellCycleParams,
) -> Option<CellCycleScores> {
    let index: HashMap<&str, usize> = gene_ids.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect();
    let present = |genes: &[String]| genes.iter().filter_map(|g| index.get(g.as_str()).copied()).collect::<Vec<_>>();
    let s_genes = present(&params.s_genes);
    let g2m_genes = present(&params.g2m_genes);
    if s_genes.is_empty() || g2m_genes.is_empty() {
        warn!(
            "cell-cycle scoring skipped: {} S and {} G2M signature genes in the matrix",
            s_genes.len(),
            g2m_genes.len()
        );
        return None;
    }

    let scorer = ModuleScorer::new(normalized, gene_ids, params.num_bins, params.controls_per_gene);
    let mut rng = Pcg64Mcg::seed_from_u64(params.seed);
    let s = scorer.score(&s_genes, &mut rng);
    let g2m = scorer.score(&g2m_genes, &mut rng);
    let phase = s.iter().zip(&g2m).map(|(&s, &g)| call_phase(s, g)).collect::<Vec<_>>();

    let count = |p: Phase| phase.iter().filter(|&&x| x == p).count();
    info!(
        "cell-cycle phases: {} G1, {} S, {} G2M",
        count(Phase::G1),
        count(Phase::S),
        count(Phase::G2M)
    );
    Some(CellCycleScores { s, g2m, phase })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::Rng;

    #[test]
    fn test_call_phase() {
        assert_eq!(call_phase(-0.1, -0.2), Phase::G1);
        assert_eq!(call_phase(0.3, -0.2), Phase::S);
        assert_eq!(call_phase(-0.3, 0.2), Phase::G2M);
        assert_eq!(call_phase(0.2, 0.5), Phase::G2M);
    }

    /// 200 background genes and two 10-gene signatures over 90 cells; cells 0..30 express
    /// the S signature, cells 30..60 the G2M one, the rest neither.
    fn cycling_data() -> (Array2<f64>, Vec<String>, CellCycleParams) {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let mut ids = (0..200).map(|g| format!("bg{g}")).collect::<Vec<_>>();
        ids.extend((0..10).map(|g| format!("s{g}")));
        ids.extend((0..10).map(|g| format!("g2m{g}")));
        let data = Array2::from_shape_fn((220, 90), |(g, c)| {
            let base = rng.gen_range(0.5..1.5);
            match (g, c) {
                (200..=209, 0..=29) | (210..=219, 30..=59) => base + 2.0,
                _ => base,
            }
        });
        let params = CellCycleParams {
            s_genes: (0..10).map(|g| format!("s{g}")).collect(),
            g2m_genes: (0..10).map(|g| format!("g2m{g}")).chain(["absent".to_string()]).collect(),
            controls_per_gene: 20,
            ..CellCycleParams::default()
        };
        (data, ids, params)
    }

    #[test]
    fn test_phases() {
        let (data, ids, params) = cycling_data();
        let scores = score_cell_cycle(data.view(), &ids, &params).unwrap();
        assert!(scores.phase[..30].iter().all(|&p| p == Phase::S));
        assert!(scores.phase[30..60].iter().all(|&p| p == Phase::G2M));
        assert!(scores.s[..30].iter().all(|&s| s > 0.5));
        assert!(scores.s[60..].iter().all(|&s| s.abs() < 1.0));

        let again = score_cell_cycle(data.view(), &ids, &params).unwrap();
        assert_eq!(scores, again);
    }

    #[test]
    fn test_missing_signature() {
        let (data, ids, mut params) = cycling_data();
        params.g2m_genes = vec!["absent".into()];
        assert!(score_cell_cycle(data.view(), &ids, &params).is_none());
    }
}
