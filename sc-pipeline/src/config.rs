//! Run configuration. Every effect-bearing parameter of every stage lives here; the
//! whole tree (de)serializes from JSON and missing fields take their defaults.
use crate::error::PipelineError;
pub use diff_exp::MarkerParams;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One way of matching a gene id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// id starts with the string
    Prefix(String),
    /// id equals the string
    Exact(String),
    /// id contains the string
    Contains(String),
}

impl Pattern {
    fn matches(&self, gene: &str, case_insensitive: bool) -> bool {
        let (p, g) = match self {
            Pattern::Prefix(p) | Pattern::Exact(p) | Pattern::Contains(p) => (p.as_str(), gene),
        };
        if case_insensitive {
            let (p, g) = (p.to_lowercase(), g.to_lowercase());
            self.test(&p, &g)
        } else {
            self.test(p, g)
        }
    }

    fn test(&self, p: &str, g: &str) -> bool {
        match self {
            Pattern::Prefix(_) => g.starts_with(p),
            Pattern::Exact(_) => g == p,
            Pattern::Contains(_) => g.contains(p),
        }
    }
}

/// A named set of gene patterns; a gene is selected when any pattern matches
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneSelector {
    /// name used in logs and reports
    pub name: String,
    /// patterns, any of which selects a gene
    pub patterns: Vec<Pattern>,
    /// compare ids ignoring case
    #[serde(default)]
    pub case_insensitive: bool,
}

impl GeneSelector {
    /// Selector from a name and patterns, matching case-sensitively
    pub fn new(name: impl Into<String>, patterns: Vec<Pattern>) -> Self {
        GeneSelector {
            name: name.into(),
            patterns,
            case_insensitive: false,
        }
    }

    /// Same selector, ignoring case
    pub fn ignore_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Whether `gene` is selected
    pub fn matches(&self, gene: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(gene, self.case_insensitive))
    }

    /// Mitochondrial genes: prefix `mt-`, any case
    pub fn mitochondrial() -> Self {
        GeneSelector::new("mitochondrial", vec![Pattern::Prefix("mt-".into())]).ignore_case()
    }

    /// Ribosomal protein genes: prefixes `Rps` / `Rpl`, any case
    pub fn ribosomal() -> Self {
        GeneSelector::new(
            "ribosomal",
            vec![Pattern::Prefix("Rps".into()), Pattern::Prefix("Rpl".into())],
        )
        .ignore_case()
    }
}

/// A contamination signature with two independent thresholds on its count fraction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContaminationFilter {
    /// name of the fraction in cell metadata
    pub name: String,
    /// genes of the signature
    pub genes: GeneSelector,
    /// cells with a larger fraction are removed
    #[serde(default)]
    pub remove_above: Option<f64>,
    /// cells with a larger fraction are flagged but kept
    #[serde(default)]
    pub flag_above: Option<f64>,
}

/// Gene and cell filters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    /// genes matching any of these are dropped
    pub exclude: Vec<GeneSelector>,
    /// genes counted in `percent_mito`
    pub mitochondrial: GeneSelector,
    /// genes counted in `percent_ribo`
    pub ribosomal: GeneSelector,
    /// genes detected in fewer cells are dropped
    pub min_cells_per_gene: usize,
    /// minimum detected features per cell
    pub min_features: Option<usize>,
    /// maximum detected features per cell
    pub max_features: Option<usize>,
    /// minimum total counts per cell
    pub min_library_size: Option<f64>,
    /// maximum total counts per cell
    pub max_library_size: Option<f64>,
    /// contamination signatures
    pub contamination: Vec<ContaminationFilter>,
}

impl Default for QcParams {
    fn default() -> Self {
        QcParams {
            exclude: vec![],
            mitochondrial: GeneSelector::mitochondrial(),
            ribosomal: GeneSelector::ribosomal(),
            min_cells_per_gene: 3,
            min_features: Some(200),
            max_features: None,
            min_library_size: None,
            max_library_size: None,
            contamination: vec![],
        }
    }
}

/// Normalization scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    /// `ln(1 + x / total * scale)`
    LogNormalize,
    /// `x / total * scale`
    RelativeCounts,
}

/// Library-size normalization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationParams {
    /// scheme
    pub method: NormalizationMethod,
    /// per-cell total after scaling
    pub scale_factor: f64,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        NormalizationParams {
            method: NormalizationMethod::LogNormalize,
            scale_factor: 1e4,
        }
    }
}

/// How variable features are chosen from the scaled dispersions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvgSelection {
    /// the `n` genes with the largest scaled dispersion, all genes when `None`
    TopN(Option<usize>),
    /// genes inside a mean window with a scaled dispersion above a cutoff
    Cutoffs {
        /// lowest mean expression
        mean_min: f64,
        /// highest mean expression
        mean_max: f64,
        /// lowest scaled dispersion
        dispersion_min: f64,
    },
}

/// Variable feature selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HvgParams {
    /// equal-population mean bins
    pub num_bins: usize,
    /// selection rule
    pub selection: HvgSelection,
}

impl Default for HvgParams {
    fn default() -> Self {
        HvgParams {
            num_bins: 20,
            selection: HvgSelection::TopN(None),
        }
    }
}

/// Cell-cycle module scores
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellCycleParams {
    /// S-phase genes; scoring is skipped when empty
    pub s_genes: Vec<String>,
    /// G2/M-phase genes; scoring is skipped when empty
    pub g2m_genes: Vec<String>,
    /// expression bins control genes are drawn from
    pub num_bins: usize,
    /// control genes drawn per signature gene
    pub controls_per_gene: usize,
    /// regress the S and G2M scores out and rerun PCA
    pub regress: bool,
    /// seed of the control-gene draw
    pub seed: u64,
}

impl Default for CellCycleParams {
    fn default() -> Self {
        CellCycleParams {
            s_genes: vec![],
            g2m_genes: vec![],
            num_bins: 24,
            controls_per_gene: 100,
            regress: false,
            seed: 2,
        }
    }
}

/// A per-cell covariate regressed out of every variable gene
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    /// `ln(1 + total counts)` of the cell
    LogLibrarySize,
    /// detected features
    DetectedFeatures,
    /// percent mitochondrial counts
    PercentMito,
    /// percent ribosomal counts
    PercentRibo,
    /// a named contamination fraction
    Contamination(String),
    /// S and G2M scores
    CellCycle,
}

/// Regression and scaling
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// covariates; empty means plain z-scoring
    pub covariates: Vec<Covariate>,
    /// scaled values are clipped to `[-clip, clip]`
    pub clip: f64,
}

impl Default for ScaleParams {
    fn default() -> Self {
        ScaleParams {
            covariates: vec![Covariate::LogLibrarySize],
            clip: 10.0,
        }
    }
}

/// Principal components
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaParams {
    /// components to compute
    pub num_components: usize,
    /// multiple of `num_components` used as projection columns
    pub l_multiplier: f64,
    /// power iterations
    pub power_iterations: usize,
    /// seed of the random projection
    pub seed: u64,
}

impl Default for PcaParams {
    fn default() -> Self {
        PcaParams {
            num_components: 20,
            l_multiplier: 10.0,
            power_iterations: 2,
            seed: 42,
        }
    }
}

/// Permutation significance of components
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JackStrawParams {
    /// run the test; otherwise `NeighborParams::dims` or all components are used
    pub enabled: bool,
    /// replicates
    pub replicates: usize,
    /// fraction of variable genes permuted per replicate
    pub prop_freq: f64,
    /// minimum number of permuted genes
    pub min_genes: usize,
    /// significance level of the per-component KS test
    pub alpha: f64,
    /// lower bound on the selected dimensions
    pub min_components: usize,
    /// replicate `r` is seeded with `seed + r`
    pub seed: u64,
}

impl Default for JackStrawParams {
    fn default() -> Self {
        JackStrawParams {
            enabled: true,
            replicates: 10,
            prop_freq: 0.01,
            min_genes: 3,
            alpha: 1e-3,
            min_components: 5,
            seed: 100,
        }
    }
}

/// Neighbor graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborParams {
    /// neighbors per cell, derived from the cell count when `None`
    pub k: Option<usize>,
    /// components used, chosen by JackStraw when `None`
    pub dims: Option<usize>,
    /// shared-neighbor weights below this are dropped
    pub prune: f64,
}

impl Default for NeighborParams {
    fn default() -> Self {
        NeighborParams {
            k: None,
            dims: None,
            prune: 1.0 / 15.0,
        }
    }
}

/// Louvain clustering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// modularity resolution; lower gives fewer clusters
    pub resolution: f64,
    /// random starts
    pub n_starts: usize,
    /// aggregation rounds per start
    pub max_iterations: usize,
    /// start `s` is seeded with `seed + s`
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            resolution: louvain::louvain::DEFAULT_RESOLUTION,
            n_starts: 10,
            max_iterations: louvain::louvain::DEFAULT_MAX_ITERATIONS,
            seed: 0,
        }
    }
}

/// Artificial-doublet detection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubletParams {
    /// run the detector
    pub enabled: bool,
    /// expected doublet fraction of the real cells
    pub doublet_rate: f64,
    /// fraction of artificial doublets in the merged population
    pub pn: f64,
    /// neighborhood size as a fraction of the merged population
    pub pk: f64,
    /// components of the merged embedding
    pub num_pcs: usize,
    /// discount the expected count by the homotypic doublet proportion
    pub homotypic_adjustment: bool,
    /// seed of the pair draw
    pub seed: u64,
}

impl Default for DoubletParams {
    fn default() -> Self {
        DoubletParams {
            enabled: true,
            doublet_rate: 0.04,
            pn: 0.25,
            pk: 0.09,
            num_pcs: 10,
            homotypic_adjustment: false,
            seed: 4,
        }
    }
}

/// t-SNE of the selected components
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsneParams {
    /// run the embedding
    pub enabled: bool,
    /// output dimensions
    pub n_dims: usize,
    /// target perplexity
    pub perplexity: f64,
    /// gradient steps
    pub max_iter: usize,
    /// step size
    pub learning_rate: f64,
    /// seed of the initial layout
    pub seed: u64,
}

impl Default for TsneParams {
    fn default() -> Self {
        TsneParams {
            enabled: true,
            n_dims: 2,
            perplexity: 30.0,
            max_iter: 1000,
            learning_rate: 200.0,
            seed: 1,
        }
    }
}

/// Complete run configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// quality control
    pub qc: QcParams,
    /// normalization
    pub normalization: NormalizationParams,
    /// variable features
    pub hvg: HvgParams,
    /// cell-cycle scoring
    pub cell_cycle: CellCycleParams,
    /// regression and scaling
    pub scale: ScaleParams,
    /// principal components
    pub pca: PcaParams,
    /// component significance
    pub jackstraw: JackStrawParams,
    /// neighbor graph
    pub neighbors: NeighborParams,
    /// clustering
    pub clustering: ClusterParams,
    /// doublets
    pub doublets: DoubletParams,
    /// markers
    pub markers: MarkerParams,
    /// t-SNE
    pub tsne: TsneParams,
    /// separator before the group token of a cell id; `_` when empty
    pub group_delimiter: String,
    /// groups that get their own normalized matrix
    pub groups_of_interest: Vec<String>,
    /// human-readable cluster names by label
    pub cluster_names: BTreeMap<usize, String>,
}

impl PipelineConfig {
    /// Load a JSON configuration
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            stage: crate::error::Stage::Input,
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig =
            serde_json::from_str(&text).map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the seed of every stochastic stage
    pub fn set_seed(&mut self, seed: u64) {
        self.cell_cycle.seed = seed;
        self.pca.seed = seed;
        self.jackstraw.seed = seed;
        self.clustering.seed = seed;
        self.doublets.seed = seed;
        self.tsne.seed = seed;
    }

    /// Delimiter in front of the group token of a cell id
    pub fn group_delimiter(&self) -> &str {
        if self.group_delimiter.is_empty() {
            "_"
        } else {
            &self.group_delimiter
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<(), PipelineError> {
        fn check(ok: bool, msg: &str) -> Result<(), PipelineError> {
            if ok {
                Ok(())
            } else {
                Err(PipelineError::Config(msg.to_string()))
            }
        }
        let fraction = |v: f64| (0.0..=1.0).contains(&v);

        check(self.normalization.scale_factor > 0.0, "normalization.scale_factor must be positive")?;
        check(self.hvg.num_bins > 0, "hvg.num_bins must be positive")?;
        check(self.cell_cycle.num_bins > 0, "cell_cycle.num_bins must be positive")?;
        check(self.scale.clip > 0.0, "scale.clip must be positive")?;
        check(self.pca.num_components > 0, "pca.num_components must be positive")?;
        check(self.pca.l_multiplier >= 1.0, "pca.l_multiplier must be at least 1")?;
        check(
            !self.jackstraw.enabled || self.jackstraw.replicates > 0,
            "jackstraw.replicates must be positive",
        )?;
        check(
            self.jackstraw.prop_freq > 0.0 && self.jackstraw.prop_freq <= 1.0,
            "jackstraw.prop_freq must be in (0, 1]",
        )?;
        check(self.jackstraw.alpha > 0.0, "jackstraw.alpha must be positive")?;
        check(self.neighbors.k != Some(0), "neighbors.k must be positive")?;
        check(self.neighbors.dims != Some(0), "neighbors.dims must be positive")?;
        check(fraction(self.neighbors.prune), "neighbors.prune must be in [0, 1]")?;
        check(self.clustering.resolution > 0.0, "clustering.resolution must be positive")?;
        check(self.clustering.n_starts > 0, "clustering.n_starts must be positive")?;
        check(fraction(self.doublets.doublet_rate), "doublets.doublet_rate must be in [0, 1]")?;
        check(
            self.doublets.pn >= 0.0 && self.doublets.pn < 1.0,
            "doublets.pn must be in [0, 1)",
        )?;
        check(
            self.doublets.pk > 0.0 && self.doublets.pk <= 1.0,
            "doublets.pk must be in (0, 1]",
        )?;
        check(self.doublets.num_pcs > 0, "doublets.num_pcs must be positive")?;
        check(fraction(self.markers.min_pct), "markers.min_pct must be in [0, 1]")?;
        check(self.tsne.perplexity > 0.0, "tsne.perplexity must be positive")?;
        for f in &self.qc.contamination {
            for t in [f.remove_above, f.flag_above].into_iter().flatten() {
                check(fraction(t), "contamination thresholds are fractions in [0, 1]")?;
            }
        }
        Ok(())
    }
}
