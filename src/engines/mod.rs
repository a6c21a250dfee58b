//! The statistical back-ends behind one shared interface.
//!
//! Engine selection is a closed tagged variant: negative-binomial GLM tests
//! ([`Method::NbGlm`]), a negative-binomial Wald variant with optional fold-change
//! shrinkage ([`Method::NbWald`]), and a moderated t-test on log-transformed data
//! ([`Method::ModeratedT`]). Every engine consumes the same [`EngineInput`] and
//! produces the same [`RawEngineOutput`]; the adapter owns the mapping onto the
//! final result schema.

use anyhow::{Result, anyhow};
use ndarray::ArrayView2;

pub(crate) mod design;
mod moderated_t;
mod nb_glm;
mod nb_wald;

/// The available testing engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Negative-binomial GLM with an F-like quasi-likelihood statistic
    NbGlm,
    /// Negative-binomial Wald test; the only engine honoring [`Shrinkage`]
    NbWald,
    /// Moderated t-test on log2 counts-per-million
    ModeratedT,
}

impl Method {
    /// Parse an engine name. Anything outside the closed set is an
    /// unsupported-method error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "nb_glm" => Ok(Method::NbGlm),
            "nb_wald" => Ok(Method::NbWald),
            "moderated_t" => Ok(Method::ModeratedT),
            other => Err(anyhow!(
                "Unsupported method '{}'; expected one of nb_glm, nb_wald, moderated_t",
                other
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        self.engine().name()
    }

    pub fn supports_shrinkage(&self) -> bool {
        self.engine().supports_shrinkage()
    }

    pub(crate) fn engine(&self) -> &'static dyn Engine {
        match self {
            Method::NbGlm => &nb_glm::NbGlm,
            Method::NbWald => &nb_wald::NbWald,
            Method::ModeratedT => &moderated_t::ModeratedT,
        }
    }
}

/// Log-fold-change shrinkage estimators. Deterministic; no sampling involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shrinkage {
    /// Normal prior on the group coefficient, prior variance estimated from
    /// the spread of the unshrunken estimates
    Normal,
}

/// What an engine sees for one comparison: the dense genes x samples count
/// block (per-cell or pseudo-bulk), the design, and per-sample size factors.
pub(crate) struct EngineInput<'a> {
    pub counts: ArrayView2<'a, f64>,
    pub design: &'a design::DesignMatrix,
    pub size_factors: &'a [f64],
    pub shrinkage: Option<Shrinkage>,
}

/// Per-gene engine output before column mapping. All vectors have one entry
/// per gene; `log_fc` is always log2 scale.
pub(crate) struct RawEngineOutput {
    pub ave_expr: Vec<f64>,
    pub log_fc: Vec<f64>,
    pub stat: Vec<f64>,
    pub pvalue: Vec<f64>,
}

pub(crate) trait Engine: Sync {
    fn name(&self) -> &'static str;

    fn supports_shrinkage(&self) -> bool {
        false
    }

    fn run(&self, input: &EngineInput) -> Result<RawEngineOutput>;
}

/// Size-factor-normalized copy of the count block.
pub(crate) fn normalize_counts(counts: &ArrayView2<f64>, size_factors: &[f64]) -> ndarray::Array2<f64> {
    let mut normalized = counts.to_owned();
    for (mut column, &factor) in normalized.columns_mut().into_iter().zip(size_factors) {
        if factor > 0.0 {
            column.mapv_inplace(|value| value / factor);
        }
    }
    normalized
}

/// Per-gene summary of the shared negative-binomial weighted fit used by both
/// NB engines.
pub(crate) struct NbFitSummary {
    pub fit: design::GeneFit,
    /// Mean log2 normalized count (plus pseudo-count)
    pub mean_log: f64,
    /// Mean normalized count
    pub base_mean: f64,
}

const NB_PSEUDO_COUNT: f64 = 0.5;
const NB_MIN_WEIGHT: f64 = 1e-8;

/// Fit every gene with one-step NB-weighted least squares on log2 normalized
/// counts.
///
/// Dispersion is the per-gene moment estimate shrunken halfway toward the
/// median over informative genes; working means come from the design's two
/// sides. The group coefficient lands on the log2 scale.
pub(crate) fn nb_weighted_fits(input: &EngineInput) -> Result<Vec<NbFitSummary>> {
    let normalized = normalize_counts(&input.counts, input.size_factors);
    let n_genes = normalized.nrows();
    let n_samples = normalized.ncols();

    let mut raw_phi = vec![0.0; n_genes];
    let mut informative = Vec::new();
    for (gene, row) in normalized.rows().into_iter().enumerate() {
        let mean = row.sum() / n_samples as f64;
        if mean <= 0.0 {
            continue;
        }
        let variance = row
            .iter()
            .map(|&value| (value - mean) * (value - mean))
            .sum::<f64>()
            / (n_samples as f64 - 1.0);
        let phi = ((variance - mean) / (mean * mean)).max(0.0);
        raw_phi[gene] = phi;
        if phi > 0.0 {
            informative.push(phi);
        }
    }
    let target_phi = design::median(&informative);

    let mut response = vec![0.0; n_samples];
    let mut weights = vec![0.0; n_samples];
    let mut summaries = Vec::with_capacity(n_genes);

    for (gene, row) in normalized.rows().into_iter().enumerate() {
        let phi = 0.5 * (raw_phi[gene] + target_phi);

        let (mut sum_a, mut n_a, mut sum_b, mut n_b) = (0.0, 0.0, 0.0, 0.0);
        for (sample, &value) in row.iter().enumerate() {
            if input.design.group_value(sample) > 0.0 {
                sum_a += value;
                n_a += 1.0;
            } else {
                sum_b += value;
                n_b += 1.0;
            }
        }
        let mu_a = if n_a > 0.0 { sum_a / n_a } else { 0.0 };
        let mu_b = if n_b > 0.0 { sum_b / n_b } else { 0.0 };

        for (sample, &value) in row.iter().enumerate() {
            let mu = if input.design.group_value(sample) > 0.0 {
                mu_a
            } else {
                mu_b
            };
            weights[sample] = (mu / (1.0 + phi * mu)).max(NB_MIN_WEIGHT);
            response[sample] = (value + NB_PSEUDO_COUNT).log2();
        }

        let fit = input.design.fit(&response, Some(&weights))?;
        summaries.push(NbFitSummary {
            fit,
            mean_log: response.iter().sum::<f64>() / n_samples as f64,
            base_mean: row.sum() / n_samples as f64,
        });
    }

    Ok(summaries)
}
