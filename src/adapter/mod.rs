//! Per-comparison engine dispatch.
//!
//! For one planned comparison this module restricts the data to the cells on either
//! side, optionally aggregates them into replicate-level pseudo-bulk profiles, builds
//! the design, invokes the selected engine, and maps the raw engine output onto the
//! canonical result schema. Detection rates are always computed on the per-cell
//! counts; the multiple-testing correction is applied here, across this comparison's
//! genes only.

use anyhow::{Result, anyhow};
use log::{debug, info};
use ndarray::Array2;
use single_utilities::traits::FloatOpsTS;

use crate::correction::Correction;
use crate::engines::design::{self, DesignMatrix};
use crate::engines::{EngineInput, Method, Shrinkage};
use crate::extract::ExtractedData;
use crate::plan::Comparison;
use crate::{DeRecord, Verbosity};

const SIDE_NONE: u8 = 0;
const SIDE_A: u8 = 1;
const SIDE_B: u8 = 2;

/// Run one comparison end to end and return its rows in matrix gene order.
pub fn run_comparison<T>(
    data: &ExtractedData<T>,
    covariates: Option<&Array2<f64>>,
    comparison: &Comparison,
    method: Method,
    shrinkage: Option<Shrinkage>,
    correction: Correction,
    verbosity: Verbosity,
) -> Result<Vec<DeRecord>>
where
    T: FloatOpsTS,
{
    let n_genes = data.counts.nrows();
    let n_cells = data.counts.ncols();
    if n_genes == 0 {
        return Ok(Vec::new());
    }

    // Cells outside both sides are excluded from this comparison's fit.
    let mut side_of = vec![SIDE_NONE; n_cells];
    let mut cells_a = 0usize;
    let mut cells_b = 0usize;
    for (cell, &code) in data.grouping.codes().iter().enumerate() {
        if comparison.side_a.contains(&code) {
            side_of[cell] = SIDE_A;
            cells_a += 1;
        } else if comparison.side_b.contains(&code) {
            side_of[cell] = SIDE_B;
            cells_b += 1;
        }
    }
    if cells_a == 0 || cells_b == 0 {
        let empty = if cells_a == 0 {
            &comparison.label_a
        } else {
            &comparison.label_b
        };
        return Err(anyhow!(
            "Comparison '{}' vs '{}': side '{}' has no cells",
            comparison.label_a,
            comparison.label_b,
            empty
        ));
    }

    let (rate1, rate2) = detection_rates(data, &side_of, cells_a, cells_b);

    let samples = match &data.replicates {
        Some(replicates) => Samples::pseudo_bulk(&side_of, replicates.codes(), comparison)?,
        None => Samples::per_cell(&side_of),
    };

    if verbosity.at_least(Verbosity::Summary) {
        info!(
            "comparison '{}' vs '{}': {} vs {} cells, {} sample(s) in the fit",
            comparison.label_a,
            comparison.label_b,
            cells_a,
            cells_b,
            samples.n_samples()
        );
    }

    let counts = samples.dense_counts(data);
    let engine_covariates = samples.covariates(covariates);

    let design = DesignMatrix::build(&samples.indicator, engine_covariates.as_ref())?;
    let size_factors = design::size_factors(&counts.view())?;

    let input = EngineInput {
        counts: counts.view(),
        design: &design,
        size_factors: &size_factors,
        shrinkage,
    };
    let output = method.engine().run(&input)?;

    if verbosity.at_least(Verbosity::Detailed) {
        debug!(
            "comparison '{}' vs '{}': engine '{}' returned {} rows",
            comparison.label_a,
            comparison.label_b,
            method.name(),
            output.pvalue.len()
        );
    }

    let padj = correction.adjust(&output.pvalue)?;

    Ok((0..n_genes)
        .map(|gene| DeRecord {
            feature: data.genes[gene].clone(),
            group1: comparison.label_a.clone(),
            group2: comparison.label_b.clone(),
            ave_expr: output.ave_expr[gene],
            log_fc: output.log_fc[gene],
            stat: output.stat[gene],
            pvalue: output.pvalue[gene],
            padj: padj[gene],
            rate1: rate1[gene],
            rate2: rate2[gene],
        })
        .collect())
}

/// Fraction of cells with a non-zero count per gene, per side.
fn detection_rates<T>(
    data: &ExtractedData<T>,
    side_of: &[u8],
    cells_a: usize,
    cells_b: usize,
) -> (Vec<f64>, Vec<f64>)
where
    T: FloatOpsTS,
{
    let n_genes = data.counts.nrows();
    let mut nonzero_a = vec![0usize; n_genes];
    let mut nonzero_b = vec![0usize; n_genes];

    for (gene, cell, value) in data.counts.triplet_iter() {
        if num_traits::Zero::is_zero(value) {
            continue;
        }
        match side_of[cell] {
            SIDE_A => nonzero_a[gene] += 1,
            SIDE_B => nonzero_b[gene] += 1,
            _ => {}
        }
    }

    let rate1 = nonzero_a
        .into_iter()
        .map(|count| count as f64 / cells_a as f64)
        .collect();
    let rate2 = nonzero_b
        .into_iter()
        .map(|count| count as f64 / cells_b as f64)
        .collect();
    (rate1, rate2)
}

/// The engine-facing sample layout of one comparison: either the selected
/// cells themselves, or one pseudo-bulk profile per (replicate, side).
struct Samples {
    /// For each cell, the sample it contributes to
    sample_of_cell: Vec<Option<usize>>,
    /// Side-a indicator per sample
    indicator: Vec<f64>,
    pseudo_bulk: bool,
}

impl Samples {
    fn per_cell(side_of: &[u8]) -> Self {
        let mut sample_of_cell = vec![None; side_of.len()];
        let mut indicator = Vec::new();
        for (cell, &side) in side_of.iter().enumerate() {
            if side != SIDE_NONE {
                sample_of_cell[cell] = Some(indicator.len());
                indicator.push(if side == SIDE_A { 1.0 } else { 0.0 });
            }
        }
        Samples {
            sample_of_cell,
            indicator,
            pseudo_bulk: false,
        }
    }

    /// One profile per (replicate, side) pair, in first-seen cell order.
    /// Each side needs at least two profiles for a variance estimate.
    fn pseudo_bulk(side_of: &[u8], replicate_codes: &[usize], comparison: &Comparison) -> Result<Self> {
        let mut profile_of: std::collections::HashMap<(usize, u8), usize> =
            std::collections::HashMap::new();
        let mut sample_of_cell = vec![None; side_of.len()];
        let mut indicator = Vec::new();

        for (cell, &side) in side_of.iter().enumerate() {
            if side == SIDE_NONE {
                continue;
            }
            let key = (replicate_codes[cell], side);
            let sample = *profile_of.entry(key).or_insert_with(|| {
                indicator.push(if side == SIDE_A { 1.0 } else { 0.0 });
                indicator.len() - 1
            });
            sample_of_cell[cell] = Some(sample);
        }

        let profiles_a = indicator.iter().filter(|&&value| value > 0.0).count();
        let profiles_b = indicator.len() - profiles_a;
        for (side_label, profiles) in [
            (&comparison.label_a, profiles_a),
            (&comparison.label_b, profiles_b),
        ] {
            if profiles < 2 {
                return Err(anyhow!(
                    "Comparison '{}' vs '{}': pseudo-bulk testing needs at least two replicate profiles per side, side '{}' has {}",
                    comparison.label_a,
                    comparison.label_b,
                    side_label,
                    profiles
                ));
            }
        }

        Ok(Samples {
            sample_of_cell,
            indicator,
            pseudo_bulk: true,
        })
    }

    fn n_samples(&self) -> usize {
        self.indicator.len()
    }

    /// Dense genes x samples block: per-cell columns, or per-profile sums.
    fn dense_counts<T>(&self, data: &ExtractedData<T>) -> Array2<f64>
    where
        T: FloatOpsTS,
    {
        let mut counts = Array2::<f64>::zeros((data.counts.nrows(), self.n_samples()));
        for (gene, cell, value) in data.counts.triplet_iter() {
            if let Some(sample) = self.sample_of_cell[cell] {
                counts[[gene, sample]] += value.to_f64().unwrap_or(0.0);
            }
        }
        counts
    }

    /// Covariates aligned to the sample layout: subset rows in per-cell mode,
    /// per-profile means in pseudo-bulk mode.
    fn covariates(&self, covariates: Option<&Array2<f64>>) -> Option<Array2<f64>> {
        let covariates = covariates?;
        let mut aligned = Array2::<f64>::zeros((self.n_samples(), covariates.ncols()));

        if self.pseudo_bulk {
            let mut members = vec![0.0; self.n_samples()];
            for (cell, sample) in self.sample_of_cell.iter().enumerate() {
                if let Some(sample) = *sample {
                    members[sample] += 1.0;
                    for column in 0..covariates.ncols() {
                        aligned[[sample, column]] += covariates[[cell, column]];
                    }
                }
            }
            for sample in 0..self.n_samples() {
                if members[sample] > 0.0 {
                    for column in 0..covariates.ncols() {
                        aligned[[sample, column]] /= members[sample];
                    }
                }
            }
        } else {
            for (cell, sample) in self.sample_of_cell.iter().enumerate() {
                if let Some(sample) = *sample {
                    for column in 0..covariates.ncols() {
                        aligned[[sample, column]] = covariates[[cell, column]];
                    }
                }
            }
        }

        Some(aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::GroupFactor;
    use nalgebra_sparse::{CooMatrix, CsrMatrix};

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    /// Two genes x eight cells, gene 0 high in group A, gene 1 flat.
    fn fixture() -> (CsrMatrix<f64>, Vec<String>, GroupFactor) {
        let dense = [
            [30.0, 25.0, 28.0, 27.0, 0.0, 1.0, 0.0, 2.0],
            [5.0, 0.0, 6.0, 5.0, 5.0, 6.0, 0.0, 5.0],
        ];
        let mut coo = CooMatrix::new(2, 8);
        for (gene, row) in dense.iter().enumerate() {
            for (cell, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    coo.push(gene, cell, value);
                }
            }
        }
        let counts = CsrMatrix::from(&coo);
        let genes = labels(&["g_marker", "g_flat"]);
        let grouping =
            GroupFactor::from_labels(&labels(&["A", "A", "A", "A", "B", "B", "B", "B"]));
        (counts, genes, grouping)
    }

    fn comparison() -> Comparison {
        Comparison {
            side_a: vec![0],
            side_b: vec![1],
            label_a: "A".to_string(),
            label_b: "B".to_string(),
        }
    }

    #[test]
    fn rates_count_nonzero_cells_per_side() {
        let (counts, genes, grouping) = fixture();
        let data = ExtractedData {
            counts: &counts,
            genes: &genes,
            grouping,
            replicates: None,
        };

        let rows = run_comparison(
            &data,
            None,
            &comparison(),
            Method::ModeratedT,
            None,
            Correction::BenjaminiHochberg,
            Verbosity::Silent,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rate1, 1.0);
        assert_eq!(rows[0].rate2, 0.5);
        assert_eq!(rows[1].rate1, 0.75);
        assert_eq!(rows[1].rate2, 0.75);
        for row in &rows {
            assert!((0.0..=1.0).contains(&row.rate1));
            assert!((0.0..=1.0).contains(&row.rate2));
            assert!(row.padj >= row.pvalue);
            assert_eq!(row.group1, "A");
            assert_eq!(row.group2, "B");
        }
    }

    #[test]
    fn empty_side_is_an_error() {
        let (counts, genes, grouping) = fixture();
        let data = ExtractedData {
            counts: &counts,
            genes: &genes,
            grouping,
            replicates: None,
        };
        let missing = Comparison {
            side_a: vec![0],
            side_b: vec![5],
            label_a: "A".to_string(),
            label_b: "ghost".to_string(),
        };
        let err = run_comparison(
            &data,
            None,
            &missing,
            Method::ModeratedT,
            None,
            Correction::BenjaminiHochberg,
            Verbosity::Silent,
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no cells"));
    }

    #[test]
    fn pseudo_bulk_needs_two_profiles_per_side() {
        let (counts, genes, grouping) = fixture();
        let replicates =
            GroupFactor::from_labels(&labels(&["r1", "r1", "r2", "r2", "r3", "r3", "r3", "r3"]));
        let data = ExtractedData {
            counts: &counts,
            genes: &genes,
            grouping,
            replicates: Some(replicates),
        };
        let err = run_comparison(
            &data,
            None,
            &comparison(),
            Method::ModeratedT,
            None,
            Correction::BenjaminiHochberg,
            Verbosity::Silent,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least two replicate profiles"));
    }

    #[test]
    fn identical_runs_give_identical_rows() {
        let (counts, genes, grouping) = fixture();
        let data = ExtractedData {
            counts: &counts,
            genes: &genes,
            grouping,
            replicates: None,
        };
        let first = run_comparison(
            &data,
            None,
            &comparison(),
            Method::NbGlm,
            None,
            Correction::BenjaminiHochberg,
            Verbosity::Silent,
        )
        .unwrap();
        let second = run_comparison(
            &data,
            None,
            &comparison(),
            Method::NbGlm,
            None,
            Correction::BenjaminiHochberg,
            Verbosity::Silent,
        )
        .unwrap();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.pvalue, b.pvalue);
            assert_eq!(a.stat, b.stat);
            assert_eq!(a.log_fc, b.log_fc);
        }
    }
}
