//! # single-de
//!
//! A specialized Rust library for differential expression testing of single-cell data, part of the single-rust ecosystem.
//!
//! This crate is a dispatch layer over a small set of interchangeable differential-expression
//! back-ends: given a gene-by-cell count matrix, per-cell group labels, and an optional
//! replicate/covariate structure, it plans a set of two-sided group comparisons, runs the
//! selected engine once per comparison, and normalizes the heterogeneous engine outputs into
//! one common result schema.
//!
//! ## Core Features
//!
//! - **Flexible comparison plans**: each-vs-rest, all-vs-all, explicit pairs, multi-level
//!   sides, and reference-level mode
//! - **Three testing engines**: negative-binomial GLM tests, a negative-binomial Wald variant
//!   with optional fold-change shrinkage, and a moderated t-test on log-transformed data
//! - **Pseudo-bulk aggregation**: replicate-aware testing when replicate labels are supplied
//! - **Marker discovery**: rate/fold-change filtered, per-group ranked marker tables
//!
//! ## Quick Start
//!
//! Build a [`DeInput`] from your count matrix and metadata, pick a [`Method`], and call
//! [`find_de`] for a full comparison table or [`find_all_markers`] for per-group marker
//! lists. Results are plain record vectors, one row per (gene, comparison) pair.
//!
//! ## Module Organization
//!
//! - **[`extract`]**: input normalization into {counts, grouping, replicates}
//! - **[`plan`]**: comparison-set construction from the flexible comparison request
//! - **[`engines`]**: the three statistical back-ends behind one trait
//! - **[`adapter`]**: per-comparison design construction, engine dispatch, column mapping
//! - **[`assemble`]**: result concatenation, ordering, and marker post-processing
//! - **[`correction`]**: multiple-testing correction

pub mod adapter;
pub mod assemble;
pub mod correction;
pub mod engines;
pub mod extract;
pub mod plan;

use anyhow::{Result, anyhow};
use log::warn;
use ndarray::Array2;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use single_utilities::traits::FloatOpsTS;

pub use crate::correction::Correction;
pub use crate::engines::{Method, Shrinkage};
pub use crate::extract::{AnnotatedMatrix, CellMetadata, ColumnSelector, DeInput, GroupFactor};
pub use crate::plan::{Compare, Comparison};

/// Diagnostic verbosity. Gates informational output only; errors and the
/// mandatory model-assumption warnings are never suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Silent,
    #[default]
    Summary,
    Detailed,
}

impl Verbosity {
    pub fn at_least(self, level: Verbosity) -> bool {
        self >= level
    }
}

/// One row of the canonical result table: a single gene tested in a single
/// two-sided comparison.
#[derive(Debug, Clone)]
pub struct DeRecord {
    /// Gene identifier
    pub feature: String,
    /// Rendered label of the first comparison side
    pub group1: String,
    /// Rendered label of the second comparison side (`"rest"` for a complement side)
    pub group2: String,
    /// Engine-specific average-expression proxy
    pub ave_expr: f64,
    /// log2 fold-change estimate, side one over side two
    pub log_fc: f64,
    /// The engine's test statistic
    pub stat: f64,
    /// Unadjusted p-value
    pub pvalue: f64,
    /// P-value adjusted within this comparison's genes only
    pub padj: f64,
    /// Fraction of side-one cells with a non-zero count
    pub rate1: f64,
    /// Fraction of side-two cells with a non-zero count
    pub rate2: f64,
}

/// One row of a per-group marker table produced by [`find_all_markers`].
///
/// In each-vs-rest mode the second side is always the complement, so the
/// marker table keeps a single `group` column and adds a within-group rank.
#[derive(Debug, Clone)]
pub struct MarkerRecord {
    pub feature: String,
    pub group: String,
    pub ave_expr: f64,
    pub log_fc: f64,
    pub stat: f64,
    pub pvalue: f64,
    /// P-value re-adjusted within this group's surviving markers
    pub padj: f64,
    pub rate1: f64,
    pub rate2: f64,
    /// 1-based rank inside the group, contiguous in the table's sort order
    pub feature_rank: usize,
}

/// Options for [`find_de`]. Construct with `Default` and the `with_*` builders.
#[derive(Debug, Clone)]
pub struct DeOptions {
    /// Metadata column holding the per-cell group label; falls back to the
    /// annotated input's default identity when absent
    pub group_by: Option<ColumnSelector>,
    /// Metadata column holding the per-cell replicate label
    pub replicate_by: Option<ColumnSelector>,
    /// Additional fixed-effect terms, one row per cell in matrix order
    pub covariates: Option<Array2<f64>>,
    /// Which group comparisons to run
    pub compare: Compare,
    /// Interpret a single-level `compare` as the reference level
    pub compare_is_ref: bool,
    /// Testing engine
    pub method: Method,
    /// Fold-change shrinkage mode; only meaningful for [`Method::NbWald`]
    pub shrinkage: Option<Shrinkage>,
    /// Sort each comparison's rows by significance instead of matrix gene order
    pub order_results: bool,
    /// Multiple-testing correction applied within each comparison
    pub correction: Correction,
    pub verbosity: Verbosity,
}

impl Default for DeOptions {
    fn default() -> Self {
        DeOptions {
            group_by: None,
            replicate_by: None,
            covariates: None,
            compare: Compare::EachVsRest,
            compare_is_ref: false,
            method: Method::NbGlm,
            shrinkage: None,
            order_results: true,
            correction: Correction::BenjaminiHochberg,
            verbosity: Verbosity::Summary,
        }
    }
}

impl DeOptions {
    pub fn with_group_by(mut self, selector: ColumnSelector) -> Self {
        self.group_by = Some(selector);
        self
    }

    pub fn with_replicate_by(mut self, selector: ColumnSelector) -> Self {
        self.replicate_by = Some(selector);
        self
    }

    pub fn with_covariates(mut self, covariates: Array2<f64>) -> Self {
        self.covariates = Some(covariates);
        self
    }

    pub fn with_compare(mut self, compare: Compare) -> Self {
        self.compare = compare;
        self
    }

    pub fn with_compare_is_ref(mut self, compare_is_ref: bool) -> Self {
        self.compare_is_ref = compare_is_ref;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_shrinkage(mut self, shrinkage: Shrinkage) -> Self {
        self.shrinkage = Some(shrinkage);
        self
    }

    pub fn with_order_results(mut self, order_results: bool) -> Self {
        self.order_results = order_results;
        self
    }

    pub fn with_correction(mut self, correction: Correction) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }
}

/// Options for [`find_all_markers`]: the [`DeOptions`] minus the comparison
/// request (fixed to each-vs-rest) plus the marker filters.
#[derive(Debug, Clone)]
pub struct MarkerOptions {
    pub de: DeOptions,
    /// Minimum detection rate required on at least one side
    pub min_rate: f64,
    /// Minimum log2 fold-change
    pub min_fc: f64,
}

impl Default for MarkerOptions {
    fn default() -> Self {
        MarkerOptions {
            de: DeOptions::default(),
            min_rate: 0.1,
            min_fc: 0.25,
        }
    }
}

impl MarkerOptions {
    pub fn with_de(mut self, de: DeOptions) -> Self {
        self.de = de;
        self
    }

    pub fn with_min_rate(mut self, min_rate: f64) -> Self {
        self.min_rate = min_rate;
        self
    }

    pub fn with_min_fc(mut self, min_fc: f64) -> Self {
        self.min_fc = min_fc;
        self
    }
}

/// Run differential expression for every planned comparison and return the
/// concatenated result table, one row per (gene, comparison) pair.
///
/// Comparisons are independent and run in parallel; the output row order is
/// determined by the plan order alone, never by completion order. A failure
/// in any comparison aborts the whole call.
pub fn find_de<T>(input: &DeInput<T>, options: &DeOptions) -> Result<Vec<DeRecord>>
where
    T: FloatOpsTS,
{
    let data = extract::extract(
        input,
        options.group_by.as_ref(),
        options.replicate_by.as_ref(),
        options.verbosity,
    )?;

    if let Some(covariates) = &options.covariates {
        if covariates.nrows() != data.counts.ncols() {
            return Err(anyhow!(
                "Covariate rows ({}) do not match the number of cells ({})",
                covariates.nrows(),
                data.counts.ncols()
            ));
        }
    }

    let comparisons = plan::plan(
        data.grouping.levels(),
        &options.compare,
        options.compare_is_ref,
    )?;

    if data.replicates.is_none() {
        warn!(
            "no replicate labels supplied; '{}' runs per-cell with cells treated as independent samples, which can understate variance",
            options.method.name()
        );
    }

    let shrinkage = if options.shrinkage.is_some() && !options.method.supports_shrinkage() {
        warn!(
            "lfc shrinkage is not applicable to method '{}'; ignoring",
            options.method.name()
        );
        None
    } else {
        options.shrinkage
    };

    // Collect every outcome first so the error reported is always the one
    // from the earliest comparison in plan order.
    let outcomes: Vec<Result<Vec<DeRecord>>> = comparisons
        .par_iter()
        .map(|comparison| {
            adapter::run_comparison(
                &data,
                options.covariates.as_ref(),
                comparison,
                options.method,
                shrinkage,
                options.correction,
                options.verbosity,
            )
        })
        .collect();

    let mut tables = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        tables.push(outcome?);
    }

    Ok(assemble::assemble(tables, options.order_results))
}

/// Run each-vs-rest differential expression over every group level and return
/// rate/fold-change filtered, per-group ranked marker lists.
pub fn find_all_markers<T>(input: &DeInput<T>, options: &MarkerOptions) -> Result<Vec<MarkerRecord>>
where
    T: FloatOpsTS,
{
    let de_options = options
        .de
        .clone()
        .with_compare(Compare::EachVsRest)
        .with_compare_is_ref(false);

    let rows = find_de(input, &de_options)?;
    assemble::rank_markers(rows, options.min_rate, options.min_fc, options.de.correction)
}
