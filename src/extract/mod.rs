//! Input normalization for differential expression.
//!
//! Accepts either a bare count matrix with a separate per-cell metadata table or an
//! annotated matrix that already embeds its metadata, and produces the canonical triple
//! {counts, grouping, replicate labels} every downstream component works on. Group levels
//! keep their first-seen order; that order drives default each-vs-rest iteration.

use anyhow::{Result, anyhow};
use log::{debug, info};
use nalgebra_sparse::CsrMatrix;
use single_utilities::traits::FloatOpsTS;
use std::collections::HashMap;

use crate::Verbosity;

/// Reference to a metadata column, by name or positional index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    Name(String),
    Index(usize),
}

impl From<&str> for ColumnSelector {
    fn from(name: &str) -> Self {
        ColumnSelector::Name(name.to_string())
    }
}

impl From<usize> for ColumnSelector {
    fn from(index: usize) -> Self {
        ColumnSelector::Index(index)
    }
}

impl std::fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnSelector::Name(name) => write!(f, "'{}'", name),
            ColumnSelector::Index(index) => write!(f, "column index {}", index),
        }
    }
}

/// Ordered table of named per-cell label columns.
#[derive(Debug, Clone, Default)]
pub struct CellMetadata {
    columns: Vec<(String, Vec<String>)>,
}

impl CellMetadata {
    pub fn new() -> Self {
        CellMetadata::default()
    }

    /// Append a column. Columns keep insertion order, which is what
    /// [`ColumnSelector::Index`] resolves against.
    pub fn with_column<S: Into<String>>(mut self, name: S, values: Vec<String>) -> Self {
        self.columns.push((name.into(), values));
        self
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Number of cells covered by the table, taken from the first column.
    pub fn n_cells(&self) -> usize {
        self.columns.first().map_or(0, |(_, values)| values.len())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Resolve a selector to its column values.
    pub fn column(&self, selector: &ColumnSelector) -> Result<&[String]> {
        match selector {
            ColumnSelector::Name(name) => self
                .columns
                .iter()
                .find(|(column_name, _)| column_name == name)
                .map(|(_, values)| values.as_slice())
                .ok_or_else(|| anyhow!("Metadata column {} not found", selector)),
            ColumnSelector::Index(index) => self
                .columns
                .get(*index)
                .map(|(_, values)| values.as_slice())
                .ok_or_else(|| {
                    anyhow!(
                        "Metadata {} out of range (table has {} columns)",
                        selector,
                        self.columns.len()
                    )
                }),
        }
    }

    fn validate(&self, n_cells: usize) -> Result<()> {
        for (name, values) in &self.columns {
            if values.len() != n_cells {
                return Err(anyhow!(
                    "Metadata column '{}' has {} entries but the matrix has {} cells",
                    name,
                    values.len(),
                    n_cells
                ));
            }
        }
        Ok(())
    }
}

/// Per-cell categorical labels with an explicit, persisted level order.
///
/// Level order is first-seen order when built from raw labels. It is the
/// authoritative order for each-vs-rest iteration and for rendering baseline
/// levels, and is never re-derived downstream.
#[derive(Debug, Clone)]
pub struct GroupFactor {
    codes: Vec<usize>,
    levels: Vec<String>,
}

impl GroupFactor {
    /// Build a factor from per-cell labels, levels ordered by first appearance.
    pub fn from_labels(labels: &[String]) -> Self {
        let mut levels: Vec<String> = Vec::new();
        let mut level_index: HashMap<&str, usize> = HashMap::new();
        let mut codes = Vec::with_capacity(labels.len());

        for label in labels {
            let code = match level_index.get(label.as_str()) {
                Some(&code) => code,
                None => {
                    let code = levels.len();
                    levels.push(label.clone());
                    level_index.insert(label.as_str(), code);
                    code
                }
            };
            codes.push(code);
        }

        GroupFactor { codes, levels }
    }

    pub fn codes(&self) -> &[usize] {
        &self.codes
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Cells carrying the given level, in matrix column order.
    pub fn cells_of(&self, level_index: usize) -> Vec<usize> {
        self.codes
            .iter()
            .enumerate()
            .filter_map(|(cell, &code)| if code == level_index { Some(cell) } else { None })
            .collect()
    }
}

/// Count matrix bundled with its metadata and a default identity column.
#[derive(Debug, Clone)]
pub struct AnnotatedMatrix<T> {
    /// Genes as rows, cells as columns
    pub counts: CsrMatrix<T>,
    pub genes: Vec<String>,
    pub metadata: CellMetadata,
    /// Metadata column used for grouping when the caller names none
    pub default_ident: Option<String>,
}

/// The accepted input representations.
#[derive(Debug, Clone)]
pub enum DeInput<T> {
    /// Bare matrix plus an optional separate metadata table
    Matrix {
        counts: CsrMatrix<T>,
        genes: Vec<String>,
        metadata: Option<CellMetadata>,
    },
    /// Richer container with embedded metadata and a default identity
    Annotated(AnnotatedMatrix<T>),
}

/// The canonical triple handed to the planner and adapter.
#[derive(Debug)]
pub struct ExtractedData<'a, T> {
    pub counts: &'a CsrMatrix<T>,
    pub genes: &'a [String],
    pub grouping: GroupFactor,
    pub replicates: Option<GroupFactor>,
}

/// Normalize any accepted input into the canonical triple.
///
/// Grouping resolution order: the `group_by` selector against the input's
/// metadata, then the annotated input's default identity column. Failing
/// both is a configuration error. All data validation (dimensions, unique
/// gene ids, count values) happens here, before any engine runs.
pub fn extract<'a, T>(
    input: &'a DeInput<T>,
    group_by: Option<&ColumnSelector>,
    replicate_by: Option<&ColumnSelector>,
    verbosity: Verbosity,
) -> Result<ExtractedData<'a, T>>
where
    T: FloatOpsTS,
{
    let (counts, genes, metadata, default_ident) = match input {
        DeInput::Matrix {
            counts,
            genes,
            metadata,
        } => (counts, genes, metadata.as_ref(), None),
        DeInput::Annotated(annotated) => (
            &annotated.counts,
            &annotated.genes,
            Some(&annotated.metadata),
            annotated.default_ident.as_deref(),
        ),
    };

    validate_counts(counts, genes)?;
    if let Some(metadata) = metadata {
        metadata.validate(counts.ncols())?;
    }

    let grouping_labels = resolve_grouping(metadata, group_by, default_ident)?;
    let grouping = GroupFactor::from_labels(grouping_labels);

    let replicates = match replicate_by {
        Some(selector) => {
            let metadata = metadata.ok_or_else(|| {
                anyhow!("Replicate column {} requested but no metadata was supplied", selector)
            })?;
            Some(GroupFactor::from_labels(metadata.column(selector)?))
        }
        None => None,
    };

    if verbosity.at_least(Verbosity::Summary) {
        info!(
            "extracted {} genes x {} cells, {} group level(s), {}",
            counts.nrows(),
            counts.ncols(),
            grouping.n_levels(),
            match &replicates {
                Some(replicates) => format!("{} replicate label(s)", replicates.n_levels()),
                None => "no replicate labels".to_string(),
            }
        );
    }
    if verbosity.at_least(Verbosity::Detailed) {
        for (index, level) in grouping.levels().iter().enumerate() {
            debug!(
                "group level {} '{}': {} cells",
                index,
                level,
                grouping.codes().iter().filter(|&&code| code == index).count()
            );
        }
    }

    Ok(ExtractedData {
        counts,
        genes,
        grouping,
        replicates,
    })
}

fn resolve_grouping<'a>(
    metadata: Option<&'a CellMetadata>,
    group_by: Option<&ColumnSelector>,
    default_ident: Option<&str>,
) -> Result<&'a [String]> {
    match (group_by, metadata) {
        (Some(selector), Some(metadata)) => metadata.column(selector),
        (Some(selector), None) => Err(anyhow!(
            "Group column {} requested but no metadata was supplied",
            selector
        )),
        (None, Some(metadata)) => {
            let ident = default_ident.ok_or_else(|| {
                anyhow!("No group column given and the input carries no default identity")
            })?;
            metadata.column(&ColumnSelector::Name(ident.to_string()))
        }
        (None, None) => Err(anyhow!(
            "No grouping resolvable: neither a group column nor embedded metadata was supplied"
        )),
    }
}

fn validate_counts<T>(counts: &CsrMatrix<T>, genes: &[String]) -> Result<()>
where
    T: FloatOpsTS,
{
    if genes.len() != counts.nrows() {
        return Err(anyhow!(
            "Gene identifier count ({}) does not match matrix rows ({})",
            genes.len(),
            counts.nrows()
        ));
    }

    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(genes.len());
    for (index, gene) in genes.iter().enumerate() {
        if let Some(first) = seen.insert(gene.as_str(), index) {
            return Err(anyhow!(
                "Gene identifiers must be unique: '{}' appears at rows {} and {}",
                gene,
                first,
                index
            ));
        }
    }

    for (row, col, value) in counts.triplet_iter() {
        let value = value.to_f64().unwrap_or(f64::NAN);
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow!(
                "Malformed count at gene row {}, cell {}: {}",
                row,
                col,
                value
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn small_counts() -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(2, 4);
        coo.push(0, 0, 3.0);
        coo.push(0, 2, 1.0);
        coo.push(1, 1, 2.0);
        CsrMatrix::from(&coo)
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn group_factor_keeps_first_seen_order() {
        let factor = GroupFactor::from_labels(&labels(&["B", "A", "B", "C", "A"]));
        assert_eq!(factor.levels(), &labels(&["B", "A", "C"]));
        assert_eq!(factor.codes(), &[0, 1, 0, 2, 1]);
        assert_eq!(factor.cells_of(1), vec![1, 4]);
    }

    #[test]
    fn extract_uses_default_ident() {
        let input = DeInput::Annotated(AnnotatedMatrix {
            counts: small_counts(),
            genes: labels(&["g1", "g2"]),
            metadata: CellMetadata::new()
                .with_column("cluster", labels(&["A", "A", "B", "B"])),
            default_ident: Some("cluster".to_string()),
        });

        let data = extract(&input, None, None, Verbosity::Silent).unwrap();
        assert_eq!(data.grouping.levels(), &labels(&["A", "B"]));
        assert!(data.replicates.is_none());
    }

    #[test]
    fn extract_fails_without_resolvable_grouping() {
        let input = DeInput::Matrix {
            counts: small_counts(),
            genes: labels(&["g1", "g2"]),
            metadata: None,
        };
        let err = extract(&input, None, None, Verbosity::Silent).unwrap_err();
        assert!(err.to_string().contains("No grouping resolvable"));
    }

    #[test]
    fn extract_fails_on_unknown_column() {
        let input = DeInput::Matrix {
            counts: small_counts(),
            genes: labels(&["g1", "g2"]),
            metadata: Some(CellMetadata::new().with_column("cluster", labels(&["A", "A", "B", "B"]))),
        };
        let selector = ColumnSelector::from("missing");
        assert!(extract(&input, Some(&selector), None, Verbosity::Silent).is_err());

        let selector = ColumnSelector::from(3usize);
        let err = extract(&input, Some(&selector), None, Verbosity::Silent).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn extract_fails_on_metadata_length_mismatch() {
        let input = DeInput::Matrix {
            counts: small_counts(),
            genes: labels(&["g1", "g2"]),
            metadata: Some(CellMetadata::new().with_column("cluster", labels(&["A", "B"]))),
        };
        let selector = ColumnSelector::from("cluster");
        let err = extract(&input, Some(&selector), None, Verbosity::Silent).unwrap_err();
        assert!(err.to_string().contains("2 entries"));
    }

    #[test]
    fn extract_rejects_duplicate_genes_and_bad_counts() {
        let input = DeInput::Matrix {
            counts: small_counts(),
            genes: labels(&["g1", "g1"]),
            metadata: Some(CellMetadata::new().with_column("cluster", labels(&["A", "A", "B", "B"]))),
        };
        let selector = ColumnSelector::from("cluster");
        assert!(extract(&input, Some(&selector), None, Verbosity::Silent).is_err());

        let mut coo = CooMatrix::new(2, 4);
        coo.push(0, 0, -1.0);
        let input = DeInput::Matrix {
            counts: CsrMatrix::from(&coo),
            genes: labels(&["g1", "g2"]),
            metadata: Some(CellMetadata::new().with_column("cluster", labels(&["A", "A", "B", "B"]))),
        };
        let err = extract(&input, Some(&selector), None, Verbosity::Silent).unwrap_err();
        assert!(err.to_string().contains("Malformed count"));
    }
}
