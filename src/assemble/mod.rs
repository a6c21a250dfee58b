//! Result concatenation, ordering, and marker post-processing.
//!
//! Comparison blocks are concatenated in plan order. The optional significance sort is
//! purely presentational: it never crosses comparison boundaries and never touches the
//! adjusted p-values. The marker path filters on detection rate and fold-change, then
//! re-adjusts p-values within each group over the surviving rows only.

use anyhow::Result;
use std::cmp::Ordering;

use crate::correction::Correction;
use crate::{DeRecord, MarkerRecord};

/// Concatenate per-comparison tables in plan order.
///
/// With `order_results`, rows inside each comparison block are sorted by
/// ascending p-value, ties broken by descending absolute statistic; without
/// it, rows keep the count matrix's gene order.
pub fn assemble(mut tables: Vec<Vec<DeRecord>>, order_results: bool) -> Vec<DeRecord> {
    if order_results {
        for table in &mut tables {
            table.sort_by(compare_significance);
        }
    }
    tables.into_iter().flatten().collect()
}

fn compare_significance(a: &DeRecord, b: &DeRecord) -> Ordering {
    a.pvalue
        .partial_cmp(&b.pvalue)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.stat
                .abs()
                .partial_cmp(&a.stat.abs())
                .unwrap_or(Ordering::Equal)
        })
}

/// Filter an each-vs-rest table down to per-group marker lists.
///
/// Keeps rows detected in at least `min_rate` of the cells on either side and
/// with a log2 fold-change of at least `min_fc`. Adjusted p-values are then
/// recomputed per group over the surviving rows, and each group's rows get a
/// contiguous 1-based `feature_rank` in their current order. The group2
/// column is dropped: in each-vs-rest mode it is always the complement.
pub fn rank_markers(
    rows: Vec<DeRecord>,
    min_rate: f64,
    min_fc: f64,
    correction: Correction,
) -> Result<Vec<MarkerRecord>> {
    let surviving: Vec<DeRecord> = rows
        .into_iter()
        .filter(|row| {
            (row.rate1 >= min_rate || row.rate2 >= min_rate) && row.log_fc >= min_fc
        })
        .collect();

    // Group blocks in encounter order; the input arrives grouped by comparison.
    let mut groups: Vec<(String, Vec<DeRecord>)> = Vec::new();
    for row in surviving {
        match groups.iter_mut().find(|(group, _)| *group == row.group1) {
            Some((_, block)) => block.push(row),
            None => groups.push((row.group1.clone(), vec![row])),
        }
    }

    let mut markers = Vec::new();
    for (group, block) in groups {
        let p_values: Vec<f64> = block.iter().map(|row| row.pvalue).collect();
        let padj = correction.adjust(&p_values)?;
        for (index, (row, padj)) in block.into_iter().zip(padj).enumerate() {
            markers.push(MarkerRecord {
                feature: row.feature,
                group: group.clone(),
                ave_expr: row.ave_expr,
                log_fc: row.log_fc,
                stat: row.stat,
                pvalue: row.pvalue,
                padj,
                rate1: row.rate1,
                rate2: row.rate2,
                feature_rank: index + 1,
            });
        }
    }

    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(feature: &str, group1: &str, pvalue: f64, stat: f64) -> DeRecord {
        DeRecord {
            feature: feature.to_string(),
            group1: group1.to_string(),
            group2: "rest".to_string(),
            ave_expr: 1.0,
            log_fc: 1.0,
            stat,
            pvalue,
            padj: pvalue,
            rate1: 0.5,
            rate2: 0.5,
        }
    }

    #[test]
    fn ordering_stays_within_comparison_blocks() {
        let tables = vec![
            vec![row("g1", "A", 0.5, 1.0), row("g2", "A", 0.01, 3.0)],
            vec![row("g1", "B", 0.2, 2.0), row("g2", "B", 0.9, 0.1)],
        ];
        let rows = assemble(tables, true);
        let order: Vec<(&str, &str)> = rows
            .iter()
            .map(|row| (row.group1.as_str(), row.feature.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("A", "g2"), ("A", "g1"), ("B", "g1"), ("B", "g2")]
        );
    }

    #[test]
    fn ties_break_on_absolute_statistic() {
        let tables = vec![vec![
            row("weak", "A", 0.05, 1.0),
            row("strong", "A", 0.05, -4.0),
        ]];
        let rows = assemble(tables, true);
        assert_eq!(rows[0].feature, "strong");
    }

    #[test]
    fn unordered_assembly_keeps_input_order() {
        let tables = vec![vec![row("g1", "A", 0.5, 1.0), row("g2", "A", 0.01, 3.0)]];
        let rows = assemble(tables, false);
        assert_eq!(rows[0].feature, "g1");
    }

    #[test]
    fn marker_filter_and_rank() {
        let mut pass = row("g1", "A", 0.01, 3.0);
        pass.rate1 = 0.8;
        pass.rate2 = 0.0;
        let mut low_rate = row("g2", "A", 0.02, 2.0);
        low_rate.rate1 = 0.05;
        low_rate.rate2 = 0.05;
        let mut low_fc = row("g3", "A", 0.03, 2.0);
        low_fc.log_fc = 0.1;
        let mut other_group = row("g4", "B", 0.2, 1.0);
        other_group.rate1 = 0.9;

        let markers = rank_markers(
            vec![pass, low_rate, low_fc, other_group],
            0.1,
            0.25,
            Correction::BenjaminiHochberg,
        )
        .unwrap();

        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].feature, "g1");
        assert_eq!(markers[0].group, "A");
        assert_eq!(markers[0].feature_rank, 1);
        assert_eq!(markers[1].group, "B");
        assert_eq!(markers[1].feature_rank, 1);
    }

    #[test]
    fn padj_is_recomputed_per_group() {
        let mut a1 = row("g1", "A", 0.01, 3.0);
        a1.padj = 0.9;
        let mut a2 = row("g2", "A", 0.04, 2.0);
        a2.padj = 0.9;
        let markers =
            rank_markers(vec![a1, a2], 0.0, 0.0, Correction::BenjaminiHochberg).unwrap();
        // BH over two p-values: [0.02, 0.04]
        assert!((markers[0].padj - 0.02).abs() < 1e-12);
        assert!((markers[1].padj - 0.04).abs() < 1e-12);
        assert_eq!(markers[0].feature_rank, 1);
        assert_eq!(markers[1].feature_rank, 2);
    }
}
