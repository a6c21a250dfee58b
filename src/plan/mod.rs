//! Comparison-set construction.
//!
//! Expands the user-facing comparison specification into an explicit, ordered list of
//! two-sided comparisons over group-level indices. The flexible request is resolved exactly
//! once here; downstream components only ever see the canonical [`Comparison`] list.

use anyhow::{Result, anyhow};

/// Rendered label used for the complement side of an each-vs-rest comparison.
pub const REST_LABEL: &str = "rest";

/// The accepted comparison specifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// One comparison per level: {level} vs {all other levels}, in level order
    EachVsRest,
    /// One comparison per unordered pair of levels, in (i, j) index order with i < j
    AllVsAll,
    /// A single named level; only meaningful together with `compare_is_ref`
    Level(String),
    /// Single comparison {a} vs {b}
    Pair(String, String),
    /// Single comparison with multi-level sides
    Sets(Vec<String>, Vec<String>),
}

/// One two-sided comparison: disjoint, non-empty sets of group-level indices
/// plus their rendered labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub side_a: Vec<usize>,
    pub side_b: Vec<usize>,
    pub label_a: String,
    pub label_b: String,
}

impl Comparison {
    fn new(levels: &[String], side_a: Vec<usize>, side_b: Vec<usize>, b_is_rest: bool) -> Self {
        let label_a = render_side(levels, &side_a);
        let label_b = if b_is_rest {
            REST_LABEL.to_string()
        } else {
            render_side(levels, &side_b)
        };
        Comparison {
            side_a,
            side_b,
            label_a,
            label_b,
        }
    }
}

fn render_side(levels: &[String], side: &[usize]) -> String {
    side.iter()
        .map(|&index| levels[index].as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve named levels to indices, collecting every unknown name into one error.
fn resolve_levels(levels: &[String], names: &[String]) -> Result<Vec<usize>> {
    let mut indices = Vec::with_capacity(names.len());
    let mut unknown = Vec::new();
    for name in names {
        match levels.iter().position(|level| level == name) {
            Some(index) => indices.push(index),
            None => unknown.push(name.as_str()),
        }
    }
    if !unknown.is_empty() {
        return Err(anyhow!(
            "Unknown group level(s) [{}]; available levels are [{}]",
            unknown.join(", "),
            levels.join(", ")
        ));
    }
    Ok(indices)
}

fn check_disjoint(levels: &[String], side_a: &[usize], side_b: &[usize]) -> Result<()> {
    let shared: Vec<&str> = side_a
        .iter()
        .filter(|index| side_b.contains(index))
        .map(|&index| levels[index].as_str())
        .collect();
    if !shared.is_empty() {
        return Err(anyhow!(
            "Comparison sides must be disjoint; level(s) [{}] appear on both sides",
            shared.join(", ")
        ));
    }
    Ok(())
}

/// Expand a comparison request into the ordered comparison list.
///
/// The returned order is authoritative: it is the order comparisons are run
/// and the order their row blocks appear in the assembled table. Fails on
/// unknown levels, non-disjoint or empty sides, and on any ambiguous
/// combination of `compare` and `compare_is_ref` instead of guessing.
pub fn plan(levels: &[String], compare: &Compare, compare_is_ref: bool) -> Result<Vec<Comparison>> {
    if compare_is_ref && !matches!(compare, Compare::Level(_)) {
        return Err(anyhow!(
            "compare_is_ref only applies to a single reference level, not {:?}",
            compare
        ));
    }

    match compare {
        Compare::EachVsRest => {
            if levels.len() < 2 {
                return Err(anyhow!(
                    "each_vs_rest needs at least two group levels, found {}",
                    levels.len()
                ));
            }
            Ok((0..levels.len())
                .map(|index| {
                    let rest: Vec<usize> = (0..levels.len()).filter(|&j| j != index).collect();
                    Comparison::new(levels, vec![index], rest, true)
                })
                .collect())
        }

        Compare::AllVsAll => {
            if levels.len() < 2 {
                return Err(anyhow!(
                    "all_vs_all needs at least two group levels, found {}",
                    levels.len()
                ));
            }
            let mut comparisons = Vec::with_capacity(levels.len() * (levels.len() - 1) / 2);
            for i in 0..levels.len() {
                for j in (i + 1)..levels.len() {
                    comparisons.push(Comparison::new(levels, vec![i], vec![j], false));
                }
            }
            Ok(comparisons)
        }

        Compare::Level(reference) => {
            if !compare_is_ref {
                return Err(anyhow!(
                    "A single level '{}' is ambiguous without compare_is_ref; use Pair or Sets for an explicit two-sided comparison",
                    reference
                ));
            }
            let reference_index = resolve_levels(levels, std::slice::from_ref(reference))?[0];
            let others: Vec<usize> = (0..levels.len()).filter(|&j| j != reference_index).collect();
            if others.is_empty() {
                return Err(anyhow!(
                    "Reference mode against '{}' needs at least one other group level",
                    reference
                ));
            }
            Ok(others
                .into_iter()
                .map(|index| Comparison::new(levels, vec![index], vec![reference_index], false))
                .collect())
        }

        Compare::Pair(a, b) => {
            let side_a = resolve_levels(levels, std::slice::from_ref(a))?;
            let side_b = resolve_levels(levels, std::slice::from_ref(b))?;
            check_disjoint(levels, &side_a, &side_b)?;
            Ok(vec![Comparison::new(levels, side_a, side_b, false)])
        }

        Compare::Sets(a, b) => {
            if a.is_empty() || b.is_empty() {
                return Err(anyhow!("Comparison sides must be non-empty"));
            }
            let side_a = resolve_levels(levels, a)?;
            let side_b = resolve_levels(levels, b)?;
            check_disjoint(levels, &side_a, &side_b)?;
            Ok(vec![Comparison::new(levels, side_a, side_b, false)])
        }
    }
}
