use anyhow::{Result, anyhow};
use std::cmp::Ordering;

/// Multiple-testing correction applied to one correction group of p-values
/// (a single comparison's genes, or one group's surviving markers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correction {
    /// Benjamini-Hochberg false discovery rate control
    #[default]
    BenjaminiHochberg,
    /// Bonferroni family-wise error rate control
    Bonferroni,
}

impl Correction {
    pub fn adjust(&self, p_values: &[f64]) -> Result<Vec<f64>> {
        match self {
            Correction::BenjaminiHochberg => benjamini_hochberg(p_values),
            Correction::Bonferroni => bonferroni(p_values),
        }
    }
}

fn validate(p_values: &[f64]) -> Result<()> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }
    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }
    Ok(())
}

/// Bonferroni adjustment: each p-value multiplied by the number of tests,
/// capped at 1.
pub fn bonferroni(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len() as f64;
    Ok(p_values.iter().map(|&p| (p * n).min(1.0)).collect())
}

/// Benjamini-Hochberg adjustment.
///
/// Walks the p-values from largest to smallest, scaling each by n/rank and
/// carrying the running minimum so the adjusted values are monotone in the
/// original p-value order. Adjusted values never fall below their raw
/// p-value and are capped at 1.
pub fn benjamini_hochberg(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();

    let mut indexed: Vec<(usize, f64)> =
        p_values.iter().enumerate().map(|(i, &p)| (i, p)).collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let mut adjusted = vec![0.0; n];
    let mut running_min = 1.0_f64;
    for i in (0..n).rev() {
        let (orig_idx, p) = indexed[i];
        let rank = i + 1;
        let scaled = (p * n as f64 / rank as f64).min(1.0);
        running_min = scaled.min(running_min);
        adjusted[orig_idx] = running_min;
    }

    Ok(adjusted)
}
