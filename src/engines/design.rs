//! Design construction and per-gene least-squares fits shared by the engines.
//!
//! Every engine works on the same design: an intercept, the two-level group indicator,
//! and any caller-supplied covariate columns. Engines differ in how they transform and
//! weight the response, not in how the design is solved.

use anyhow::{Result, anyhow};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array2, ArrayView2};

/// Samples x coefficients design matrix. Column 0 is the intercept, column 1
/// the side-a indicator, remaining columns the covariates.
#[derive(Debug, Clone)]
pub(crate) struct DesignMatrix {
    matrix: DMatrix<f64>,
    group_col: usize,
}

impl DesignMatrix {
    /// Assemble the design from the group indicator (1.0 for side a) and
    /// optional covariates with one row per sample.
    pub(crate) fn build(indicator: &[f64], covariates: Option<&Array2<f64>>) -> Result<Self> {
        let n_samples = indicator.len();
        let n_covariates = covariates.map_or(0, |c| c.ncols());

        if let Some(covariates) = covariates {
            if covariates.nrows() != n_samples {
                return Err(anyhow!(
                    "Covariate rows ({}) do not match the number of samples in the fit ({})",
                    covariates.nrows(),
                    n_samples
                ));
            }
        }

        let n_coefficients = 2 + n_covariates;
        if n_samples <= n_coefficients {
            return Err(anyhow!(
                "Not enough samples to fit the design: {} sample(s) for {} coefficient(s)",
                n_samples,
                n_coefficients
            ));
        }

        let matrix = DMatrix::from_fn(n_samples, n_coefficients, |row, col| match col {
            0 => 1.0,
            1 => indicator[row],
            _ => covariates.map_or(0.0, |c| c[[row, col - 2]]),
        });

        Ok(DesignMatrix {
            matrix,
            group_col: 1,
        })
    }

    pub(crate) fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub(crate) fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    pub(crate) fn residual_df(&self) -> f64 {
        (self.n_samples() - self.n_coefficients()) as f64
    }

    /// Group-indicator value of one sample (1.0 on side a).
    pub(crate) fn group_value(&self, sample: usize) -> f64 {
        self.matrix[(sample, self.group_col)]
    }

    /// Weighted least-squares fit of one gene's response vector.
    ///
    /// Solves the normal equations with a Cholesky factorization; a design
    /// that cannot be factorized (collinear covariates, constant indicator)
    /// is reported as rank-deficient. `weights` of `None` is the ordinary
    /// unweighted fit.
    pub(crate) fn fit(&self, response: &[f64], weights: Option<&[f64]>) -> Result<GeneFit> {
        let n = self.n_samples();
        let p = self.n_coefficients();
        debug_assert_eq!(response.len(), n);

        let weight = |i: usize| weights.map_or(1.0, |w| w[i]);

        let mut xtwx: DMatrix<f64> = DMatrix::zeros(p, p);
        let mut xtwy = DVector::zeros(p);
        for i in 0..n {
            let w = weight(i);
            if w <= 0.0 {
                continue;
            }
            for a in 0..p {
                let xa = self.matrix[(i, a)];
                xtwy[a] += w * xa * response[i];
                for b in a..p {
                    xtwx[(a, b)] += w * xa * self.matrix[(i, b)];
                }
            }
        }
        for a in 0..p {
            for b in 0..a {
                xtwx[(a, b)] = xtwx[(b, a)];
            }
        }

        let cholesky = Cholesky::new(xtwx)
            .ok_or_else(|| anyhow!("Rank-deficient design: normal equations are singular"))?;
        let beta = cholesky.solve(&xtwy);
        let unscaled_cov = cholesky.inverse();

        let mut weighted_rss = 0.0;
        for i in 0..n {
            let mut fitted = 0.0;
            for a in 0..p {
                fitted += self.matrix[(i, a)] * beta[a];
            }
            let residual = response[i] - fitted;
            weighted_rss += weight(i) * residual * residual;
        }

        let df_resid = self.residual_df();
        let sigma2 = if df_resid > 0.0 {
            weighted_rss / df_resid
        } else {
            0.0
        };
        let unscaled_var = unscaled_cov[(self.group_col, self.group_col)].max(0.0);

        Ok(GeneFit {
            coef: beta[self.group_col],
            se: (sigma2 * unscaled_var).sqrt(),
            unscaled_var,
            sigma2,
            df_resid,
        })
    }
}

/// Group-coefficient summary of one gene's fit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GeneFit {
    /// Group coefficient on the response scale (log2 for every engine)
    pub coef: f64,
    /// Standard error of the group coefficient
    pub se: f64,
    /// Diagonal entry of (X'WX)^-1 for the group coefficient
    pub unscaled_var: f64,
    /// Residual variance estimate
    pub sigma2: f64,
    pub df_resid: f64,
}

/// Library-size factors normalized to a median of one, per sample.
///
/// A sample with an all-zero profile keeps a factor of one; the comparison
/// fails only when every sample is empty.
pub(crate) fn size_factors(counts: &ArrayView2<f64>) -> Result<Vec<f64>> {
    let totals: Vec<f64> = counts
        .columns()
        .into_iter()
        .map(|column| column.sum())
        .collect();

    let mut positive: Vec<f64> = totals.iter().copied().filter(|&t| t > 0.0).collect();
    if positive.is_empty() {
        return Err(anyhow!("All samples in the comparison have zero total counts"));
    }
    positive.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if positive.len() % 2 == 1 {
        positive[positive.len() / 2]
    } else {
        0.5 * (positive[positive.len() / 2 - 1] + positive[positive.len() / 2])
    };

    Ok(totals
        .into_iter()
        .map(|total| if total > 0.0 { total / median } else { 1.0 })
        .collect())
}

/// Median of a slice; 0.0 when empty. Used for dispersion shrinkage targets.
pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() % 2 == 1 {
        sorted[sorted.len() / 2]
    } else {
        0.5 * (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2])
    }
}
