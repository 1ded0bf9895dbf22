use statrs::distribution::{ContinuousCDF, StudentsT};
use std::fmt;
use thiserror::Error;

/// Hard floor for every correlation call site. Below this the engine
/// refuses to produce a statistic rather than returning a degenerate
/// one.
pub const MIN_CORRELATION_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsufficientDataError {
    #[error("correlation needs at least {MIN_CORRELATION_POINTS} paired points, got {0}")]
    TooFewPoints(usize),
    #[error("paired series differ in length: {0} vs {1}")]
    LengthMismatch(usize, usize),
    #[error("least-squares fit needs at least 2 points with distinct x values")]
    DegenerateFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMethod {
    Pearson,
    Spearman,
}

impl fmt::Display for CorrelationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationMethod::Pearson => write!(f, "Pearson"),
            CorrelationMethod::Spearman => write!(f, "Spearman"),
        }
    }
}

/// A correlation coefficient with its two-sided p-value. The engine
/// surfaces the raw p-value only; significance thresholds belong to
/// the report layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub r: f64,
    pub p_value: f64,
}

/// Correlate two paired series. `xs[i]` and `ys[i]` must describe the
/// same entity; callers project them out of joined aggregate rows
/// right before this call.
pub fn correlate(
    xs: &[f64],
    ys: &[f64],
    method: CorrelationMethod,
) -> Result<Correlation, InsufficientDataError> {
    if xs.len() != ys.len() {
        return Err(InsufficientDataError::LengthMismatch(xs.len(), ys.len()));
    }
    if xs.len() < MIN_CORRELATION_POINTS {
        return Err(InsufficientDataError::TooFewPoints(xs.len()));
    }

    let r = match method {
        CorrelationMethod::Pearson => pearson(xs, ys),
        CorrelationMethod::Spearman => pearson(&rank(xs), &rank(ys)),
    };

    Ok(Correlation {
        r,
        p_value: two_sided_p_value(r, xs.len()),
    })
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pearson product-moment coefficient. A zero-variance series carries
/// no ordering information, so it reports 0 rather than NaN.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let mean_x = mean(xs);
    let mean_y = mean(ys);

    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_yy = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sum_xy += dx * dy;
        sum_xx += dx * dx;
        sum_yy += dy * dy;
    }

    if sum_xx == 0.0 || sum_yy == 0.0 {
        return 0.0;
    }
    (sum_xy / (sum_xx * sum_yy).sqrt()).clamp(-1.0, 1.0)
}

/// 1-based ranks with ties assigned their average rank, the ranking
/// scipy's spearmanr applies before the Pearson step.
fn rank(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = average_rank;
        }
        i = j + 1;
    }
    ranks
}

/// Two-sided p-value from the Student's-t approximation with n-2
/// degrees of freedom, the same approximation scipy uses for both
/// pearsonr and spearmanr.
fn two_sided_p_value(r: f64, n: usize) -> f64 {
    let dof = (n - 2) as f64;
    let denom = 1.0 - r * r;
    if denom <= f64::EPSILON {
        return 0.0;
    }
    let t = r * (dof / denom).sqrt();
    let dist = StudentsT::new(0.0, 1.0, dof).unwrap();
    (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0)
}

/// Qualitative strength of a coefficient, sign-insensitive and
/// independent of the p-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    VeryWeak,
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl Strength {
    pub fn band(r: f64) -> Self {
        let magnitude = r.abs();
        if magnitude < 0.20 {
            Strength::VeryWeak
        } else if magnitude < 0.40 {
            Strength::Weak
        } else if magnitude < 0.60 {
            Strength::Moderate
        } else if magnitude < 0.80 {
            Strength::Strong
        } else {
            Strength::VeryStrong
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Strength::VeryWeak => "very weak",
            Strength::Weak => "weak",
            Strength::Moderate => "moderate",
            Strength::Strong => "strong",
            Strength::VeryStrong => "very strong",
        }
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// An affine predictor mapping mean teacher literacy to a predicted
/// mean student CT score. Output is deliberately not clamped to the
/// observed range of the target metric; the report layer flags
/// out-of-range predictions qualitatively instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub intercept: f64,
    pub slope: f64,
}

impl LinearFit {
    pub fn new(intercept: f64, slope: f64) -> Self {
        Self { intercept, slope }
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// Ordinary least squares over paired observations. Needs at
    /// least two points with distinct x values.
    pub fn fit(xs: &[f64], ys: &[f64]) -> Result<Self, InsufficientDataError> {
        if xs.len() != ys.len() {
            return Err(InsufficientDataError::LengthMismatch(xs.len(), ys.len()));
        }
        if xs.len() < 2 {
            return Err(InsufficientDataError::DegenerateFit);
        }

        let mean_x = mean(xs);
        let mean_y = mean(ys);
        let mut sum_xy = 0.0;
        let mut sum_xx = 0.0;
        for (x, y) in xs.iter().zip(ys.iter()) {
            let dx = x - mean_x;
            sum_xy += dx * (y - mean_y);
            sum_xx += dx * dx;
        }
        if sum_xx == 0.0 {
            return Err(InsufficientDataError::DegenerateFit);
        }

        let slope = sum_xy / sum_xx;
        Ok(Self {
            intercept: mean_y - slope * mean_x,
            slope,
        })
    }
}
