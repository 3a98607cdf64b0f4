//! NaN-aware per-point kernels.
//!
//! Both kernels see one point's full cycle vector and are total: bad or
//! missing input produces `NaN` output, never a panic or an error. A sample
//! is valid when it is finite; `NaN` is the missing marker used throughout
//! the crate.
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Metres per nanosecond → metres per year.
/// 1 year = 365.25 d × 24 h × 60 min × 60 s × 1e9 ns.
pub const NANOS_PER_YEAR: f64 = 365.25 * 24.0 * 60.0 * 60.0 * 1_000_000_000.0;

/// Number of regression parameters emitted per point.
pub const N_LINREGRESS_PARAMS: usize = 5;

/// Column positions of the regression parameters. Consumers index
/// positionally, so this order is fixed.
pub const SLOPE: usize = 0;
pub const INTERCEPT: usize = 1;
pub const R_VALUE: usize = 2;
pub const P_VALUE: usize = 3;
pub const STD_ERR: usize = 4;

/// Keeps r away from exactly ±1 when forming the t statistic.
const TINY: f64 = 1.0e-20;

/// Count of finite entries.
#[inline]
pub fn valid_count(values: &[f64]) -> usize {
    values.iter().filter(|v| v.is_finite()).count()
}

/// Peak-to-peak range of the finite entries: `max − min`.
///
/// Returns `NaN` if no entry is finite and `0.0` for a single finite entry.
pub fn nan_ptp(values: &[f64]) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    let mut seen = false;
    for &v in values.iter().filter(|v| v.is_finite()) {
        lo = lo.min(v);
        hi = hi.max(v);
        seen = true;
    }
    if seen {
        hi - lo
    } else {
        f64::NAN
    }
}

/// Ordinary least-squares fit of `y` on `x` for one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinregressResult {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation coefficient.
    pub r_value: f64,
    /// Two-sided p-value for H0: slope = 0 (Student t, n − 2 dof).
    pub p_value: f64,
    /// Standard error of the slope estimate.
    pub std_err: f64,
}

impl LinregressResult {
    pub const NAN: Self = Self {
        slope: f64::NAN,
        intercept: f64::NAN,
        r_value: f64::NAN,
        p_value: f64::NAN,
        std_err: f64::NAN,
    };

    /// Parameters in positional order (see [`SLOPE`] … [`STD_ERR`]).
    pub fn to_array(self) -> [f64; N_LINREGRESS_PARAMS] {
        [self.slope, self.intercept, self.r_value, self.p_value, self.std_err]
    }

    pub fn from_row(row: &[f64]) -> Self {
        Self {
            slope: row[SLOPE],
            intercept: row[INTERCEPT],
            r_value: row[R_VALUE],
            p_value: row[P_VALUE],
            std_err: row[STD_ERR],
        }
    }

    pub fn is_nan(&self) -> bool {
        self.to_array().iter().all(|v| v.is_nan())
    }
}

/// Linear regression restricted to indices where both `x` and `y` are finite.
///
/// Returns [`LinregressResult::NAN`] when fewer than two pairs remain or when
/// every remaining `x` is identical (zero variance in time).
///
/// Sums are accumulated about the means so that large tick offsets (epoch
/// nanoseconds) do not swamp the variance terms.
pub fn nan_linregress(x: &[f64], y: &[f64]) -> LinregressResult {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .collect();

    let n = pairs.len();
    if n < 2 {
        return LinregressResult::NAN;
    }

    // Constant time: the slope is undefined.
    let x0 = pairs[0].0;
    if pairs.iter().all(|&(a, _)| a == x0) {
        return LinregressResult::NAN;
    }

    let nf = n as f64;
    let x_mean = pairs.iter().map(|p| p.0).sum::<f64>() / nf;
    let y_mean = pairs.iter().map(|p| p.1).sum::<f64>() / nf;

    let mut ssxm = 0f64;
    let mut ssym = 0f64;
    let mut ssxym = 0f64;
    for &(a, b) in &pairs {
        let dx = a - x_mean;
        let dy = b - y_mean;
        ssxm += dx * dx;
        ssym += dy * dy;
        ssxym += dx * dy;
    }

    let r = if ssym == 0.0 {
        0.0
    } else {
        (ssxym / (ssxm * ssym).sqrt()).clamp(-1.0, 1.0)
    };
    let slope = ssxym / ssxm;
    let intercept = y_mean - slope * x_mean;

    let (p_value, std_err) = if n == 2 {
        // Two points fit exactly; the p-value is degenerate.
        let p = if pairs[0].1 == pairs[1].1 { 1.0 } else { 0.0 };
        (p, 0.0)
    } else {
        let df = nf - 2.0;
        let t = r * (df / ((1.0 - r + TINY) * (1.0 + r + TINY))).sqrt();
        let p = match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => 2.0 * dist.sf(t.abs()),
            Err(_) => f64::NAN,
        };
        let se = ((1.0 - r * r).max(0.0) * ssym / ssxm / df).sqrt();
        (p, se)
    };

    LinregressResult {
        slope,
        intercept,
        r_value: r,
        p_value,
        std_err,
    }
}
