//! The two per-point reductions and the tables they end up in.
//!
//! Each pass is a single kernel map over the working set: one invocation per
//! point sees that point's full cycle vector. Output is positional, so row
//! `i` of a result always belongs to row `i` of the input.
use serde::Serialize;

use crate::chunked::{DenseArray, Kernel, LazyArray};
use crate::dataset::{vars, CycleDataset};
use crate::error::GraphError;
use crate::kernels::{LinregressResult, N_LINREGRESS_PARAMS, SLOPE};

/// Range pass: max − min of valid heights, one column.
pub fn height_range(ds: &CycleDataset) -> Result<LazyArray, GraphError> {
    Ok(LazyArray::map(Kernel::NanPtp, &[&ds.h_corr])?.named(vars::H_RANGE))
}

/// Regression pass: height against time ticks, five columns in
/// `slope, intercept, r, p, std_err` order. Only the slope is multiplied by
/// `slope_factor` (ticks per output time unit).
pub fn linregress(ds: &CycleDataset, slope_factor: f64) -> Result<LazyArray, GraphError> {
    let fit = LazyArray::map(Kernel::NanLinregress, &[&ds.ticks, &ds.h_corr])?;
    let scaled = if slope_factor == 1.0 {
        fit
    } else {
        LazyArray::map(
            Kernel::ScaleColumn {
                col: SLOPE,
                factor: slope_factor,
            },
            &[&fit],
        )?
    };
    Ok(scaled.named(vars::DHDT_PARAMS))
}

/// Point identity and position, shared by both output tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Points {
    pub ref_pt: Vec<u64>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Points {
    /// From a one-column `ref_pt` array and a two-column `xy` array.
    /// Identifiers read from a store were checked to be non-negative integers
    /// (see [`crate::store::ChunkStore::identifier_variable`]).
    pub fn from_dense(ref_pt: &DenseArray, xy: &DenseArray) -> Self {
        Self {
            ref_pt: ref_pt.data().iter().map(|&v| v as u64).collect(),
            x: xy.column(0),
            y: xy.column(1),
        }
    }

    pub fn len(&self) -> usize {
        self.ref_pt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_pt.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeightRangeTable {
    #[serde(flatten)]
    pub points: Points,
    pub h_range: Vec<f64>,
}

impl HeightRangeTable {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RegressionTable {
    pub points: Points,
    pub h_range: Vec<f64>,
    /// `len() x 5`, columns indexed by [`crate::kernels::SLOPE`] and friends.
    pub params: DenseArray,
}

impl RegressionTable {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// One regression output for every point.
    pub fn param(&self, col: usize) -> Vec<f64> {
        debug_assert!(col < N_LINREGRESS_PARAMS);
        self.params.column(col)
    }

    /// dh/dt in metres per slope unit.
    pub fn slope(&self) -> Vec<f64> {
        self.param(SLOPE)
    }

    pub fn get(&self, i: usize) -> LinregressResult {
        LinregressResult::from_row(self.params.row(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::raw_from_rows;
    use crate::dataset::QualityFilter;
    use crate::kernels::{NANOS_PER_YEAR, INTERCEPT, R_VALUE};
    use crate::pool::WorkerPool;
    use crate::projection::Projection;
    use approx::assert_relative_eq;

    const NAN: f64 = f64::NAN;
    const YEAR_S: f64 = 365.25 * 86_400.0;

    fn dataset() -> CycleDataset {
        // Point 0 rises 1 m/yr, point 1 falls 0.5 m/yr, point 2 has one sample.
        let times = vec![vec![0.0, YEAR_S, 2.0 * YEAR_S]; 3];
        let heights = vec![
            vec![10.0, 11.0, 12.0],
            vec![5.0, NAN, 4.0],
            vec![NAN, 7.0, NAN],
        ];
        let flags = vec![vec![0.0; 3]; 3];
        let raw = raw_from_rows(&heights, &times, &flags, 2);
        CycleDataset::from_raw(raw, &QualityFilter::default(), Projection::default()).unwrap()
    }

    #[test]
    fn range_pass_is_one_column_in_point_order() {
        let pool = WorkerPool::new(2).unwrap();
        let out = height_range(&dataset()).unwrap().materialize(&pool).unwrap();
        assert_eq!(out.cols(), 1);
        assert_eq!(out.data(), &[2.0, 1.0, 0.0]);
    }

    #[test]
    fn regression_pass_scales_only_the_slope() {
        let pool = WorkerPool::new(2).unwrap();
        let out = linregress(&dataset(), NANOS_PER_YEAR).unwrap().materialize(&pool).unwrap();
        assert_eq!((out.rows(), out.cols()), (3, N_LINREGRESS_PARAMS));

        let a = LinregressResult::from_row(out.row(0));
        assert_relative_eq!(a.slope, 1.0, max_relative = 1e-9);
        assert_relative_eq!(a.r_value, 1.0, epsilon = 1e-12);
        // Intercept stays in ticks: the height at Unix time zero.
        let unscaled = linregress(&dataset(), 1.0).unwrap().materialize(&pool).unwrap();
        assert_eq!(out.get(0, INTERCEPT).to_bits(), unscaled.get(0, INTERCEPT).to_bits());
        assert_eq!(out.get(0, R_VALUE).to_bits(), unscaled.get(0, R_VALUE).to_bits());

        assert_relative_eq!(out.get(1, SLOPE), -0.5, max_relative = 1e-9);
        assert!(LinregressResult::from_row(out.row(2)).is_nan());
    }

    #[test]
    fn table_accessors_follow_param_order() {
        let params = DenseArray::from_blocks(
            N_LINREGRESS_PARAMS,
            [crate::chunked::Block::new(1, 5, vec![0.1, 2.0, 0.9, 0.01, 0.02])].iter(),
        );
        let table = RegressionTable {
            points: Points {
                ref_pt: vec![7],
                x: vec![1.0],
                y: vec![2.0],
            },
            h_range: vec![0.6],
            params,
        };
        assert_eq!(table.slope(), vec![0.1]);
        assert_eq!(table.get(0).std_err, 0.02);
        assert_eq!(table.len(), 1);
    }
}
