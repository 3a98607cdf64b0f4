//! The dense Points × Cycles view of the input.
//!
//! Every point has an entry for every cycle; rejected or absent samples are
//! `NaN`, never removed, so the shape is always rectangular.
use serde::{Deserialize, Serialize};

use crate::checkpoint::DateRange;
use crate::chunked::{DenseArray, Kernel, LazyArray, Selection};
use crate::error::{ComputeError, EvalError, GraphError, StoreError};
use crate::pool::WorkerPool;
use crate::projection::Projection;
use crate::store::ChunkStore;
use crate::time::ticks_to_date;

/// Variable names shared by input and checkpoint stores.
pub mod vars {
    pub const REF_PT: &str = "ref_pt";
    pub const LONGITUDE: &str = "longitude";
    pub const LATITUDE: &str = "latitude";
    pub const H_CORR: &str = "h_corr";
    pub const DELTA_TIME: &str = "delta_time";
    pub const QUALITY: &str = "quality_summary";
    pub const XY: &str = "xy";
    pub const TICKS: &str = "ticks";
    pub const H_RANGE: &str = "h_range";
    pub const DHDT_PARAMS: &str = "dhdt_params";
}

/// Accept predicate on the per-sample quality flag.
///
/// Only `0` ("high quality") is accepted by default; other values should
/// only be added once their meaning is confirmed against the data product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFilter {
    pub accept: Vec<i64>,
}

impl Default for QualityFilter {
    fn default() -> Self {
        Self { accept: vec![0] }
    }
}

impl QualityFilter {
    /// Missing or non-integer flags are rejected.
    pub fn accepts(&self, flag: f64) -> bool {
        flag.is_finite() && flag.fract() == 0.0 && self.accept.contains(&(flag as i64))
    }
}

/// Raw per-variable arrays as read from an input store.
#[derive(Debug, Clone)]
pub struct RawArrays {
    pub cycles: Vec<u32>,
    pub ref_pt: LazyArray,
    pub longitude: LazyArray,
    pub latitude: LazyArray,
    /// Height (m), one column per cycle.
    pub h_corr: LazyArray,
    /// Seconds since the ATLAS SDP epoch, one column per cycle.
    pub delta_time: LazyArray,
    pub quality: LazyArray,
}

impl RawArrays {
    pub fn from_store(store: &ChunkStore) -> Result<Self, StoreError> {
        Ok(Self {
            cycles: store.cycles().to_vec(),
            ref_pt: store.identifier_variable(vars::REF_PT)?,
            longitude: store.variable(vars::LONGITUDE)?,
            latitude: store.variable(vars::LATITUDE)?,
            h_corr: store.variable(vars::H_CORR)?,
            delta_time: store.variable(vars::DELTA_TIME)?,
            quality: store.variable(vars::QUALITY)?,
        })
    }
}

/// Working set of points, all arrays lazily evaluated and sharing one
/// partition of the point axis.
#[derive(Debug, Clone)]
pub struct CycleDataset {
    pub cycles: Vec<u32>,
    pub ref_pt: LazyArray,
    /// Projected `(x, y)`, 2 columns.
    pub xy: LazyArray,
    /// Quality-masked height, one column per cycle.
    pub h_corr: LazyArray,
    /// Acquisition time as Unix nanoseconds, one column per cycle.
    pub ticks: LazyArray,
}

impl CycleDataset {
    /// Build the lazy pre-processing graph: reprojection, quality masking
    /// and time-tick conversion.
    pub fn from_raw(
        raw: RawArrays,
        quality: &QualityFilter,
        projection: Projection,
    ) -> Result<Self, GraphError> {
        let xy = LazyArray::map(Kernel::Reproject(projection), &[&raw.longitude, &raw.latitude])?
            .named(vars::XY);
        let h_corr = LazyArray::map(Kernel::MaskQuality(quality.clone()), &[&raw.h_corr, &raw.quality])?
            .named(vars::H_CORR);
        let ticks = LazyArray::map(Kernel::DeltaTimeToTicks, &[&raw.delta_time])?.named(vars::TICKS);
        let ds = Self {
            cycles: raw.cycles,
            ref_pt: raw.ref_pt,
            xy,
            h_corr,
            ticks,
        };
        ds.check_partition()?;
        Ok(ds)
    }

    /// Reopen the working set saved in a height-range checkpoint.
    pub fn from_checkpoint(store: &ChunkStore) -> Result<Self, StoreError> {
        let ds = Self {
            cycles: store.cycles().to_vec(),
            ref_pt: store.identifier_variable(vars::REF_PT)?,
            xy: store.variable(vars::XY)?,
            h_corr: store.variable(vars::H_CORR)?,
            ticks: store.variable(vars::TICKS)?,
        };
        if ds.xy.cols() != 2 || ds.h_corr.cols() != ds.ticks.cols() {
            return Err(StoreError::Corrupt {
                path: store.root().to_path_buf(),
                reason: "checkpoint variables have inconsistent column counts".into(),
            });
        }
        Ok(ds)
    }

    fn check_partition(&self) -> Result<(), GraphError> {
        for other in [&self.xy, &self.h_corr, &self.ticks] {
            if other.chunks() != self.ref_pt.chunks() {
                return Err(GraphError::ChunksMismatch {
                    left: self.ref_pt.label().to_string(),
                    right: other.label().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Number of points in the working set.
    pub fn len(&self) -> usize {
        self.ref_pt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunks(&self) -> &[usize] {
        self.ref_pt.chunks()
    }

    /// Keep the selected points in every array.
    pub fn select(&self, selection: &Selection) -> Result<Self, GraphError> {
        Ok(Self {
            cycles: self.cycles.clone(),
            ref_pt: self.ref_pt.select(selection)?,
            xy: self.xy.select(selection)?,
            h_corr: self.h_corr.select(selection)?,
            ticks: self.ticks.select(selection)?,
        })
    }

    /// Pin the arrays both reduction passes read (height and time) in
    /// worker memory.
    pub fn persist_samples(&self, pool: &WorkerPool) -> Result<Self, ComputeError> {
        Ok(Self {
            h_corr: self.h_corr.persist(pool)?,
            ticks: self.ticks.persist(pool)?,
            ..self.clone()
        })
    }

    /// Earliest valid time of the first cycle to the latest valid time of
    /// the last cycle. `None` when either cycle holds no valid time.
    pub fn date_range(&self, pool: &WorkerPool) -> Result<Option<DateRange>, EvalError> {
        let n = self.ticks.cols();
        if n == 0 || self.is_empty() {
            return Ok(None);
        }
        let first = LazyArray::map(Kernel::Column(0), &[&self.ticks])?.materialize(pool)?;
        let last = LazyArray::map(Kernel::Column(n - 1), &[&self.ticks])?.materialize(pool)?;
        let lo = nan_fold(&first, f64::min);
        let hi = nan_fold(&last, f64::max);
        Ok(match (lo.and_then(ticks_to_date), hi.and_then(ticks_to_date)) {
            (Some(from), Some(to)) => Some(DateRange { from, to }),
            _ => None,
        })
    }
}

fn nan_fold(a: &DenseArray, f: fn(f64, f64) -> f64) -> Option<f64> {
    a.data().iter().cloned().filter(|v| v.is_finite()).reduce(f)
}
