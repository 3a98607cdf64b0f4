//! The closed set of chunk-local kernels a lazy array can be mapped through.
//!
//! Every kernel works row by row: one invocation sees one point's whole
//! column vector, never a scalar, so chunks are independent by construction.
use super::block::Block;
use crate::dataset::QualityFilter;
use crate::error::GraphError;
use crate::kernels::{nan_linregress, nan_ptp, valid_count, N_LINREGRESS_PARAMS};
use crate::projection::Projection;
use crate::region::Region;
use crate::time::delta_time_to_ticks;

#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// Height range across columns → 1 column.
    NanPtp,
    /// Number of finite values → 1 column.
    ValidCount,
    /// `(x, y)` → 5 columns in [`crate::kernels::SLOPE`] … order.
    NanLinregress,
    /// `(values, flags)` → values where the flag is accepted, else `NaN`.
    MaskQuality(QualityFilter),
    /// Seconds since the ATLAS SDP epoch → Unix nanoseconds.
    DeltaTimeToTicks,
    /// `(lon, lat)` → `(x, y)`.
    Reproject(Projection),
    /// Extract one column.
    Column(usize),
    /// `(x, y)` 2-column input → 1.0 inside, 0.0 outside.
    InRegion(Region),
    /// Multiply one column by a constant, pass the others through.
    ScaleColumn { col: usize, factor: f64 },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::NanPtp => "nanptp",
            Kernel::ValidCount => "valid_count",
            Kernel::NanLinregress => "nan_linregress",
            Kernel::MaskQuality(_) => "mask_quality",
            Kernel::DeltaTimeToTicks => "delta_time_to_ticks",
            Kernel::Reproject(_) => "reproject",
            Kernel::Column(_) => "column",
            Kernel::InRegion(_) => "in_region",
            Kernel::ScaleColumn { .. } => "scale_column",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Kernel::NanLinregress | Kernel::MaskQuality(_) | Kernel::Reproject(_) => 2,
            _ => 1,
        }
    }

    /// Output column count for the given input column counts.
    pub(crate) fn output_cols(&self, input_cols: &[usize]) -> Result<usize, GraphError> {
        if input_cols.len() != self.arity() {
            return Err(GraphError::Arity {
                kernel: self.name(),
                expected: self.arity(),
                got: input_cols.len(),
            });
        }
        let bad = |reason: String| GraphError::Columns {
            kernel: self.name(),
            reason,
        };
        match self {
            Kernel::NanPtp | Kernel::ValidCount => Ok(1),
            Kernel::NanLinregress | Kernel::MaskQuality(_) => {
                if input_cols[0] != input_cols[1] {
                    return Err(bad(format!(
                        "inputs have {} and {} columns",
                        input_cols[0], input_cols[1]
                    )));
                }
                Ok(if matches!(self, Kernel::NanLinregress) {
                    N_LINREGRESS_PARAMS
                } else {
                    input_cols[0]
                })
            }
            Kernel::DeltaTimeToTicks => Ok(input_cols[0]),
            Kernel::Reproject(_) => {
                if input_cols[0] != 1 || input_cols[1] != 1 {
                    return Err(bad("longitude and latitude must be single columns".into()));
                }
                Ok(2)
            }
            Kernel::Column(c) | Kernel::ScaleColumn { col: c, .. } => {
                if *c >= input_cols[0] {
                    return Err(bad(format!("column {c} out of {}", input_cols[0])));
                }
                Ok(if matches!(self, Kernel::Column(_)) { 1 } else { input_cols[0] })
            }
            Kernel::InRegion(_) => {
                if input_cols[0] != 2 {
                    return Err(bad("expects a 2-column (x, y) input".into()));
                }
                Ok(1)
            }
        }
    }

    /// Run the kernel over matching chunks of its inputs.
    /// Shapes were checked when the graph was built.
    pub(crate) fn apply(&self, inputs: &[&Block]) -> Block {
        let a = inputs[0];
        let rows = a.rows;
        match self {
            Kernel::NanPtp => per_row(rows, 1, |r, out| out[0] = nan_ptp(a.row(r))),
            Kernel::ValidCount => per_row(rows, 1, |r, out| out[0] = valid_count(a.row(r)) as f64),
            Kernel::NanLinregress => {
                let y = inputs[1];
                per_row(rows, N_LINREGRESS_PARAMS, |r, out| {
                    out.copy_from_slice(&nan_linregress(a.row(r), y.row(r)).to_array())
                })
            }
            Kernel::MaskQuality(filter) => {
                let flags = inputs[1];
                let data = a
                    .data
                    .iter()
                    .zip(flags.data.iter())
                    .map(|(&v, &q)| if filter.accepts(q) { v } else { f64::NAN })
                    .collect();
                Block::new(rows, a.cols, data)
            }
            Kernel::DeltaTimeToTicks => {
                Block::new(rows, a.cols, a.data.iter().map(|&t| delta_time_to_ticks(t)).collect())
            }
            Kernel::Reproject(proj) => {
                let lat = inputs[1];
                per_row(rows, 2, |r, out| {
                    let (x, y) = proj.lonlat_to_xy(a.get(r, 0), lat.get(r, 0));
                    out[0] = x;
                    out[1] = y;
                })
            }
            Kernel::Column(c) => per_row(rows, 1, |r, out| out[0] = a.get(r, *c)),
            Kernel::InRegion(region) => per_row(rows, 1, |r, out| {
                out[0] = if region.contains(a.get(r, 0), a.get(r, 1)) { 1.0 } else { 0.0 }
            }),
            Kernel::ScaleColumn { col, factor } => {
                let mut out = a.clone();
                for r in 0..rows {
                    out.data[r * a.cols + col] *= factor;
                }
                out
            }
        }
    }
}

fn per_row(rows: usize, cols: usize, mut f: impl FnMut(usize, &mut [f64])) -> Block {
    let mut data = vec![f64::NAN; rows * cols];
    for (r, out) in data.chunks_mut(cols).enumerate() {
        f(r, out);
    }
    Block::new(rows, cols, data)
}
