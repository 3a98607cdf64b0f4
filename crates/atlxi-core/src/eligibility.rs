//! Point eligibility: which points are worth reducing at all.
//!
//! Stage 1 needs only the loaded samples; stage 2 needs a materialized
//! height range. Both return a [`Selection`] over the partition of the
//! array they were evaluated on.
use crate::chunked::{DenseArray, Kernel, LazyArray, Selection};
use crate::dataset::CycleDataset;
use crate::error::EvalError;
use crate::pool::WorkerPool;
use crate::region::Region;

/// Default minimum number of valid samples (stage 1).
pub const MIN_VALID_SAMPLES: usize = 2;
/// Default height range threshold in metres (stage 2).
pub const RANGE_THRESHOLD: f64 = 0.25;

/// Keep points whose valid-sample count is at least `min`.
pub fn min_valid_selection(counts: &DenseArray, min: usize) -> Selection {
    Selection::from_predicate(counts, |row| row[0] >= min as f64)
}

/// Keep points whose height range is strictly above `threshold`.
/// Missing ranges never pass.
pub fn range_threshold_selection(h_range: &DenseArray, threshold: f64) -> Selection {
    Selection::from_predicate(h_range, |row| row[0] > threshold)
}

/// Keep points whose in-region mask is set.
pub fn region_selection(mask: &DenseArray) -> Selection {
    Selection::from_predicate(mask, |row| row[0] != 0.0)
}

/// Count valid heights per point and select the eligible ones.
pub fn select_min_valid(
    ds: &CycleDataset,
    min: usize,
    pool: &WorkerPool,
) -> Result<Selection, EvalError> {
    let counts = LazyArray::map(Kernel::ValidCount, &[&ds.h_corr])?.materialize(pool)?;
    Ok(min_valid_selection(&counts, min))
}

/// Test projected coordinates against `region`.
pub fn select_region(
    ds: &CycleDataset,
    region: &Region,
    pool: &WorkerPool,
) -> Result<Selection, EvalError> {
    let mask = LazyArray::map(Kernel::InRegion(region.clone()), &[&ds.xy])?.materialize(pool)?;
    Ok(region_selection(&mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::raw_from_rows;
    use crate::dataset::QualityFilter;
    use crate::projection::Projection;

    const NAN: f64 = f64::NAN;

    #[test]
    fn stage_one_count_is_exact() {
        let pool = WorkerPool::new(2).unwrap();
        // Point i has i valid samples, i = 0..=4.
        let heights: Vec<Vec<f64>> = (0..5)
            .map(|i| (0..4).map(|c| if c < i { c as f64 } else { NAN }).collect())
            .collect();
        let times = vec![vec![0.0, 1.0, 2.0, 3.0]; 5];
        let flags = vec![vec![0.0; 4]; 5];
        let raw = raw_from_rows(&heights, &times, &flags, 2);
        let ds = CycleDataset::from_raw(raw, &QualityFilter::default(), Projection::default()).unwrap();

        let sel = select_min_valid(&ds, MIN_VALID_SAMPLES, &pool).unwrap();
        assert_eq!(sel.len(), 3);
        let kept = ds.select(&sel).unwrap().ref_pt.materialize(&pool).unwrap();
        assert_eq!(kept.data(), &[1002.0, 1003.0, 1004.0]);
    }

    #[test]
    fn stage_two_boundary_is_strict() {
        let h = DenseArray::from_column(vec![2, 2], vec![0.25, 0.250_000_1, NAN, 3.0]);
        let sel = range_threshold_selection(&h, RANGE_THRESHOLD);
        let kept = sel.apply_dense(&h);
        assert_eq!(kept.data(), &[0.250_000_1, 3.0]);
        assert_eq!(kept.chunks(), &[1, 1]);
    }

    #[test]
    fn region_mask_keeps_inside_points() {
        let pool = WorkerPool::new(1).unwrap();
        let raw = raw_from_rows(&[vec![1.0], vec![2.0]], &[vec![0.0], vec![0.0]], &[vec![0.0], vec![0.0]], 2);
        let ds = CycleDataset::from_raw(raw, &QualityFilter::default(), Projection::default()).unwrap();
        let xy = ds.xy.materialize(&pool).unwrap();
        // Box around the first point only.
        let (x0, y0) = (xy.get(0, 0), xy.get(0, 1));
        let region = Region::new("first", x0 - 1.0, x0 + 1.0, y0 - 1.0, y0 + 1.0);
        let sel = select_region(&ds, &region, &pool).unwrap();
        assert_eq!(sel.len(), 1);
        assert_eq!(ds.select(&sel).unwrap().ref_pt.materialize(&pool).unwrap().data(), &[1000.0]);
    }
}
