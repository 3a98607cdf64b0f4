//! Stage sequencing for one dh/dt run.
//!
//! A run is a validated list of [`Stage`]s. Cheap load-time filters shrink
//! the working set first, the range pass materializes `h_range`, the
//! threshold filter uses it, and the expensive regression pass runs on
//! whatever is left. Both passes may be served from checkpoints.
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointKey, CheckpointKind, CheckpointMode, CheckpointStore, DateRange};
use crate::chunked::{DenseArray, LazyArray, Selection};
use crate::config::PipelineConfig;
use crate::dataset::{vars, CycleDataset, RawArrays};
use crate::eligibility::{range_threshold_selection, select_min_valid, select_region};
use crate::error::{Pass, PipelineError, StoreError, StoreRole};
use crate::kernels::N_LINREGRESS_PARAMS;
use crate::pool::WorkerPool;
use crate::reduce::{self, HeightRangeTable, Points, RegressionTable};
use crate::region::Region;
use crate::store::ChunkStore;

// ── Stages ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CostClass {
    Cheap,
    Moderate,
    Expensive,
}

/// What a stage needs before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Requires {
    /// Only the loaded samples.
    LoadTime,
    /// A materialized height range from an earlier [`Stage::RangePass`].
    HeightRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    RegionSubset(Region),
    MinValidSamples(usize),
    RangePass,
    RangeThreshold(f64),
    RegressionPass,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::RegionSubset(_) => "region_subset",
            Stage::MinValidSamples(_) => "min_valid_samples",
            Stage::RangePass => "range_pass",
            Stage::RangeThreshold(_) => "range_threshold",
            Stage::RegressionPass => "regression_pass",
        }
    }

    pub fn cost(&self) -> CostClass {
        match self {
            Stage::RegionSubset(_) | Stage::MinValidSamples(_) | Stage::RangeThreshold(_) => CostClass::Cheap,
            Stage::RangePass => CostClass::Moderate,
            Stage::RegressionPass => CostClass::Expensive,
        }
    }

    pub fn requires(&self) -> Requires {
        match self {
            Stage::RegionSubset(_) | Stage::MinValidSamples(_) | Stage::RangePass => Requires::LoadTime,
            Stage::RangeThreshold(_) | Stage::RegressionPass => Requires::HeightRange,
        }
    }

    fn pass(&self) -> Pass {
        match self {
            Stage::RegionSubset(_) | Stage::MinValidSamples(_) => Pass::Load,
            Stage::RangePass | Stage::RangeThreshold(_) => Pass::Range,
            Stage::RegressionPass => Pass::Regression,
        }
    }
}

/// An ordered list of stages whose dependencies are satisfied.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        let mut have_range = false;
        let mut have_regression = false;
        for stage in &stages {
            if stage.requires() == Requires::HeightRange && !have_range {
                return Err(PipelineError::Plan(format!(
                    "{} needs a height range but runs before range_pass",
                    stage.name()
                )));
            }
            match stage {
                Stage::RangePass if have_range => {
                    return Err(PipelineError::Plan("range_pass appears twice".into()));
                }
                Stage::RangePass => have_range = true,
                Stage::RegressionPass if have_regression => {
                    return Err(PipelineError::Plan("regression_pass appears twice".into()));
                }
                Stage::RegressionPass => have_regression = true,
                Stage::RangeThreshold(t) if !t.is_finite() => {
                    return Err(PipelineError::Plan(format!("range threshold {t} is not finite")));
                }
                _ => {}
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn position(&self, want: &Stage) -> Option<usize> {
        self.stages.iter().position(|s| s == want)
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCount {
    pub stage: &'static str,
    pub points: usize,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub date_range: Option<DateRange>,
    /// Points that reached the range pass.
    pub height_range: Option<HeightRangeTable>,
    /// Points that reached the regression pass.
    pub dhdt: Option<RegressionTable>,
    /// Working-set size after loading and after each stage.
    pub counts: Vec<StageCount>,
    pub range_from_checkpoint: bool,
    pub regression_from_checkpoint: bool,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub enum PipelineInput {
    Store(ChunkStore),
    Dataset(CycleDataset),
}

pub struct Pipeline {
    input: PipelineInput,
    config: PipelineConfig,
    plan: StagePlan,
}

/// Mutable state threaded through the stages.
struct RunState {
    ds: CycleDataset,
    /// Aligned with `ds` once the range pass has run.
    h_range: Option<DenseArray>,
    /// Where the lazy graph of `ds` reads from.
    reads: StoreRole,
}

impl RunState {
    fn apply(&mut self, selection: &Selection, pass: Pass) -> Result<(), PipelineError> {
        self.ds = self
            .ds
            .select(selection)
            .map_err(|source| PipelineError::Graph { pass, source })?;
        self.h_range = self.h_range.as_ref().map(|h| selection.apply_dense(h));
        Ok(())
    }
}

impl Pipeline {
    /// Pipeline with the plan derived from `config`.
    pub fn new(input: PipelineInput, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let plan = config.plan()?;
        Ok(Self { input, config, plan })
    }

    pub fn with_plan(mut self, plan: StagePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn load(&self) -> Result<CycleDataset, PipelineError> {
        match &self.input {
            PipelineInput::Dataset(ds) => Ok(ds.clone()),
            PipelineInput::Store(store) => {
                let raw = RawArrays::from_store(store).map_err(|source| PipelineError::Input {
                    pass: Pass::Load,
                    source,
                })?;
                CycleDataset::from_raw(raw, &self.config.quality, self.config.projection)
                    .map_err(|source| PipelineError::Graph { pass: Pass::Load, source })
            }
        }
    }

    fn checkpoints(&self) -> Option<CheckpointStore> {
        match (&self.config.checkpoint.dir, self.config.checkpoint.mode) {
            (_, CheckpointMode::Off) | (None, _) => None,
            (Some(dir), _) => Some(CheckpointStore::new(dir)),
        }
    }

    /// Run every stage of the plan on `pool`.
    pub fn run(&self, pool: &WorkerPool) -> Result<PipelineOutput, PipelineError> {
        let mut ds = self.load()?;
        let mut out = PipelineOutput {
            date_range: None,
            height_range: None,
            dhdt: None,
            counts: vec![StageCount {
                stage: "load",
                points: ds.len(),
            }],
            range_from_checkpoint: false,
            regression_from_checkpoint: false,
        };
        info!(points = ds.len(), cycles = ds.cycles.len(), chunks = ds.chunks().len(), "loaded");

        out.date_range = match &self.config.date_range {
            Some(r) => Some(r.clone()),
            None => {
                // Times are read again by the range pass.
                pin(&mut ds.ticks, pool, Pass::Load, StoreRole::Input)?;
                ds.date_range(pool)
                    .map_err(|e| PipelineError::eval(Pass::Load, e, StoreRole::Input))?
            }
        };
        if let Some(r) = &out.date_range {
            info!(date_range = %r, "acquisition dates");
        }

        let ckpt = self.checkpoints();
        let region_key = self.config.region_key()?;
        let dates = out.date_range.clone().unwrap_or_else(|| DateRange {
            from: "undated".into(),
            to: "undated".into(),
        });
        let key = |kind| CheckpointKey::new(kind, region_key.clone(), dates.clone());

        let mut state = RunState {
            ds,
            h_range: None,
            reads: StoreRole::Input,
        };

        let range_at = self.plan.position(&Stage::RangePass);
        let mut start = 0;
        if let (Some(at), Some(store), CheckpointMode::Use) = (range_at, &ckpt, self.config.checkpoint.mode) {
            let loaded = store
                .load(&key(CheckpointKind::HeightRange))
                .map_err(|source| PipelineError::Checkpoint { pass: Pass::Range, source })?;
            if let Some(saved) = loaded {
                let (ds, h_range) = open_range_checkpoint(&saved, pool)?;
                state = RunState {
                    ds,
                    h_range: Some(h_range.clone()),
                    reads: StoreRole::Checkpoint,
                };
                let ref_pt = materialize(&state.ds.ref_pt, pool, Pass::Range, state.reads)?;
                let xy = materialize(&state.ds.xy, pool, Pass::Range, state.reads)?;
                out.height_range = Some(HeightRangeTable {
                    points: Points::from_dense(&ref_pt, &xy),
                    h_range: h_range.data().to_vec(),
                });
                out.range_from_checkpoint = true;
                out.counts.push(StageCount {
                    stage: Stage::RangePass.name(),
                    points: state.ds.len(),
                });
                start = at + 1;
            }
        }

        for (i, stage) in self.plan.stages().iter().enumerate().skip(start) {
            let pass = stage.pass();
            let before = state.ds.len();
            debug!(stage = stage.name(), cost = ?stage.cost(), "stage start");
            match stage {
                Stage::RegionSubset(region) => {
                    pin(&mut state.ds.xy, pool, pass, state.reads)?;
                    let sel = select_region(&state.ds, region, pool)
                        .map_err(|e| PipelineError::eval(pass, e, state.reads))?;
                    state.apply(&sel, pass)?;
                }
                Stage::MinValidSamples(min) => {
                    pin(&mut state.ds.h_corr, pool, pass, state.reads)?;
                    let sel = select_min_valid(&state.ds, *min, pool)
                        .map_err(|e| PipelineError::eval(pass, e, state.reads))?;
                    state.apply(&sel, pass)?;
                }
                Stage::RangePass => {
                    let regression_follows = self.plan.stages()[i + 1..].contains(&Stage::RegressionPass);
                    let table = self.range_pass(&mut state, pool, regression_follows, ckpt.as_ref(), &key)?;
                    out.height_range = Some(table);
                }
                Stage::RangeThreshold(t) => {
                    let h_range = state.h_range.as_ref().ok_or_else(|| missing_range(stage))?;
                    let sel = range_threshold_selection(h_range, *t);
                    state.apply(&sel, pass)?;
                }
                Stage::RegressionPass => {
                    let h_range = state.h_range.clone().ok_or_else(|| missing_range(stage))?;
                    let (table, cached) = self.regression_pass(&state, h_range, pool, ckpt.as_ref(), &key)?;
                    out.dhdt = Some(table);
                    out.regression_from_checkpoint = cached;
                }
            }
            info!(stage = stage.name(), before, after = state.ds.len(), "stage done");
            out.counts.push(StageCount {
                stage: stage.name(),
                points: state.ds.len(),
            });
        }
        Ok(out)
    }

    fn range_pass(
        &self,
        state: &mut RunState,
        pool: &WorkerPool,
        regression_follows: bool,
        ckpt: Option<&CheckpointStore>,
        key: &dyn Fn(CheckpointKind) -> CheckpointKey,
    ) -> Result<HeightRangeTable, PipelineError> {
        let pass = Pass::Range;
        let reads = state.reads;
        let compute = |e| PipelineError::compute(pass, e, reads);

        // Heights and times feed the range pass, the checkpoint and the
        // regression pass; point identity feeds both output tables.
        let mut ds = if regression_follows || ckpt.is_some() {
            state.ds.persist_samples(pool).map_err(compute)?
        } else {
            state.ds.clone()
        };
        ds.ref_pt = ds.ref_pt.persist(pool).map_err(compute)?;
        ds.xy = ds.xy.persist(pool).map_err(compute)?;

        let h_range = reduce::height_range(&ds)
            .map_err(|source| PipelineError::Graph { pass, source })?
            .materialize(pool)
            .map_err(compute)?;
        let ref_pt = materialize(&ds.ref_pt, pool, pass, reads)?;
        let xy = materialize(&ds.xy, pool, pass, reads)?;

        if let Some(store) = ckpt {
            save_range_checkpoint(store, &key(CheckpointKind::HeightRange), &ds, &h_range, pool)?;
        }

        let valid = h_range.data().iter().filter(|v| v.is_finite()).count();
        debug!(points = h_range.rows(), valid, "height range materialized");
        state.ds = ds;
        state.h_range = Some(h_range.clone());
        Ok(HeightRangeTable {
            points: Points::from_dense(&ref_pt, &xy),
            h_range: h_range.data().to_vec(),
        })
    }

    fn regression_pass(
        &self,
        state: &RunState,
        h_range: DenseArray,
        pool: &WorkerPool,
        ckpt: Option<&CheckpointStore>,
        key: &dyn Fn(CheckpointKind) -> CheckpointKey,
    ) -> Result<(RegressionTable, bool), PipelineError> {
        let pass = Pass::Regression;
        let ckpt_key = key(CheckpointKind::Dhdt);
        if let (Some(store), CheckpointMode::Use) = (ckpt, self.config.checkpoint.mode) {
            let loaded = store
                .load(&ckpt_key)
                .map_err(|source| PipelineError::Checkpoint { pass, source })?;
            if let Some(saved) = loaded {
                return Ok((open_dhdt_checkpoint(&saved, pool)?, true));
            }
        }

        let params = reduce::linregress(&state.ds, self.config.slope_factor)
            .map_err(|source| PipelineError::Graph { pass, source })?
            .materialize(pool)
            .map_err(|e| PipelineError::compute(pass, e, state.reads))?;
        let ref_pt = materialize(&state.ds.ref_pt, pool, pass, state.reads)?;
        let xy = materialize(&state.ds.xy, pool, pass, state.reads)?;

        let failed = (0..params.rows())
            .filter(|&r| !params.get(r, 0).is_finite())
            .count();
        if failed > 0 {
            warn!(points = failed, "regression undefined for some points");
        }

        if let Some(store) = ckpt {
            let write = |e| PipelineError::Checkpoint { pass, source: e };
            let mut w = store
                .begin(&ckpt_key, state.ds.cycles.clone(), state.ds.chunks().to_vec())
                .map_err(write)?;
            w.store().write_dense(vars::REF_PT, &ref_pt).map_err(write)?;
            w.store().write_dense(vars::XY, &xy).map_err(write)?;
            w.store().write_dense(vars::H_RANGE, &h_range).map_err(write)?;
            w.store().write_dense(vars::DHDT_PARAMS, &params).map_err(write)?;
            w.commit().map_err(write)?;
        }

        Ok((
            RegressionTable {
                points: Points::from_dense(&ref_pt, &xy),
                h_range: h_range.data().to_vec(),
                params,
            },
            false,
        ))
    }
}

fn missing_range(stage: &Stage) -> PipelineError {
    PipelineError::Plan(format!("{} ran without a height range", stage.name()))
}

fn materialize(
    array: &LazyArray,
    pool: &WorkerPool,
    pass: Pass,
    reads: StoreRole,
) -> Result<DenseArray, PipelineError> {
    array
        .materialize(pool)
        .map_err(|e| PipelineError::compute(pass, e, reads))
}

/// Load-time filters read an array that later passes read again; hold it
/// in worker memory so the second read does not rerun its graph.
fn pin(array: &mut LazyArray, pool: &WorkerPool, pass: Pass, reads: StoreRole) -> Result<(), PipelineError> {
    *array = array
        .persist(pool)
        .map_err(|e| PipelineError::compute(pass, e, reads))?;
    Ok(())
}

fn save_range_checkpoint(
    store: &CheckpointStore,
    key: &CheckpointKey,
    ds: &CycleDataset,
    h_range: &DenseArray,
    pool: &WorkerPool,
) -> Result<(), PipelineError> {
    let pass = Pass::Range;
    let write = |source| PipelineError::Checkpoint { pass, source };
    let mut w = store
        .begin(key, ds.cycles.clone(), ds.chunks().to_vec())
        .map_err(write)?;
    for (name, array) in [
        (vars::REF_PT, &ds.ref_pt),
        (vars::XY, &ds.xy),
        (vars::H_CORR, &ds.h_corr),
        (vars::TICKS, &ds.ticks),
    ] {
        w.store()
            .write_lazy(name, array, pool)
            .map_err(|e| PipelineError::compute(pass, e, StoreRole::Checkpoint))?;
    }
    w.store().write_dense(vars::H_RANGE, h_range).map_err(write)?;
    w.commit().map_err(write)?;
    Ok(())
}

fn open_range_checkpoint(
    store: &ChunkStore,
    pool: &WorkerPool,
) -> Result<(CycleDataset, DenseArray), PipelineError> {
    let pass = Pass::Range;
    let ds = CycleDataset::from_checkpoint(store).map_err(|source| PipelineError::Checkpoint { pass, source })?;
    let h_range = store
        .variable(vars::H_RANGE)
        .map_err(|source| PipelineError::Checkpoint { pass, source })?;
    if h_range.cols() != 1 {
        return Err(PipelineError::Checkpoint {
            pass,
            source: corrupt(store, "h_range must have one column"),
        });
    }
    let h_range = materialize(&h_range, pool, pass, StoreRole::Checkpoint)?;
    Ok((ds, h_range))
}

fn open_dhdt_checkpoint(store: &ChunkStore, pool: &WorkerPool) -> Result<RegressionTable, PipelineError> {
    let pass = Pass::Regression;
    let var = |name| {
        store
            .variable(name)
            .map_err(|source| PipelineError::Checkpoint { pass, source })
    };
    let params = var(vars::DHDT_PARAMS)?;
    if params.cols() != N_LINREGRESS_PARAMS {
        return Err(PipelineError::Checkpoint {
            pass,
            source: corrupt(
                store,
                &format!("dhdt_params has {} columns, expected {N_LINREGRESS_PARAMS}", params.cols()),
            ),
        });
    }
    let ref_pt = store
        .identifier_variable(vars::REF_PT)
        .map_err(|source| PipelineError::Checkpoint { pass, source })?;
    let ref_pt = materialize(&ref_pt, pool, pass, StoreRole::Checkpoint)?;
    let xy = materialize(&var(vars::XY)?, pool, pass, StoreRole::Checkpoint)?;
    let h_range = materialize(&var(vars::H_RANGE)?, pool, pass, StoreRole::Checkpoint)?;
    let params = materialize(&params, pool, pass, StoreRole::Checkpoint)?;
    Ok(RegressionTable {
        points: Points::from_dense(&ref_pt, &xy),
        h_range: h_range.data().to_vec(),
        params,
    })
}

fn corrupt(store: &ChunkStore, reason: &str) -> StoreError {
    StoreError::Corrupt {
        path: store.root().to_path_buf(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointConfig;
    use crate::dataset::tests::raw_from_rows;
    use crate::dataset::QualityFilter;
    use crate::kernels::SLOPE;
    use crate::projection::Projection;
    use crate::store::tests::scratch_dir;
    use crate::store::StoreWriter;
    use approx::assert_relative_eq;
    use std::fs;
    use std::path::Path;

    const NAN: f64 = f64::NAN;
    const DAY: f64 = 86_400.0;

    /// Five points over four cycles 91 days apart:
    /// A rises 1 m/cycle, B falls with one gap, C is empty, D has one
    /// sample, E barely moves.
    fn scenario() -> RawArrays {
        let times = vec![vec![0.0, 91.0 * DAY, 182.0 * DAY, 273.0 * DAY]; 5];
        let heights = vec![
            vec![100.0, 101.0, 102.0, 103.0],
            vec![50.0, NAN, 49.0, 48.5],
            vec![NAN, NAN, NAN, NAN],
            vec![NAN, 7.0, NAN, NAN],
            vec![10.0, 10.1, 10.05, 10.0],
        ];
        let flags = vec![vec![0.0; 4]; 5];
        raw_from_rows(&heights, &times, &flags, 2)
    }

    fn dataset_input() -> PipelineInput {
        let ds = CycleDataset::from_raw(scenario(), &QualityFilter::default(), Projection::default()).unwrap();
        PipelineInput::Dataset(ds)
    }

    fn write_store(dir: &Path) -> ChunkStore {
        let pool = WorkerPool::new(1).unwrap();
        let raw = scenario();
        let mut w = StoreWriter::create(dir, raw.cycles.clone(), raw.ref_pt.chunks().to_vec()).unwrap();
        for (name, array) in [
            (vars::REF_PT, &raw.ref_pt),
            (vars::LONGITUDE, &raw.longitude),
            (vars::LATITUDE, &raw.latitude),
            (vars::H_CORR, &raw.h_corr),
            (vars::DELTA_TIME, &raw.delta_time),
            (vars::QUALITY, &raw.quality),
        ] {
            w.write_lazy(name, array, &pool).unwrap();
        }
        w.finish().unwrap()
    }

    fn counts(out: &PipelineOutput) -> Vec<(&'static str, usize)> {
        out.counts.iter().map(|c| (c.stage, c.points)).collect()
    }

    #[test]
    fn end_to_end_filters_then_regresses_in_order() {
        let pool = WorkerPool::new(3).unwrap();
        let out = Pipeline::new(dataset_input(), PipelineConfig::default())
            .unwrap()
            .run(&pool)
            .unwrap();

        assert_eq!(
            counts(&out),
            vec![
                ("load", 5),
                ("min_valid_samples", 3),
                ("range_pass", 3),
                ("range_threshold", 2),
                ("regression_pass", 2),
            ]
        );
        let hr = out.height_range.unwrap();
        assert_eq!(hr.points.ref_pt, vec![1000, 1001, 1004]);
        assert_relative_eq!(hr.h_range[0], 3.0);
        assert_relative_eq!(hr.h_range[1], 1.5);
        assert_relative_eq!(hr.h_range[2], 0.1, epsilon = 1e-12);

        let dhdt = out.dhdt.unwrap();
        assert_eq!(dhdt.len(), 2);
        assert_eq!(dhdt.points.ref_pt, vec![1000, 1001]);
        let slopes = dhdt.slope();
        assert!(slopes.iter().all(|s| s.is_finite()));
        assert_relative_eq!(slopes[0], 365.25 / 91.0, max_relative = 1e-9);
        assert!(slopes[1] < 0.0);
        assert_eq!(dhdt.params.cols(), N_LINREGRESS_PARAMS);
        assert_eq!(out.date_range.unwrap().from, "2018-01-01");
    }

    #[test]
    fn load_time_arrays_are_computed_once() {
        let pool = WorkerPool::new(2).unwrap();
        let ds = CycleDataset::from_raw(scenario(), &QualityFilter::default(), Projection::default()).unwrap();
        let (xy, h_corr, ticks) = (ds.xy.clone(), ds.h_corr.clone(), ds.ticks.clone());
        let region = Region::new("everything", -1e9, 1e9, -1e9, 1e9);
        let mut stages = vec![Stage::RegionSubset(region)];
        stages.extend(PipelineConfig::default().plan().unwrap().stages().iter().cloned());
        let out = Pipeline::new(PipelineInput::Dataset(ds), PipelineConfig::default())
            .unwrap()
            .with_plan(StagePlan::new(stages).unwrap())
            .run(&pool)
            .unwrap();
        assert_eq!(out.dhdt.unwrap().len(), 2);
        for array in [&xy, &h_corr, &ticks] {
            assert_eq!(array.evaluations(), 1, "{}", array.label());
            assert_eq!(array.repeated_evaluations(), 0, "{}", array.label());
        }
    }

    #[test]
    fn region_subset_runs_before_stage_one() {
        let pool = WorkerPool::new(2).unwrap();
        let ds = CycleDataset::from_raw(scenario(), &QualityFilter::default(), Projection::default()).unwrap();
        let xy = ds.xy.materialize(&pool).unwrap();
        // Points sit at longitudes 0..4 on one parallel; box the first two.
        let xs = [xy.get(0, 0), xy.get(1, 0)];
        let ys = [xy.get(0, 1), xy.get(1, 1)];
        let region = Region::new(
            "ab",
            xs[0].min(xs[1]) - 1.0,
            xs[0].max(xs[1]) + 1.0,
            ys[0].min(ys[1]) - 1.0,
            ys[0].max(ys[1]) + 1.0,
        );
        let plan = StagePlan::new(vec![
            Stage::RegionSubset(region),
            Stage::MinValidSamples(2),
            Stage::RangePass,
        ])
        .unwrap();
        let out = Pipeline::new(PipelineInput::Dataset(ds), PipelineConfig::default())
            .unwrap()
            .with_plan(plan)
            .run(&pool)
            .unwrap();
        assert_eq!(out.height_range.unwrap().points.ref_pt, vec![1000, 1001]);
        assert!(out.dhdt.is_none());
    }

    #[test]
    fn plans_with_unmet_dependencies_are_rejected() {
        assert!(matches!(
            StagePlan::new(vec![Stage::RangeThreshold(0.25), Stage::RangePass]),
            Err(PipelineError::Plan(_))
        ));
        assert!(matches!(
            StagePlan::new(vec![Stage::RegressionPass, Stage::RangePass]),
            Err(PipelineError::Plan(_))
        ));
        assert!(StagePlan::new(vec![Stage::MinValidSamples(2), Stage::RangePass, Stage::RegressionPass]).is_ok());
        assert_eq!(Stage::RegressionPass.cost(), CostClass::Expensive);
        assert!(Stage::RangePass.cost() > Stage::MinValidSamples(2).cost());
    }

    #[test]
    fn checkpoints_are_reused_then_refreshed() {
        let pool = WorkerPool::new(2).unwrap();
        let root = scratch_dir("pipe-ckpt");
        let store = write_store(&root.join("input"));
        let mut config = PipelineConfig {
            checkpoint: CheckpointConfig {
                dir: Some(root.join("ckpt")),
                mode: CheckpointMode::Use,
            },
            ..PipelineConfig::default()
        };

        let first = Pipeline::new(PipelineInput::Store(store.clone()), config.clone())
            .unwrap()
            .run(&pool)
            .unwrap();
        assert!(!first.range_from_checkpoint && !first.regression_from_checkpoint);
        assert!(root.join("ckpt").join("ds_hrange_time_all_2018-01-01_2018-10-01").exists());

        let second = Pipeline::new(PipelineInput::Store(store.clone()), config.clone())
            .unwrap()
            .run(&pool)
            .unwrap();
        assert!(second.range_from_checkpoint && second.regression_from_checkpoint);
        assert_eq!(second.height_range, first.height_range);
        let (a, b) = (first.dhdt.unwrap(), second.dhdt.unwrap());
        assert_eq!(a.points, b.points);
        let bits = |t: &RegressionTable| t.param(SLOPE).iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));

        config.checkpoint.mode = CheckpointMode::Refresh;
        let third = Pipeline::new(PipelineInput::Store(store), config).unwrap().run(&pool).unwrap();
        assert!(!third.range_from_checkpoint && !third.regression_from_checkpoint);
    }

    #[test]
    fn corrupt_checkpoint_fails_the_range_pass() {
        let pool = WorkerPool::new(1).unwrap();
        let root = scratch_dir("pipe-corrupt");
        let store = write_store(&root.join("input"));
        let config = PipelineConfig {
            checkpoint: CheckpointConfig {
                dir: Some(root.join("ckpt")),
                mode: CheckpointMode::Use,
            },
            ..PipelineConfig::default()
        };
        Pipeline::new(PipelineInput::Store(store.clone()), config.clone())
            .unwrap()
            .run(&pool)
            .unwrap();
        let manifest = root
            .join("ckpt")
            .join("ds_hrange_time_all_2018-01-01_2018-10-01")
            .join(crate::store::MANIFEST_FILE);
        fs::write(manifest, "{").unwrap();

        let err = Pipeline::new(PipelineInput::Store(store), config)
            .unwrap()
            .run(&pool)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Checkpoint {
                pass: Pass::Range,
                source: StoreError::Corrupt { .. }
            }
        ));
    }

    #[test]
    fn broken_input_chunk_is_blamed_on_the_input_store() {
        let pool = WorkerPool::new(1).unwrap();
        let root = scratch_dir("pipe-input");
        let store = write_store(&root.join("input"));
        fs::remove_file(root.join("input").join(vars::H_CORR).join("1.json")).unwrap();
        let config = PipelineConfig {
            date_range: Some(DateRange {
                from: "2018-01-01".into(),
                to: "2018-10-01".into(),
            }),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(PipelineInput::Store(store), config)
            .unwrap()
            .run(&pool)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Input { pass: Pass::Load, .. }));
        assert!(err.to_string().starts_with("load pass: input store"));
    }

    #[test]
    fn missing_point_identifier_is_corrupt_input() {
        let pool = WorkerPool::new(1).unwrap();
        let root = scratch_dir("pipe-ids");
        let store = write_store(&root.join("input"));
        fs::write(
            root.join("input").join(vars::REF_PT).join("0.json"),
            r#"{"rows":2,"cols":1,"data":[1000.0,null]}"#,
        )
        .unwrap();
        let err = Pipeline::new(PipelineInput::Store(store), PipelineConfig::default())
            .unwrap()
            .run(&pool)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Input {
                source: StoreError::Corrupt { .. },
                ..
            }
        ));
    }
}
