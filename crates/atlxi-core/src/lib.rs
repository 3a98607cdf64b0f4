//! Per-point height-change statistics for ICESat-2 ATL11 cycles.
//!
//! Points × Cycles arrays are held as lazy chunked graphs, filtered by
//! cheap eligibility stages, and reduced point by point (height range,
//! then linear regression of height on time) on an explicitly owned
//! worker pool.
pub mod checkpoint;
pub mod chunked;
pub mod config;
pub mod dataset;
pub mod eligibility;
pub mod error;
pub mod kernels;
pub mod pipeline;
pub mod pool;
pub mod projection;
pub mod raster;
pub mod reduce;
pub mod region;
pub mod store;
pub mod time;

pub use checkpoint::{CheckpointKey, CheckpointKind, CheckpointMode, CheckpointStore, DateRange};
pub use chunked::{Block, DenseArray, Kernel, LazyArray, PartialArray, Selection};
pub use config::{CheckpointConfig, PipelineConfig, RegionSpec};
pub use dataset::{CycleDataset, QualityFilter, RawArrays};
pub use error::{ComputeError, ConfigError, GraphError, Pass, PipelineError, PoolError, StoreError};
pub use kernels::{nan_linregress, nan_ptp, valid_count, LinregressResult};
pub use pipeline::{CostClass, Pipeline, PipelineInput, PipelineOutput, Requires, Stage, StagePlan};
pub use pool::WorkerPool;
pub use projection::Projection;
pub use raster::{rasterize_mean, Grid};
pub use reduce::{HeightRangeTable, Points, RegressionTable};
pub use region::{named_regions, region_by_key, Region};
pub use store::{ChunkStore, StoreWriter};
