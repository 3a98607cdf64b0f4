//! Error taxonomy for the dh/dt engine.
//!
//! Missing samples and degenerate regressions never show up here: kernels
//! answer those with `NaN`. Everything below is a hard failure of a resource
//! (store, worker pool) or of the graph itself.
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the on-disk chunked store, used for both input and checkpoints.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing exists at the path. For checkpoints this means "recompute".
    #[error("no chunked store at {path}")]
    NotFound { path: PathBuf },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Something exists but cannot be trusted.
    #[error("corrupt chunked store at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("variable `{name}` not present in store {path}")]
    MissingVariable { path: PathBuf, name: String },

    #[error("variable `{name}` does not fit the store layout: {reason}")]
    Layout { name: String, reason: String },
}

/// Why a single chunk task produced no block.
#[derive(Debug, Error)]
pub enum ChunkFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("block shape {rows}x{cols}, expected {expected_rows}x{expected_cols}")]
    Shape {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Raised while building a lazy graph, before anything runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("chunk partitions of `{left}` and `{right}` differ")]
    ChunksMismatch { left: String, right: String },

    #[error("kernel {kernel} takes {expected} input(s), got {got}")]
    Arity {
        kernel: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("kernel {kernel}: {reason}")]
    Columns { kernel: &'static str, reason: String },

    #[error("selection built for {expected} chunk(s) applied to `{array}` with {got}")]
    SelectionMismatch {
        array: String,
        expected: usize,
        got: usize,
    },
}

/// Failure surfaced at a `materialize` / `persist` boundary.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("`{array}` chunk {chunk} (points {start}..{end}): {failure}")]
    Chunk {
        array: String,
        chunk: usize,
        start: usize,
        end: usize,
        #[source]
        failure: ChunkFailure,
    },

    /// The evaluated array could not be written where it was sent.
    #[error("cannot store `{array}`: {source}")]
    Store {
        array: String,
        #[source]
        source: StoreError,
    },
}

/// Either half of building-then-running a graph.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Compute(#[from] ComputeError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not build worker pool with {workers} worker(s): {reason}")]
    Build { workers: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown region `{0}`")]
    UnknownRegion(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The computation a pipeline error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Load,
    Range,
    Regression,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pass::Load => "load",
            Pass::Range => "range",
            Pass::Regression => "regression",
        })
    }
}

/// Top-level run failure: always names the pass and the resource at fault.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid stage plan: {0}")]
    Plan(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),

    #[error("{pass} pass: bad array graph: {source}")]
    Graph {
        pass: Pass,
        #[source]
        source: GraphError,
    },

    #[error("{pass} pass: worker task failed: {source}")]
    Compute {
        pass: Pass,
        #[source]
        source: ComputeError,
    },

    #[error("{pass} pass: input store: {source}")]
    Input {
        pass: Pass,
        #[source]
        source: StoreError,
    },

    #[error("{pass} pass: checkpoint store: {source}")]
    Checkpoint {
        pass: Pass,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// Classify a failed graph evaluation. Store failures inside a chunk
    /// task are blamed on the store the graph reads from.
    pub(crate) fn eval(pass: Pass, err: EvalError, reads: StoreRole) -> Self {
        match err {
            EvalError::Graph(source) => PipelineError::Graph { pass, source },
            EvalError::Compute(source) => Self::compute(pass, source, reads),
        }
    }

    pub(crate) fn compute(pass: Pass, err: ComputeError, reads: StoreRole) -> Self {
        let source = match err {
            ComputeError::Chunk {
                failure: ChunkFailure::Store(source),
                ..
            }
            | ComputeError::Store { source, .. } => source,
            other => return PipelineError::Compute { pass, source: other },
        };
        match reads {
            StoreRole::Input => PipelineError::Input { pass, source },
            StoreRole::Checkpoint => PipelineError::Checkpoint { pass, source },
        }
    }
}

/// Which store a lazy graph ultimately reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreRole {
    Input,
    Checkpoint,
}
