//! Lazily evaluated Points × Columns arrays partitioned along the point axis.
//!
//! A [`LazyArray`] is a node in a task graph: a store source, a persisted set
//! of blocks, a kernel map, or a row selection. Nothing runs until
//! [`LazyArray::materialize`] or [`LazyArray::persist`] is called; both block
//! the caller until every chunk task of the requested sub-graph is done. The
//! column axis (cycles) is never split.
pub mod block;
pub mod kernel;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ChunkFailure, ComputeError, GraphError};
use crate::pool::WorkerPool;
pub use block::{Block, DenseArray, Selection};
pub use kernel::Kernel;

static NEXT_TRAVERSAL: AtomicUsize = AtomicUsize::new(1);

/// One evaluation of a graph. Every node it reaches is counted once, however
/// many chunks or consumers pull from it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Traversal {
    id: usize,
    deliberate: bool,
}

impl Traversal {
    pub(crate) fn new(deliberate: bool) -> Self {
        Self {
            id: NEXT_TRAVERSAL.fetch_add(1, Ordering::Relaxed),
            deliberate,
        }
    }
}

/// Something that can produce chunk `i` of an array on demand.
pub trait ChunkSource: Send + Sync {
    fn read_chunk(&self, chunk: usize) -> Result<Block, ChunkFailure>;
}

enum Node {
    Source(Arc<dyn ChunkSource>),
    Persisted(Vec<Arc<Block>>),
    Map { kernel: Kernel, inputs: Vec<LazyArray> },
    Select { input: LazyArray, picks: Arc<Vec<(usize, Vec<usize>)>> },
}

struct Inner {
    chunks: Vec<usize>,
    cols: usize,
    node: Node,
    evaluations: AtomicUsize,
    /// Unintended re-evaluations of a derived node.
    repeats: AtomicUsize,
    /// Id of the last traversal that reached this node, 0 if none.
    last_traversal: AtomicUsize,
}

/// Cheap-to-clone handle on a node of the task graph.
#[derive(Clone)]
pub struct LazyArray {
    inner: Arc<Inner>,
    label: Arc<str>,
}

/// Result of [`LazyArray::materialize_partial`]: failed chunks are `NaN`.
#[derive(Debug)]
pub struct PartialArray {
    pub array: DenseArray,
    pub failures: Vec<ComputeError>,
}

impl fmt::Debug for LazyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyArray")
            .field("label", &self.label)
            .field("rows", &self.len())
            .field("cols", &self.inner.cols)
            .field("chunks", &self.inner.chunks.len())
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

impl LazyArray {
    fn from_node(label: String, chunks: Vec<usize>, cols: usize, node: Node) -> Self {
        Self {
            inner: Arc::new(Inner {
                chunks,
                cols,
                node,
                evaluations: AtomicUsize::new(0),
                repeats: AtomicUsize::new(0),
                last_traversal: AtomicUsize::new(0),
            }),
            label: Arc::from(label),
        }
    }

    /// Array whose chunks are read from `source` when evaluated.
    pub fn from_source(
        label: impl Into<String>,
        chunks: Vec<usize>,
        cols: usize,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        Self::from_node(label.into(), chunks, cols, Node::Source(source))
    }

    /// Wrap an in-memory array as an already persisted node.
    pub fn from_dense(label: impl Into<String>, array: &DenseArray) -> Self {
        let blocks = array.to_blocks().into_iter().map(Arc::new).collect();
        Self::from_node(label.into(), array.chunks().to_vec(), array.cols(), Node::Persisted(blocks))
    }

    /// Apply a kernel chunk by chunk. All inputs must share one partition.
    pub fn map(kernel: Kernel, inputs: &[&LazyArray]) -> Result<LazyArray, GraphError> {
        let first = inputs.first().ok_or(GraphError::Arity {
            kernel: kernel.name(),
            expected: 1,
            got: 0,
        })?;
        for other in &inputs[1..] {
            if other.inner.chunks != first.inner.chunks {
                return Err(GraphError::ChunksMismatch {
                    left: first.label().to_string(),
                    right: other.label().to_string(),
                });
            }
        }
        let in_cols: Vec<usize> = inputs.iter().map(|a| a.cols()).collect();
        let cols = kernel.output_cols(&in_cols)?;
        let label = format!(
            "{}({})",
            kernel.name(),
            inputs.iter().map(|a| a.label()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self::from_node(
            label,
            first.inner.chunks.clone(),
            cols,
            Node::Map {
                kernel,
                inputs: inputs.iter().map(|a| (*a).clone()).collect(),
            },
        ))
    }

    /// Keep only the rows chosen by `selection`, preserving order.
    pub fn select(&self, selection: &Selection) -> Result<LazyArray, GraphError> {
        if selection.source_chunks() != self.inner.chunks.as_slice() {
            return Err(GraphError::SelectionMismatch {
                array: self.label().to_string(),
                expected: selection.source_chunks().len(),
                got: self.inner.chunks.len(),
            });
        }
        Ok(Self::from_node(
            self.label().to_string(),
            selection.chunk_sizes(),
            self.cols(),
            Node::Select {
                input: self.clone(),
                picks: Arc::new(selection.picks().to_vec()),
            },
        ))
    }

    /// Give the handle a new label (used in logs and errors).
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = Arc::from(label.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn chunks(&self) -> &[usize] {
        &self.inner.chunks
    }

    pub fn n_chunks(&self) -> usize {
        self.inner.chunks.len()
    }

    pub fn cols(&self) -> usize {
        self.inner.cols
    }

    /// Number of points (rows).
    pub fn len(&self) -> usize {
        self.inner.chunks.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.inner.node, Node::Persisted(_))
    }

    /// How many graph evaluations have computed this node, either as the
    /// array asked for or as an input further up. Persisted nodes stay at 0.
    pub fn evaluations(&self) -> usize {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    /// Evaluations of this derived node after its first one that were not
    /// requested through [`recompute`](Self::recompute). Each logged a warning.
    pub fn repeated_evaluations(&self) -> usize {
        self.inner.repeats.load(Ordering::Relaxed)
    }

    /// Global row range of chunk `i`.
    pub fn chunk_rows(&self, i: usize) -> (usize, usize) {
        let start: usize = self.inner.chunks[..i].iter().sum();
        (start, start + self.inner.chunks[i])
    }

    /// Evaluate one chunk, recursing through the graph.
    pub(crate) fn eval_chunk(&self, i: usize, traversal: Traversal) -> Result<Arc<Block>, ChunkFailure> {
        self.note_traversal(traversal);
        match &self.inner.node {
            Node::Source(source) => {
                let block = source.read_chunk(i)?;
                let (expected_rows, expected_cols) = (self.inner.chunks[i], self.inner.cols);
                if block.rows != expected_rows || block.cols != expected_cols {
                    return Err(ChunkFailure::Shape {
                        rows: block.rows,
                        cols: block.cols,
                        expected_rows,
                        expected_cols,
                    });
                }
                Ok(Arc::new(block))
            }
            Node::Persisted(blocks) => Ok(Arc::clone(&blocks[i])),
            Node::Map { kernel, inputs } => {
                let blocks = inputs
                    .iter()
                    .map(|a| a.eval_chunk(i, traversal))
                    .collect::<Result<Vec<_>, _>>()?;
                let refs: Vec<&Block> = blocks.iter().map(|b| b.as_ref()).collect();
                Ok(Arc::new(kernel.apply(&refs)))
            }
            Node::Select { input, picks } => {
                let (source_chunk, rows) = &picks[i];
                Ok(Arc::new(input.eval_chunk(*source_chunk, traversal)?.take_rows(rows)))
            }
        }
    }

    fn chunk_error(&self, chunk: usize, failure: ChunkFailure) -> ComputeError {
        let (start, end) = self.chunk_rows(chunk);
        ComputeError::Chunk {
            array: self.label().to_string(),
            chunk,
            start,
            end,
            failure,
        }
    }

    /// Count the first chunk of each traversal that reaches this node.
    /// A derived node reached again by a later traversal is being recomputed.
    fn note_traversal(&self, traversal: Traversal) {
        if self.is_persisted() {
            return;
        }
        let prior = self.inner.last_traversal.swap(traversal.id, Ordering::AcqRel);
        if prior == traversal.id {
            return;
        }
        let evaluations = self.inner.evaluations.fetch_add(1, Ordering::Relaxed) + 1;
        if prior == 0 || matches!(self.inner.node, Node::Source(_)) {
            return;
        }
        if traversal.deliberate {
            debug!(array = self.label(), evaluations, "recomputing lazy array");
        } else {
            self.inner.repeats.fetch_add(1, Ordering::Relaxed);
            warn!(
                array = self.label(),
                evaluations,
                "lazy array evaluated again from its graph; persist it if it is reused"
            );
        }
    }

    fn evaluate(&self, pool: &WorkerPool, deliberate: bool) -> Vec<Result<Arc<Block>, ChunkFailure>> {
        let traversal = Traversal::new(deliberate);
        pool.run_chunks(self.n_chunks(), |i| self.eval_chunk(i, traversal))
    }

    fn collect(&self, pool: &WorkerPool, deliberate: bool) -> Result<Vec<Arc<Block>>, ComputeError> {
        self.evaluate(pool, deliberate)
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.map_err(|f| self.chunk_error(i, f)))
            .collect()
    }

    /// Run the whole graph and bring the result into memory.
    ///
    /// The first failed chunk aborts this materialization.
    pub fn materialize(&self, pool: &WorkerPool) -> Result<DenseArray, ComputeError> {
        let blocks = self.collect(pool, false)?;
        Ok(DenseArray::from_blocks(self.cols(), blocks.iter().map(|b| b.as_ref())))
    }

    /// Same as [`materialize`](Self::materialize) but marks the repeated
    /// evaluation of this node and everything above it as intended.
    pub fn recompute(&self, pool: &WorkerPool) -> Result<DenseArray, ComputeError> {
        let blocks = self.collect(pool, true)?;
        Ok(DenseArray::from_blocks(self.cols(), blocks.iter().map(|b| b.as_ref())))
    }

    /// Materialize, filling failed chunks with `NaN` and reporting them.
    pub fn materialize_partial(&self, pool: &WorkerPool) -> PartialArray {
        let mut failures = Vec::new();
        let blocks: Vec<Block> = self
            .evaluate(pool, false)
            .into_iter()
            .enumerate()
            .map(|(i, r)| match r {
                Ok(b) => Arc::unwrap_or_clone(b),
                Err(f) => {
                    let err = self.chunk_error(i, f);
                    warn!(error = %err, "chunk failed; filling with NaN");
                    failures.push(err);
                    Block::filled(self.inner.chunks[i], self.cols(), f64::NAN)
                }
            })
            .collect();
        PartialArray {
            array: DenseArray::from_blocks(self.cols(), blocks.iter()),
            failures,
        }
    }

    /// Evaluate into worker memory and return a node that serves the stored
    /// blocks, so downstream graphs reuse them without recomputation.
    pub fn persist(&self, pool: &WorkerPool) -> Result<LazyArray, ComputeError> {
        if self.is_persisted() {
            return Ok(self.clone());
        }
        let blocks = self.collect(pool, false)?;
        debug!(array = self.label(), rows = self.len(), "persisted");
        Ok(Self::from_node(
            self.label().to_string(),
            self.inner.chunks.clone(),
            self.cols(),
            Node::Persisted(blocks),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        chunks: Vec<usize>,
        cols: usize,
        reads: AtomicUsize,
        fail_chunk: Option<usize>,
    }

    impl ChunkSource for Counting {
        fn read_chunk(&self, chunk: usize) -> Result<Block, ChunkFailure> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if Some(chunk) == self.fail_chunk {
                return Err(StoreError::Corrupt {
                    path: PathBuf::from(format!("h/{chunk}.json")),
                    reason: "truncated".into(),
                }
                .into());
            }
            let start: usize = self.chunks[..chunk].iter().sum();
            let rows = self.chunks[chunk];
            let data = (0..rows * self.cols)
                .map(|k| ((start * self.cols + k) % 7) as f64)
                .collect();
            Ok(Block::new(rows, self.cols, data))
        }
    }

    fn source(chunks: Vec<usize>, cols: usize, fail_chunk: Option<usize>) -> (LazyArray, Arc<Counting>) {
        let src = Arc::new(Counting {
            chunks: chunks.clone(),
            cols,
            reads: AtomicUsize::new(0),
            fail_chunk,
        });
        let arr = LazyArray::from_source("h", chunks, cols, src.clone());
        (arr, src)
    }

    #[test]
    fn map_preserves_point_order_across_chunks() {
        let pool = WorkerPool::new(3).unwrap();
        let (h, _) = source(vec![3, 1, 4], 4, None);
        let lazy = h.materialize(&pool).unwrap();
        let ptp = LazyArray::map(Kernel::NanPtp, &[&h]).unwrap();
        let out = ptp.materialize(&pool).unwrap();
        assert_eq!(out.rows(), 8);
        assert_eq!(out.chunks(), &[3, 1, 4]);
        for r in 0..8 {
            assert_eq!(out.get(r, 0), crate::kernels::nan_ptp(lazy.row(r)));
        }
    }

    #[test]
    fn materializing_twice_is_bit_identical() {
        let pool = WorkerPool::new(4).unwrap();
        let (h, _) = source(vec![5, 5, 2], 6, None);
        let t = LazyArray::map(Kernel::DeltaTimeToTicks, &[&h]).unwrap();
        let fit = LazyArray::map(Kernel::NanLinregress, &[&t, &h]).unwrap();
        let a = fit.materialize(&pool).unwrap();
        let b = fit.recompute(&pool).unwrap();
        let bits = |d: &DenseArray| d.data().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));
        assert_eq!(fit.evaluations(), 2);
        assert_eq!(t.evaluations(), 2);
        assert_eq!(t.repeated_evaluations(), 0);
    }

    #[test]
    fn reuse_through_a_second_graph_is_counted() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, src) = source(vec![2, 2], 3, None);
        let masked = LazyArray::map(Kernel::DeltaTimeToTicks, &[&h]).unwrap();
        let counts = LazyArray::map(Kernel::ValidCount, &[&masked])
            .unwrap()
            .materialize(&pool)
            .unwrap();
        assert_eq!(masked.evaluations(), 1);

        let sel = Selection::from_predicate(&counts, |row| row[0] > 0.0);
        masked.select(&sel).unwrap().persist(&pool).unwrap();
        assert_eq!(src.reads.load(Ordering::Relaxed), 4);
        assert_eq!(masked.evaluations(), 2);
        assert_eq!(masked.repeated_evaluations(), 1);
    }

    #[test]
    fn persisting_before_reuse_reads_the_source_once() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, src) = source(vec![2, 2], 3, None);
        let masked = LazyArray::map(Kernel::DeltaTimeToTicks, &[&h]).unwrap();
        let held = masked.persist(&pool).unwrap();
        let counts = LazyArray::map(Kernel::ValidCount, &[&held])
            .unwrap()
            .materialize(&pool)
            .unwrap();
        let sel = Selection::from_predicate(&counts, |row| row[0] > 0.0);
        held.select(&sel).unwrap().persist(&pool).unwrap();
        assert_eq!(src.reads.load(Ordering::Relaxed), 2);
        assert_eq!(masked.evaluations(), 1);
        assert_eq!(masked.repeated_evaluations(), 0);
    }

    #[test]
    fn one_graph_pulling_a_node_twice_counts_once() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, _) = source(vec![3, 3], 4, None);
        let t = LazyArray::map(Kernel::DeltaTimeToTicks, &[&h]).unwrap();
        let fit = LazyArray::map(Kernel::NanLinregress, &[&t, &t]).unwrap();
        fit.materialize(&pool).unwrap();
        assert_eq!(t.evaluations(), 1);
        assert_eq!(t.repeated_evaluations(), 0);
    }

    #[test]
    fn persist_stops_rereading_the_source() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, src) = source(vec![2, 2], 3, None);
        let held = h.persist(&pool).unwrap();
        assert_eq!(src.reads.load(Ordering::Relaxed), 2);

        let ptp = LazyArray::map(Kernel::NanPtp, &[&held]).unwrap();
        let count = LazyArray::map(Kernel::ValidCount, &[&held]).unwrap();
        ptp.materialize(&pool).unwrap();
        count.materialize(&pool).unwrap();
        assert_eq!(src.reads.load(Ordering::Relaxed), 2);
        assert!(held.is_persisted());
    }

    #[test]
    fn mismatched_partitions_are_rejected() {
        let (a, _) = source(vec![2, 2], 3, None);
        let (b, _) = source(vec![3, 1], 3, None);
        let err = LazyArray::map(Kernel::NanLinregress, &[&a, &b]).unwrap_err();
        assert!(matches!(err, GraphError::ChunksMismatch { .. }));
    }

    #[test]
    fn failed_chunk_names_its_region() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, _) = source(vec![4, 4, 4], 2, Some(1));
        let ptp = LazyArray::map(Kernel::NanPtp, &[&h]).unwrap();

        match ptp.materialize(&pool) {
            Err(ComputeError::Chunk { chunk, start, end, .. }) => {
                assert_eq!((chunk, start, end), (1, 4, 8));
            }
            other => panic!("expected chunk failure, got {other:?}"),
        }

        let partial = ptp.materialize_partial(&pool);
        assert_eq!(partial.failures.len(), 1);
        let col = partial.array.column(0);
        assert!(col[4..8].iter().all(|v| v.is_nan()));
        assert!(col[..4].iter().chain(col[8..].iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn select_then_map_keeps_input_order() {
        let pool = WorkerPool::new(2).unwrap();
        let (h, _) = source(vec![3, 3], 1, None);
        let values = h.materialize(&pool).unwrap();
        // Keep odd global rows only.
        let idx = DenseArray::from_column(vec![3, 3], (0..6).map(|i| i as f64).collect());
        let sel = Selection::from_predicate(&idx, |row| row[0] as usize % 2 == 1);
        let kept = h.select(&sel).unwrap().materialize(&pool).unwrap();
        assert_eq!(kept.data(), &[values.get(1, 0), values.get(3, 0), values.get(5, 0)]);
        assert_eq!(kept.chunks(), &[1, 2]);
    }
}
