//! Directory-backed chunked columnar store.
//!
//! Layout:
//!   <root>/manifest.json          consolidated metadata, written last
//!   <root>/<variable>/<chunk>.json  one dense block per chunk, `null` = missing
//!
//! The same format serves as the read-only input store and as the checkpoint
//! store. A store is complete once its manifest exists.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunked::{Block, ChunkSource, DenseArray, LazyArray, Traversal};
use crate::error::{ChunkFailure, ComputeError, StoreError};
use crate::pool::WorkerPool;

pub const MANIFEST_FILE: &str = "manifest.json";
const FORMAT: &str = "atlxi-chunked-v1";

// ── Serde helpers ─────────────────────────────────────────────────────────────

pub(crate) fn null_as_nan_vec<'de, D: serde::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Vec<f64>, D::Error> {
    let v: Vec<Option<f64>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect())
}

// ── On-disk schema ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMeta {
    pub cols: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub n_points: usize,
    /// Cycle numbers labelling the columns of per-cycle variables.
    pub cycles: Vec<u32>,
    /// Rows per chunk along the point axis.
    pub chunks: Vec<usize>,
    pub variables: BTreeMap<String, VariableMeta>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// Non-finite values serialize as `null` through serde_json.
#[derive(Serialize, Deserialize)]
struct ChunkFile {
    rows: usize,
    cols: usize,
    #[serde(deserialize_with = "null_as_nan_vec")]
    data: Vec<f64>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn chunk_path(root: &Path, name: &str, chunk: usize) -> PathBuf {
    root.join(name).join(format!("{chunk}.json"))
}

fn write_block(path: &Path, block: &Block) -> Result<(), StoreError> {
    let file = ChunkFile {
        rows: block.rows,
        cols: block.cols,
        data: block.data.clone(),
    };
    let text = serde_json::to_string(&file).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::write(path, text).map_err(io_err(path))
}

fn read_block(path: &Path) -> Result<Block, StoreError> {
    let text = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "chunk file missing".into(),
            }
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    let file: ChunkFile = serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if file.data.len() != file.rows * file.cols {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{} values for a {}x{} block", file.data.len(), file.rows, file.cols),
        });
    }
    Ok(Block::new(file.rows, file.cols, file.data))
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// An opened, complete store.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
    manifest: Manifest,
}

struct StoreVariable {
    root: PathBuf,
    name: String,
    /// Values must be point identifiers (non-negative integers).
    identifiers: bool,
}

impl ChunkSource for StoreVariable {
    fn read_chunk(&self, chunk: usize) -> Result<Block, ChunkFailure> {
        let path = chunk_path(&self.root, &self.name, chunk);
        let block = read_block(&path)?;
        if self.identifiers {
            let bad = block
                .data
                .iter()
                .position(|v| !(v.is_finite() && *v >= 0.0 && v.fract() == 0.0));
            if let Some(i) = bad {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!(
                        "row {} holds {} where a point identifier is expected",
                        i / block.cols.max(1),
                        block.data[i]
                    ),
                }
                .into());
            }
        }
        Ok(block)
    }
}

impl ChunkStore {
    /// Open a store. A missing root is [`StoreError::NotFound`]; a root
    /// without a readable, consistent manifest is [`StoreError::Corrupt`].
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(StoreError::NotFound { path: root });
        }
        let manifest_path = root.join(MANIFEST_FILE);
        let corrupt = |reason: String| StoreError::Corrupt {
            path: manifest_path.clone(),
            reason,
        };
        let text = match fs::read_to_string(&manifest_path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(corrupt("manifest missing (incomplete write?)".into()));
            }
            Err(e) => return Err(io_err(&manifest_path)(e)),
        };
        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
        if manifest.format != FORMAT {
            return Err(corrupt(format!("unknown format `{}`", manifest.format)));
        }
        if manifest.chunks.iter().sum::<usize>() != manifest.n_points {
            return Err(corrupt(format!(
                "chunk sizes sum to {}, manifest says {} points",
                manifest.chunks.iter().sum::<usize>(),
                manifest.n_points
            )));
        }
        debug!(
            path = %root.display(),
            points = manifest.n_points,
            chunks = manifest.chunks.len(),
            "opened chunked store"
        );
        Ok(Self { root, manifest })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn cycles(&self) -> &[u32] {
        &self.manifest.cycles
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.manifest.attrs.get(key).map(String::as_str)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.manifest.variables.contains_key(name)
    }

    /// Lazy view of one variable; nothing is read until evaluation.
    pub fn variable(&self, name: &str) -> Result<LazyArray, StoreError> {
        self.lazy_variable(name, false)
    }

    /// Like [`variable`](Self::variable), but a chunk holding anything other
    /// than a non-negative integer fails to read as [`StoreError::Corrupt`].
    pub fn identifier_variable(&self, name: &str) -> Result<LazyArray, StoreError> {
        self.lazy_variable(name, true)
    }

    fn lazy_variable(&self, name: &str, identifiers: bool) -> Result<LazyArray, StoreError> {
        let meta = self
            .manifest
            .variables
            .get(name)
            .ok_or_else(|| StoreError::MissingVariable {
                path: self.root.clone(),
                name: name.to_string(),
            })?;
        let source = Arc::new(StoreVariable {
            root: self.root.clone(),
            name: name.to_string(),
            identifiers,
        });
        Ok(LazyArray::from_source(
            name,
            self.manifest.chunks.clone(),
            meta.cols,
            source,
        ))
    }
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Builds a store chunk by chunk; the manifest is written by [`finish`](Self::finish).
pub struct StoreWriter {
    root: PathBuf,
    manifest: Manifest,
}

impl StoreWriter {
    /// Start a new store at `root`, which must not already hold a manifest.
    pub fn create(root: impl AsRef<Path>, cycles: Vec<u32>, chunks: Vec<usize>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        let manifest_path = root.join(MANIFEST_FILE);
        if manifest_path.exists() {
            return Err(StoreError::Layout {
                name: MANIFEST_FILE.into(),
                reason: format!("{} already holds a store", root.display()),
            });
        }
        Ok(Self {
            root,
            manifest: Manifest {
                format: FORMAT.into(),
                n_points: chunks.iter().sum(),
                cycles,
                chunks,
                variables: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.manifest.attrs.insert(key.into(), value.into());
    }

    fn check_layout(&self, name: &str, chunks: &[usize]) -> Result<PathBuf, StoreError> {
        if chunks != self.manifest.chunks.as_slice() {
            return Err(StoreError::Layout {
                name: name.into(),
                reason: format!(
                    "{} chunk(s) / {} points, store has {} / {}",
                    chunks.len(),
                    chunks.iter().sum::<usize>(),
                    self.manifest.chunks.len(),
                    self.manifest.n_points
                ),
            });
        }
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    /// Write an in-memory array.
    pub fn write_dense(&mut self, name: &str, array: &DenseArray) -> Result<(), StoreError> {
        self.check_layout(name, array.chunks())?;
        for (i, block) in array.to_blocks().iter().enumerate() {
            write_block(&chunk_path(&self.root, name, i), block)?;
        }
        self.manifest
            .variables
            .insert(name.into(), VariableMeta { cols: array.cols() });
        Ok(())
    }

    /// Evaluate a lazy array chunk by chunk on the pool, writing each block
    /// as soon as it is ready. The full array is never held in memory.
    pub fn write_lazy(
        &mut self,
        name: &str,
        array: &LazyArray,
        pool: &WorkerPool,
    ) -> Result<(), ComputeError> {
        self.check_layout(name, array.chunks())
            .map_err(|source| ComputeError::Store {
                array: array.label().to_string(),
                source,
            })?;
        let root = self.root.clone();
        let traversal = Traversal::new(false);
        let results = pool.run_chunks(array.n_chunks(), |i| {
            let block = array.eval_chunk(i, traversal)?;
            write_block(&chunk_path(&root, name, i), &block)?;
            Ok(())
        });
        for (i, r) in results.into_iter().enumerate() {
            if let Err(failure) = r {
                let (start, end) = array.chunk_rows(i);
                return Err(ComputeError::Chunk {
                    array: array.label().to_string(),
                    chunk: i,
                    start,
                    end,
                    failure,
                });
            }
        }
        self.manifest
            .variables
            .insert(name.into(), VariableMeta { cols: array.cols() });
        Ok(())
    }

    /// Write the manifest, completing the store.
    pub fn finish(self) -> Result<ChunkStore, StoreError> {
        let path = self.root.join(MANIFEST_FILE);
        let text = serde_json::to_string_pretty(&self.manifest).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, text).map_err(io_err(&path))?;
        Ok(ChunkStore {
            root: self.root,
            manifest: self.manifest,
        })
    }
}
