//! Replaceable result caches keyed by (computation, region, date range).
//!
//! Absence of a checkpoint means "recompute"; a checkpoint that exists but
//! cannot be read is an error. Writes go to a sibling `.partial` directory
//! and are renamed into place, so a reader never sees half a checkpoint.
//! Concurrent writers to the same key are not coordinated.
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{ChunkStore, StoreWriter};

pub const ATTR_KIND: &str = "checkpoint_kind";
pub const ATTR_REGION: &str = "region";
pub const ATTR_DATE_FROM: &str = "date_from";
pub const ATTR_DATE_TO: &str = "date_to";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Height range plus the height/time arrays that fed it.
    HeightRange,
    /// Regression parameters for points past the range threshold.
    Dhdt,
}

impl CheckpointKind {
    fn prefix(self) -> &'static str {
        match self {
            CheckpointKind::HeightRange => "ds_hrange_time",
            CheckpointKind::Dhdt => "ds_dhdt",
        }
    }
}

/// Inclusive acquisition date range, `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    pub kind: CheckpointKind,
    pub region: String,
    pub date_range: DateRange,
}

impl CheckpointKey {
    pub fn new(kind: CheckpointKind, region: impl Into<String>, date_range: DateRange) -> Self {
        Self {
            kind,
            region: region.into(),
            date_range,
        }
    }

    /// e.g. `ds_hrange_time_kamb_2018-10-14_2020-04-04`.
    pub fn dir_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.kind.prefix(),
            self.region,
            self.date_range.from,
            self.date_range.to
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Load when present, otherwise compute and save.
    #[default]
    Use,
    /// Always compute and overwrite.
    Refresh,
    Off,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &CheckpointKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    /// `Ok(None)` if no checkpoint exists for `key`.
    pub fn load(&self, key: &CheckpointKey) -> Result<Option<ChunkStore>, StoreError> {
        let path = self.path(key);
        let store = match ChunkStore::open(&path) {
            Ok(s) => s,
            Err(StoreError::NotFound { .. }) => {
                debug!(checkpoint = %key.dir_name(), "no checkpoint");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let expected = serde_json::to_value(key.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned));
        if store.attr(ATTR_KIND) != expected.as_deref() {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("checkpoint kind is {:?}, expected {:?}", store.attr(ATTR_KIND), expected),
            });
        }
        info!(checkpoint = %key.dir_name(), points = store.manifest().n_points, "loaded checkpoint");
        Ok(Some(store))
    }

    /// Start writing a checkpoint; nothing is visible until
    /// [`CheckpointWriter::commit`].
    pub fn begin(
        &self,
        key: &CheckpointKey,
        cycles: Vec<u32>,
        chunks: Vec<usize>,
    ) -> Result<CheckpointWriter, StoreError> {
        let final_path = self.path(key);
        let partial = self.root.join(format!("{}.partial", key.dir_name()));
        if partial.exists() {
            fs::remove_dir_all(&partial).map_err(|source| StoreError::Io {
                path: partial.clone(),
                source,
            })?;
        }
        let mut writer = StoreWriter::create(&partial, cycles, chunks)?;
        if let Some(kind) = serde_json::to_value(key.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
        {
            writer.set_attr(ATTR_KIND, kind);
        }
        writer.set_attr(ATTR_REGION, key.region.clone());
        writer.set_attr(ATTR_DATE_FROM, key.date_range.from.clone());
        writer.set_attr(ATTR_DATE_TO, key.date_range.to.clone());
        Ok(CheckpointWriter {
            writer,
            final_path,
            name: key.dir_name(),
        })
    }
}

pub struct CheckpointWriter {
    writer: StoreWriter,
    final_path: PathBuf,
    name: String,
}

impl CheckpointWriter {
    pub fn store(&mut self) -> &mut StoreWriter {
        &mut self.writer
    }

    /// Finish the store and move it over any previous checkpoint.
    pub fn commit(self) -> Result<ChunkStore, StoreError> {
        let partial = self.writer.root().to_path_buf();
        self.writer.finish()?;
        if self.final_path.exists() {
            fs::remove_dir_all(&self.final_path).map_err(|source| StoreError::Io {
                path: self.final_path.clone(),
                source,
            })?;
        }
        fs::rename(&partial, &self.final_path).map_err(|source| StoreError::Io {
            path: self.final_path.clone(),
            source,
        })?;
        info!(checkpoint = %self.name, "saved checkpoint");
        ChunkStore::open(&self.final_path)
    }
}
