//! Run configuration, read from an optional JSON file.
//!
//! Every field has a default, so `{}` is a valid file. Command-line flags
//! are applied on top by the binary.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointMode, DateRange};
use crate::dataset::QualityFilter;
use crate::eligibility::{MIN_VALID_SAMPLES, RANGE_THRESHOLD};
use crate::error::ConfigError;
use crate::kernels::NANOS_PER_YEAR;
use crate::pipeline::{Stage, StagePlan};
use crate::projection::Projection;
use crate::region::{region_by_key, Region};

/// Region key used in checkpoint names when no region is configured.
pub const ALL_POINTS: &str = "all";

/// A named region from [`crate::region::named_regions`] or an explicit box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegionSpec {
    Named(String),
    Bounds(Region),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// No directory means no checkpoints, whatever the mode.
    pub dir: Option<PathBuf>,
    pub mode: CheckpointMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads; `0` picks one per core.
    pub workers: usize,
    /// Points per chunk when writing synthetic stores.
    pub chunk_points: usize,
    pub min_valid_samples: usize,
    /// Metres; points must exceed it strictly.
    pub range_threshold: f64,
    pub quality: QualityFilter,
    pub projection: Projection,
    pub region: Option<RegionSpec>,
    /// Taken from the data when absent.
    pub date_range: Option<DateRange>,
    pub checkpoint: CheckpointConfig,
    /// Ticks per output time unit; the default gives metres per year.
    pub slope_factor: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            chunk_points: 50_000,
            min_valid_samples: MIN_VALID_SAMPLES,
            range_threshold: RANGE_THRESHOLD,
            quality: QualityFilter::default(),
            projection: Projection::default(),
            region: None,
            date_range: None,
            checkpoint: CheckpointConfig::default(),
            slope_factor: NANOS_PER_YEAR,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_points == 0 {
            return Err(ConfigError::Invalid("chunk_points must be positive".into()));
        }
        if self.min_valid_samples == 0 {
            return Err(ConfigError::Invalid("min_valid_samples must be at least 1".into()));
        }
        if !self.range_threshold.is_finite() {
            return Err(ConfigError::Invalid("range_threshold must be finite".into()));
        }
        if !self.slope_factor.is_finite() || self.slope_factor == 0.0 {
            return Err(ConfigError::Invalid("slope_factor must be finite and non-zero".into()));
        }
        if self.quality.accept.is_empty() {
            return Err(ConfigError::Invalid("quality.accept is empty; every sample would be rejected".into()));
        }
        self.region()?;
        Ok(())
    }

    /// Resolved region and the key it contributes to checkpoint names.
    pub fn region(&self) -> Result<Option<(String, Region)>, ConfigError> {
        match &self.region {
            None => Ok(None),
            Some(RegionSpec::Named(key)) => region_by_key(key)
                .map(|r| Some((key.clone(), r)))
                .ok_or_else(|| ConfigError::UnknownRegion(key.clone())),
            Some(RegionSpec::Bounds(r)) => {
                if !(r.xmin <= r.xmax && r.ymin <= r.ymax) {
                    return Err(ConfigError::Invalid(format!("region `{}` has inverted bounds", r.name)));
                }
                Ok(Some((region_key(&r.name), r.clone())))
            }
        }
    }

    pub fn region_key(&self) -> Result<String, ConfigError> {
        Ok(self
            .region()?
            .map_or_else(|| ALL_POINTS.to_string(), |(key, _)| key))
    }

    /// `[RegionSubset?, MinValidSamples, RangePass, RangeThreshold, RegressionPass]`.
    pub fn plan(&self) -> Result<StagePlan, ConfigError> {
        let mut stages = Vec::new();
        if let Some((_, region)) = self.region()? {
            stages.push(Stage::RegionSubset(region));
        }
        stages.extend([
            Stage::MinValidSamples(self.min_valid_samples),
            Stage::RangePass,
            Stage::RangeThreshold(self.range_threshold),
            Stage::RegressionPass,
        ]);
        StagePlan::new(stages).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Lower-case, underscores for anything that is not alphanumeric.
fn region_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::scratch_dir;

    #[test]
    fn empty_file_gives_defaults() {
        let dir = scratch_dir("cfg");
        let path = dir.join("c.json");
        fs::write(&path, "{}").unwrap();
        let cfg = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.min_valid_samples, 2);
        assert_eq!(cfg.range_threshold, 0.25);
        assert_eq!(cfg.quality.accept, vec![0]);
        assert_eq!(cfg.region_key().unwrap(), ALL_POINTS);
    }

    #[test]
    fn named_and_explicit_regions() {
        let named: PipelineConfig =
            serde_json::from_str(r#"{"region": "kamb", "checkpoint": {"mode": "refresh"}}"#).unwrap();
        assert_eq!(named.region_key().unwrap(), "kamb");
        assert_eq!(named.checkpoint.mode, CheckpointMode::Refresh);
        assert_eq!(named.plan().unwrap().stages().len(), 5);

        let boxed: PipelineConfig = serde_json::from_str(
            r#"{"region": {"name": "Test Box", "xmin": 0, "xmax": 1, "ymin": 0, "ymax": 1}}"#,
        )
        .unwrap();
        assert_eq!(boxed.region_key().unwrap(), "test_box");

        let unknown: PipelineConfig = serde_json::from_str(r#"{"region": "atlantis"}"#).unwrap();
        assert!(matches!(unknown.validate(), Err(ConfigError::UnknownRegion(_))));
    }

    #[test]
    fn bad_values_are_rejected() {
        let dir = scratch_dir("cfg-bad");
        let path = dir.join("c.json");
        fs::write(&path, r#"{"quality": {"accept": []}}"#).unwrap();
        assert!(matches!(PipelineConfig::from_json_file(&path), Err(ConfigError::Invalid(_))));
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(PipelineConfig::from_json_file(&path), Err(ConfigError::Parse { .. })));
    }
}
