//! JSON description of one preprocessing run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::enums::{BlobPrecision, DumpTarget, PoolKind, SourceKind};
use crate::error::Result;
use crate::geometry::Shape3;

fn default_format() -> String {
    "raw".to_string()
}

fn default_extension() -> String {
    "mhd".to_string()
}

fn default_order() -> usize {
    3
}

fn default_share() -> f64 {
    0.8
}

/// Everything `pipeline::run` needs, read from a JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory holding one file (MetaImage) or one folder (DICOM) per scan.
    pub scans: PathBuf,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub source: SourceKind,
    /// File extension of MetaImage headers. Ignored for DICOM folders.
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub annotations: Option<PathBuf>,
    /// Size of the worker pool; rayon's global pool when absent.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub resize: Option<ResizeConfig>,
    #[serde(default)]
    pub sample: Option<SampleConfig>,
    #[serde(default)]
    pub dump: Vec<DumpConfig>,
    /// Where the sampled patch batch goes, as `data/` and `mask/` subfolders.
    #[serde(default)]
    pub patches: Option<PathBuf>,
    #[serde(default)]
    pub precision: BlobPrecision,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizeConfig {
    pub shape: Shape3,
    #[serde(default = "default_order")]
    pub order: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleConfig {
    pub batch_size: usize,
    pub patch_size: Shape3,
    #[serde(default = "default_share")]
    pub share: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpConfig {
    pub target: DumpTarget,
    pub path: PathBuf,
}

impl PipelineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn pool_kind(&self) -> PoolKind {
        self.workers.map_or(PoolKind::Global, PoolKind::Threads)
    }

    /// Extension used to index the scan directory.
    pub fn scan_extension(&self) -> Option<&str> {
        match self.source {
            SourceKind::MetaImage => Some(self.extension.as_str()),
            SourceKind::Dicom => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = PipelineConfig::from_json_str(r#"{"scans": "/data/luna"}"#).unwrap();
        assert_eq!(config.format, "raw");
        assert_eq!(config.source, SourceKind::MetaImage);
        assert_eq!(config.scan_extension(), Some("mhd"));
        assert_eq!(config.pool_kind(), PoolKind::Global);
        assert_eq!(config.precision, BlobPrecision::F32);
        assert!(config.dump.is_empty() && config.sample.is_none());
    }

    #[test]
    fn full_config() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "scans": "scans",
                "source": "dicom",
                "annotations": "annotations.csv",
                "workers": 4,
                "resize": {"shape": [128, 256, 256]},
                "sample": {"batch_size": 20, "patch_size": [32, 64, 64], "seed": 7},
                "dump": [{"target": "source", "path": "out/data"}, {"target": "mask", "path": "out/mask"}],
                "patches": "out/patches",
                "precision": "f16"
            }"#,
        )
        .unwrap();
        assert_eq!(config.scan_extension(), None);
        assert_eq!(config.pool_kind(), PoolKind::Threads(4));
        let resize = config.resize.unwrap();
        assert_eq!((resize.shape, resize.order), ([128, 256, 256], 3));
        let sample = config.sample.unwrap();
        assert_eq!(sample.share, 0.8);
        assert_eq!(sample.seed, Some(7));
        assert_eq!(config.dump[0].target, DumpTarget::Data);
        assert_eq!(config.precision, BlobPrecision::F16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PipelineConfig::from_json_str(r#"{"scans": "x", "shape": [1, 2, 3]}"#).unwrap_err();
        assert!(matches!(err, crate::error::BatchError::Config(_)));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"scans": "s", "format": "raw"}"#).unwrap();
        assert_eq!(PipelineConfig::from_path(&path).unwrap().scans, PathBuf::from("s"));
    }
}
