use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// How a batch gets its voxels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadFormat {
    /// Decode every scan through a [`VolumeSource`](crate::volume_loader::VolumeSource).
    Raw,
    /// Take an already built skyscraper array with its bounds.
    Array,
}

impl FromStr for LoadFormat {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(LoadFormat::Raw),
            "ndarray" | "array" => Ok(LoadFormat::Array),
            other => Err(BatchError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Which buffer of a batch a dump writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpTarget {
    #[serde(alias = "source")]
    Data,
    Mask,
}

/// Element type written into blobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobPrecision {
    #[default]
    F32,
    F16,
}

/// Worker pool used by the dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolKind {
    /// Rayon's global pool.
    #[default]
    Global,
    /// A dedicated pool with a fixed number of threads.
    Threads(usize),
}

/// Decoder used for raw scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    MetaImage,
    Dicom,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    InstanceNumber,
    None,
}
