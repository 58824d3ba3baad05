use ndarray::Array3;

use crate::error::{BatchError, Result};
use crate::geometry::{Vec3, is_valid_geometry};

/// One decoded scan: voxels plus where they sit in the world.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanVolume {
    pub data: Array3<f32>,
    /// World mm of voxel (0, 0, 0), z-y-x.
    pub origin: Vec3,
    /// mm per voxel, z-y-x.
    pub spacing: Vec3,
}

impl ScanVolume {
    pub fn new(data: Array3<f32>, origin: Vec3, spacing: Vec3) -> Result<Self> {
        if !is_valid_geometry(spacing) {
            return Err(BatchError::invalid(format!(
                "spacing must be positive and finite, got {spacing:?}"
            )));
        }
        if origin.iter().any(|v| !v.is_finite()) {
            return Err(BatchError::invalid(format!(
                "origin must be finite, got {origin:?}"
            )));
        }
        Ok(Self {
            data,
            origin,
            spacing,
        })
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }
}
