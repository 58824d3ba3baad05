//! Conversions between world millimetres, per-scan voxels and skyscraper voxels.
//!
//! Every vector here is in z, y, x order. Rounding is half-to-even throughout so a
//! centre that lands exactly between two voxels resolves the same way on every axis.

pub type Vec3 = [f64; 3];
pub type Shape3 = [usize; 3];
/// Voxel coordinate that may sit outside a scan (a patch wider than its scan).
pub type Voxel3 = [i64; 3];

#[inline]
fn rint(value: f64) -> f64 {
    value.round_ties_even()
}

/// Voxel nearest to a world-mm point.
pub fn world_to_voxel(center: Vec3, origin: Vec3, spacing: Vec3) -> Voxel3 {
    std::array::from_fn(|axis| rint((center[axis] - origin[axis]).abs() / spacing[axis]) as i64)
}

/// Extent in voxels of an isotropic diameter.
pub fn voxel_extent(diameter: f64, spacing: Vec3) -> Voxel3 {
    std::array::from_fn(|axis| rint(diameter / spacing[axis]) as i64)
}

/// First voxel of a `size` patch centred on `center`.
pub fn patch_start(center: Voxel3, size: Voxel3) -> Voxel3 {
    std::array::from_fn(|axis| center[axis] - rint(size[axis] as f64 / 2.0) as i64)
}

/// Shifts a patch inward so it fits in `[0, image_size)`.
///
/// The far side is resolved first, then the near one, so a scan smaller than the
/// patch yields a start of 0 with the patch hanging over the far edge.
pub fn clamp_to_bounds(start: Voxel3, size: Voxel3, image_size: Shape3) -> Voxel3 {
    std::array::from_fn(|axis| {
        let limit = image_size[axis] as i64;
        let mut value = start[axis];
        let overshoot = value + size[axis] - limit;
        if overshoot > 0 {
            value -= overshoot;
        }
        value.max(0)
    })
}

/// Lifts a scan-local start into the skyscraper by adding the scan's z bias.
pub fn to_skyscraper_coords(voxel_start: Voxel3, bias: usize) -> Voxel3 {
    [voxel_start[0] + bias as i64, voxel_start[1], voxel_start[2]]
}

/// Spacing after resampling `old_shape` onto `new_shape`.
pub fn rescale_spacing(spacing: Vec3, old_shape: Shape3, new_shape: Shape3) -> Vec3 {
    std::array::from_fn(|axis| spacing[axis] * old_shape[axis] as f64 / new_shape[axis] as f64)
}

pub(crate) fn is_valid_geometry(values: Vec3) -> bool {
    values.iter().all(|v| v.is_finite() && *v > 0.0)
}
