//! Choosing patch positions and cutting fixed-size patches out of a skyscraper.

use ndarray::{Array3, Axis, s};
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::error::{BatchError, Result};
use crate::geometry::{self, Shape3, Voxel3};
use crate::nodules::NoduleTable;
use crate::skyscraper::Skyscraper;

/// Where the patches of one training batch start, positives first.
///
/// `scans[i]` is the scan patch `i` is read from; `starts[i]` is in skyscraper
/// coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplePlan {
    pub scans: Vec<usize>,
    pub starts: Vec<Voxel3>,
    pub positives: usize,
}

fn as_voxel(patch: Shape3) -> Voxel3 {
    patch.map(|v| v as i64)
}

pub(crate) fn validate_patch(patch: Shape3) -> Result<()> {
    if patch.contains(&0) {
        return Err(BatchError::invalid(format!(
            "patch size must be positive, got {patch:?}"
        )));
    }
    Ok(())
}

/// One `(scan, start)` per nodule: patch centred on the nodule, pushed inside
/// its scan, lifted by the scan's bias.
pub fn positive_candidates(nodules: &NoduleTable, patch: Shape3) -> Vec<(usize, Voxel3)> {
    let size = as_voxel(patch);
    nodules
        .iter()
        .map(|record| {
            let start = geometry::to_skyscraper_coords(record.clamped_start(size), record.bias);
            (record.scan, start)
        })
        .collect()
}

/// `count` `(scan, start)` pairs drawn uniformly: a scan with replacement, then a
/// start at which the whole patch fits inside that scan.
pub fn random_candidates<R: Rng + ?Sized>(
    scans: &Skyscraper,
    count: usize,
    patch: Shape3,
    rng: &mut R,
) -> Result<Vec<(usize, Voxel3)>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if scans.is_empty() {
        return Err(BatchError::invalid("cannot sample patches from an empty batch"));
    }
    (0..count)
        .map(|_| {
            let position = rng.random_range(0..scans.len());
            let shape = scans.scan_shape(position)?;
            if (0..3).any(|axis| shape[axis] < patch[axis]) {
                return Err(BatchError::invalid(format!(
                    "scan {position} of shape {shape:?} is smaller than patch {patch:?}"
                )));
            }
            // Inclusive upper end: a patch may sit flush with the far edge.
            let start: Voxel3 =
                std::array::from_fn(|axis| rng.random_range(0..=shape[axis] - patch[axis]) as i64);
            Ok((position, geometry::to_skyscraper_coords(start, scans.bias(position))))
        })
        .collect()
}

/// Number of positive patches in a batch of `batch_size`.
pub fn positive_count(share: f64, batch_size: usize, nodules: usize) -> Result<usize> {
    if !(0.0..=1.0).contains(&share) {
        return Err(BatchError::invalid(format!(
            "positive share must be within [0, 1], got {share}"
        )));
    }
    let wanted = (share * batch_size as f64).round_ties_even() as usize;
    Ok(wanted.min(nodules))
}

/// Picks positives without replacement from the nodule table and fills the rest
/// of the batch with random patches.
pub fn plan_sample<R: Rng + ?Sized>(
    scans: &Skyscraper,
    nodules: &NoduleTable,
    batch_size: usize,
    patch: Shape3,
    share: f64,
    rng: &mut R,
) -> Result<SamplePlan> {
    validate_patch(patch)?;
    nodules.check_consistent(scans)?;
    let positives = positive_count(share, batch_size, nodules.len())?;

    let mut candidates = positive_candidates(nodules, patch);
    if candidates.len() > positives {
        candidates.shuffle(rng);
        candidates.truncate(positives);
    }
    candidates.extend(random_candidates(scans, batch_size - positives, patch, rng)?);
    let (scans, starts) = candidates.into_iter().unzip();
    Ok(SamplePlan {
        scans,
        starts,
        positives,
    })
}

/// Cuts one `patch`-sized block per start and stacks them along z.
///
/// Block `i` is read from scan `scans[i]` only; voxels of the window that fall
/// outside that scan come back as zero.
pub fn extract_patches(
    buffer: &Skyscraper,
    scans: &[usize],
    starts: &[Voxel3],
    patch: Shape3,
) -> Result<Array3<f32>> {
    validate_patch(patch)?;
    if scans.len() != starts.len() {
        return Err(BatchError::invalid(format!(
            "{} owning scans for {} patch starts",
            scans.len(),
            starts.len()
        )));
    }
    let (_, height, width) = buffer.dim();
    let windows = scans
        .iter()
        .zip(starts)
        .map(|(&scan, start)| {
            let range = buffer.range(scan)?;
            let lo = [range.start as i64, 0, 0];
            let hi = [range.end as i64, height as i64, width as i64];
            Ok(PatchWindow::new(*start, as_voxel(patch), lo, hi))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = Array3::<f32>::zeros((starts.len() * patch[0], patch[1], patch[2]));
    let source = buffer.data();
    out.axis_chunks_iter_mut(Axis(0), patch[0])
        .into_par_iter()
        .zip(windows.par_iter())
        .for_each(|(mut block, window)| {
            if let Some((src, dst)) = window.copy_ranges() {
                block
                    .slice_mut(s![dst[0].clone(), dst[1].clone(), dst[2].clone()])
                    .assign(&source.slice(s![src[0].clone(), src[1].clone(), src[2].clone()]));
            }
        });
    Ok(out)
}

/// Intersection of one patch with the scan it is read from.
struct PatchWindow {
    start: Voxel3,
    lo: Voxel3,
    hi: Voxel3,
}

impl PatchWindow {
    fn new(start: Voxel3, size: Voxel3, scan_lo: Voxel3, scan_hi: Voxel3) -> Self {
        Self {
            start,
            lo: std::array::from_fn(|axis| start[axis].max(scan_lo[axis])),
            hi: std::array::from_fn(|axis| (start[axis] + size[axis]).min(scan_hi[axis])),
        }
    }

    /// Source ranges in the buffer and destination ranges in the patch block.
    fn copy_ranges(&self) -> Option<([std::ops::Range<usize>; 3], [std::ops::Range<usize>; 3])> {
        if (0..3).any(|axis| self.lo[axis] >= self.hi[axis]) {
            return None;
        }
        let src = std::array::from_fn(|axis| self.lo[axis] as usize..self.hi[axis] as usize);
        let dst = std::array::from_fn(|axis| {
            (self.lo[axis] - self.start[axis]) as usize..(self.hi[axis] - self.start[axis]) as usize
        });
        Some((src, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodules::NoduleRecord;
    use ndarray::Array;
    use rand::{SeedableRng, rngs::StdRng};

    /// Every voxel encodes its own global coordinate.
    fn coded(depths: &[usize], height: usize, width: usize) -> Skyscraper {
        let total: usize = depths.iter().sum();
        let data = Array::from_shape_fn((total, height, width), |(z, y, x)| {
            (z * 10_000 + y * 100 + x) as f32
        });
        let mut bounds = vec![0];
        for depth in depths {
            bounds.push(bounds[bounds.len() - 1] + depth);
        }
        Skyscraper::new(data, bounds).unwrap()
    }

    fn nodule(scan: usize, center: [f64; 3], img_size: Shape3, bias: usize) -> NoduleRecord {
        NoduleRecord {
            scan,
            center,
            diameter: 10.0,
            origin: [0.0; 3],
            spacing: [1.0; 3],
            img_size,
            bias,
        }
    }

    #[test]
    fn positive_start_for_centred_nodule() {
        let table = NoduleTable::new(vec![nodule(0, [50.0, 25.0, 25.0], [100, 50, 50], 0)]);
        assert_eq!(positive_candidates(&table, [10, 10, 10]), vec![(0, [45, 20, 20])]);
    }

    #[test]
    fn positive_start_carries_bias_and_clamps() {
        let table = NoduleTable::new(vec![nodule(1, [99.0, 0.0, 49.0], [100, 50, 50], 30)]);
        assert_eq!(positive_candidates(&table, [10, 10, 10]), vec![(1, [120, 0, 40])]);
    }

    #[test]
    fn random_starts_stay_inside_their_scan() {
        let stack = coded(&[12, 7, 20], 9, 9);
        let mut rng = StdRng::seed_from_u64(3);
        let starts = random_candidates(&stack, 200, [5, 4, 9], &mut rng).unwrap();
        assert_eq!(starts.len(), 200);
        for (scan, start) in starts {
            let range = stack.range(scan).unwrap();
            assert!(start[0] as usize >= range.start, "{start:?}");
            assert!(start[0] as usize + 5 <= range.end, "{start:?}");
            assert!(start[1] >= 0 && start[1] + 4 <= 9);
            assert_eq!(start[2], 0);
        }
    }

    #[test]
    fn random_candidates_refuse_small_scans() {
        let stack = coded(&[3], 9, 9);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(random_candidates(&stack, 1, [4, 4, 4], &mut rng).is_err());
    }

    #[test]
    fn share_is_capped_by_nodule_count() {
        assert_eq!(positive_count(0.8, 10, 2).unwrap(), 2);
        assert_eq!(positive_count(0.8, 10, 20).unwrap(), 8);
        assert_eq!(positive_count(0.25, 10, 20).unwrap(), 2);
        assert!(positive_count(1.5, 10, 2).is_err());
    }

    #[test]
    fn plan_puts_positives_first() {
        let stack = coded(&[20, 20], 8, 8);
        let table = NoduleTable::new(vec![
            nodule(0, [10.0, 4.0, 4.0], [20, 8, 8], 0),
            nodule(1, [10.0, 4.0, 4.0], [20, 8, 8], 20),
        ]);
        let mut rng = StdRng::seed_from_u64(11);
        let plan = plan_sample(&stack, &table, 10, [4, 4, 4], 0.8, &mut rng).unwrap();
        assert_eq!(plan.positives, 2);
        assert_eq!(plan.starts.len(), 10);
        assert_eq!(plan.scans.len(), 10);
        let mut positives: Vec<_> = plan.scans[..2]
            .iter()
            .copied()
            .zip(plan.starts[..2].iter().copied())
            .collect();
        positives.sort();
        assert_eq!(positives, vec![(0, [8, 2, 2]), (1, [28, 2, 2])]);
    }

    #[test]
    fn plan_refuses_a_table_built_for_other_geometry() {
        let stack = coded(&[20, 20], 8, 8);
        let table = NoduleTable::new(vec![nodule(1, [10.0, 4.0, 4.0], [20, 8, 8], 5)]);
        let mut rng = StdRng::seed_from_u64(2);
        assert!(matches!(
            plan_sample(&stack, &table, 4, [4, 4, 4], 0.5, &mut rng),
            Err(BatchError::StaleNodules(_))
        ));
    }

    #[test]
    fn extracted_blocks_start_where_requested() {
        let stack = coded(&[10, 6], 5, 5);
        let starts = vec![[2, 1, 0], [10, 0, 1], [12, 1, 1]];
        let out = extract_patches(&stack, &[0, 1, 1], &starts, [4, 3, 3]).unwrap();
        assert_eq!(out.dim(), (12, 3, 3));
        for (block, start) in out.axis_chunks_iter(Axis(0), 4).zip(&starts) {
            let expected = (start[0] * 10_000 + start[1] * 100 + start[2]) as f32;
            assert_eq!(block[[0, 0, 0]], expected);
            assert_eq!(block[[1, 2, 2]], expected + 10_000.0 + 202.0);
        }
    }

    #[test]
    fn patch_never_reads_into_the_next_scan() {
        let stack = coded(&[3, 10], 4, 4);
        let out = extract_patches(&stack, &[0], &[[0, 0, 0]], [5, 4, 4]).unwrap();
        assert_eq!(out[[2, 1, 1]], (2 * 10_000 + 101) as f32);
        assert!(out.slice(s![3.., .., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn zero_depth_scan_yields_a_zero_patch() {
        // Scan 0 is empty, so its start coincides with the first slice of scan 1.
        let stack = coded(&[0, 8], 4, 4);
        let out = extract_patches(&stack, &[0, 1], &[[0, 0, 0], [0, 0, 0]], [2, 2, 2]).unwrap();
        assert!(out.slice(s![..2, .., ..]).iter().all(|&v| v == 0.0));
        assert_eq!(out[[3, 1, 1]], (10_000 + 101) as f32);
    }

    #[test]
    fn mismatched_or_unknown_scans_are_rejected() {
        let stack = coded(&[3], 4, 4);
        assert!(matches!(
            extract_patches(&stack, &[0, 0], &[[0, 0, 0]], [1, 1, 1]),
            Err(BatchError::InvalidArgument(_))
        ));
        assert!(extract_patches(&stack, &[1], &[[0, 0, 0]], [1, 1, 1]).is_err());
    }

    #[test]
    fn start_past_its_scan_gives_zeros() {
        let stack = coded(&[3, 3], 4, 4);
        let out = extract_patches(&stack, &[0], &[[3, 0, 0]], [1, 1, 1]).unwrap();
        assert_eq!(out[[0, 0, 0]], 0.0);
    }

    #[test]
    fn no_starts_give_an_empty_stack() {
        let stack = coded(&[4], 4, 4);
        let out = extract_patches(&stack, &[], &[], [2, 2, 2]).unwrap();
        assert_eq!(out.dim(), (0, 2, 2));
    }
}
