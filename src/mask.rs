//! Rasterising nodules into a mask that shares the skyscraper's bounds.

use ndarray::{ArrayViewMut3, s};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::geometry::Voxel3;
use crate::index::ScanIndex;
use crate::nodules::{NoduleRecord, NoduleTable};
use crate::skyscraper::Skyscraper;

/// Sets the box `[start, start + size)` of one scan's mask to 1, cut to the scan.
pub fn fill_box(mut mask: ArrayViewMut3<'_, f32>, start: Voxel3, size: Voxel3) {
    let (depth, height, width) = mask.dim();
    let extent = [depth as i64, height as i64, width as i64];
    let lo: [usize; 3] = std::array::from_fn(|axis| start[axis].clamp(0, extent[axis]) as usize);
    let hi: [usize; 3] =
        std::array::from_fn(|axis| (start[axis] + size[axis]).clamp(0, extent[axis]) as usize);
    if (0..3).any(|axis| lo[axis] >= hi[axis]) {
        return;
    }
    mask.slice_mut(s![lo[0]..hi[0], lo[1]..hi[1], lo[2]..hi[2]])
        .fill(1.0);
}

/// Fills one scan's mask with the boxes of its nodules.
///
/// Every box is validated before anything is written, so a failing scan keeps
/// whatever its mask held before.
pub fn rasterize_scan(
    mut mask: ArrayViewMut3<'_, f32>,
    nodules: &[&NoduleRecord],
) -> Result<usize> {
    let boxes = nodules
        .iter()
        .map(|record| record.mask_box())
        .collect::<Result<Vec<_>>>()?;
    for (start, size) in &boxes {
        fill_box(mask.view_mut(), *start, *size);
    }
    Ok(boxes.len())
}

/// Sequential mask build over every scan that owns a nodule.
pub fn build_mask(mask: &mut Skyscraper, nodules: &NoduleTable) -> Result<()> {
    nodules.check_consistent(mask)?;
    let groups = nodules.groups();
    let mut views = mask.scans_mut();
    for (scan, members) in groups {
        rasterize_scan(views[scan].view_mut(), &members)?;
    }
    Ok(())
}

/// Parallel mask build, one task per scan that owns a nodule.
///
/// Each task gets a disjoint mutable view of its own scan; a failing scan never
/// touches another scan's voxels. Failures come back as one `PartialFailure`.
pub fn build_mask_parallel(
    mask: &mut Skyscraper,
    nodules: &NoduleTable,
    index: &ScanIndex,
    dispatcher: &Dispatcher,
) -> Result<()> {
    nodules.check_consistent(mask)?;
    let groups = nodules.groups();
    let mut views: Vec<Option<ArrayViewMut3<'_, f32>>> =
        mask.scans_mut().into_iter().map(Some).collect();
    let items: Vec<_> = groups
        .into_iter()
        .filter_map(|(scan, members)| views[scan].take().map(|view| (scan, (view, members))))
        .collect();
    dispatcher
        .run_all("mask", index, items, |_, (view, members)| {
            rasterize_scan(view, &members)
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::PoolKind;
    use crate::error::BatchError;
    use ndarray::Array3;

    fn record(scan: usize, center: [f64; 3], diameter: f64, bias: usize) -> NoduleRecord {
        NoduleRecord {
            scan,
            center,
            diameter,
            origin: [0.0; 3],
            spacing: [1.0; 3],
            img_size: [20, 16, 16],
            bias,
        }
    }

    fn empty_mask(scans: usize) -> Skyscraper {
        let bounds = (0..=scans).map(|i| i * 20).collect();
        Skyscraper::new(Array3::zeros((scans * 20, 16, 16)), bounds).unwrap()
    }

    #[test]
    fn box_is_cut_to_the_scan() {
        let mut mask = Array3::<f32>::zeros((4, 4, 4));
        fill_box(mask.view_mut(), [-1, 2, 3], [3, 5, 2]);
        assert_eq!(mask.sum(), 2.0 * 2.0 * 1.0);
        assert_eq!(mask[[1, 3, 3]], 1.0);
        assert_eq!(mask[[2, 3, 3]], 0.0);
    }

    #[test]
    fn nodules_are_unioned_and_rebuild_is_idempotent() {
        let table = NoduleTable::new(vec![
            record(0, [10.0, 8.0, 8.0], 4.0, 0),
            record(0, [11.0, 8.0, 8.0], 4.0, 0),
            record(1, [5.0, 5.0, 5.0], 2.0, 20),
        ]);
        let mut mask = empty_mask(2);
        build_mask(&mut mask, &table).unwrap();
        let first = mask.clone();

        // Box of the first nodule: start 10 - 2 = 8, size 4; second: 9..13.
        let scan0 = mask.scan(0).unwrap();
        assert_eq!(scan0.slice(s![8..13, 6..10, 6..10]).sum(), 5.0 * 16.0);
        assert_eq!(scan0.sum(), 5.0 * 16.0);
        assert_eq!(mask.scan(1).unwrap().sum(), 8.0);

        build_mask(&mut mask, &table).unwrap();
        assert_eq!(mask, first);
    }

    #[test]
    fn parallel_build_matches_sequential() {
        let table = NoduleTable::new(vec![
            record(0, [3.0, 3.0, 3.0], 4.0, 0),
            record(2, [19.0, 15.0, 15.0], 6.0, 40),
            record(3, [10.0, 8.0, 8.0], 3.0, 60),
        ]);
        let mut sequential = empty_mask(4);
        build_mask(&mut sequential, &table).unwrap();

        let index = ScanIndex::new(["a", "b", "c", "d"]).unwrap();
        let dispatcher = Dispatcher::new(PoolKind::Threads(3)).unwrap();
        let mut parallel = empty_mask(4);
        build_mask_parallel(&mut parallel, &table, &index, &dispatcher).unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.scan(1).unwrap().sum(), 0.0);
    }

    #[test]
    fn failing_scan_leaves_others_populated() {
        let mut broken = record(2, [10.0, 8.0, 8.0], 4.0, 40);
        broken.spacing = [0.0, 1.0, 1.0];
        let table = NoduleTable::new(vec![
            record(0, [10.0, 8.0, 8.0], 4.0, 0),
            record(1, [10.0, 8.0, 8.0], 4.0, 20),
            broken,
            record(3, [10.0, 8.0, 8.0], 4.0, 60),
        ]);
        let index = ScanIndex::new(["a", "b", "c", "d"]).unwrap();
        let dispatcher = Dispatcher::new(PoolKind::Threads(4)).unwrap();
        let mut mask = empty_mask(4);

        let err = build_mask_parallel(&mut mask, &table, &index, &dispatcher).unwrap_err();
        assert!(matches!(err, BatchError::PartialFailure { .. }));
        assert_eq!(err.failed_positions(), vec![2]);
        for scan in [0, 1, 3] {
            assert_eq!(mask.scan(scan).unwrap().sum(), 64.0, "scan {scan}");
        }
        assert_eq!(mask.scan(2).unwrap().sum(), 0.0);
        assert_eq!(mask.bounds(), &[0, 20, 40, 60, 80]);
    }

    #[test]
    fn stale_table_is_refused() {
        let table = NoduleTable::new(vec![record(1, [5.0; 3], 2.0, 7)]);
        let mut mask = empty_mask(2);
        assert!(matches!(
            build_mask(&mut mask, &table),
            Err(BatchError::StaleNodules(_))
        ));
    }
}
