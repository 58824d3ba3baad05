//! Many scans stacked along z in one contiguous array.

use std::ops::Range;

use ndarray::{Array3, ArrayView3, ArrayViewMut3, Axis, concatenate, s};

use crate::error::{BatchError, Result};
use crate::geometry::Shape3;

/// A flat `(ΣZ, Y, X)` array plus the boundary index of its scans.
///
/// `bounds` has one more entry than there are scans: it starts at 0, never
/// decreases and ends at the array depth. Scan `p` is `data[bounds[p]..bounds[p + 1]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Skyscraper {
    data: Array3<f32>,
    bounds: Vec<usize>,
}

impl Default for Skyscraper {
    fn default() -> Self {
        Self {
            data: Array3::zeros((0, 0, 0)),
            bounds: vec![0],
        }
    }
}

impl Skyscraper {
    pub fn new(data: Array3<f32>, bounds: Vec<usize>) -> Result<Self> {
        validate_bounds(&bounds, data.dim().0)?;
        Ok(Self { data, bounds })
    }

    /// Stacks scans in order. All of them must share the y, x extent.
    pub fn from_scans(scans: &[ArrayView3<'_, f32>]) -> Result<Self> {
        let Some(first) = scans.first() else {
            return Ok(Self::default());
        };
        let (_, height, width) = first.dim();
        if let Some(position) = scans
            .iter()
            .position(|scan| scan.dim().1 != height || scan.dim().2 != width)
        {
            return Err(BatchError::invalid(format!(
                "scan {position} has y, x extent {:?}, expected ({height}, {width})",
                (scans[position].dim().1, scans[position].dim().2)
            )));
        }

        let mut bounds = Vec::with_capacity(scans.len() + 1);
        bounds.push(0);
        for scan in scans {
            let last = bounds[bounds.len() - 1];
            bounds.push(last + scan.dim().0);
        }
        let data = concatenate(Axis(0), scans)
            .map_err(|err| BatchError::invalid(format!("cannot stack scans: {err}")))?;
        Ok(Self { data, bounds })
    }

    /// Splits `data` into consecutive blocks of `depth` slices.
    pub fn uniform(data: Array3<f32>, depth: usize) -> Result<Self> {
        let total = data.dim().0;
        if depth == 0 || total % depth != 0 {
            return Err(BatchError::invalid(format!(
                "depth {total} is not a multiple of block depth {depth}"
            )));
        }
        let bounds = (0..=total / depth).map(|i| i * depth).collect();
        Ok(Self { data, bounds })
    }

    /// Number of scans.
    pub fn len(&self) -> usize {
        self.bounds.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// (depth, height, width) of the whole stack.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// z-offset of the first slice of scan `position`.
    pub fn bias(&self, position: usize) -> usize {
        self.bounds[position]
    }

    pub fn range(&self, position: usize) -> Result<Range<usize>> {
        self.check_position(position)?;
        Ok(self.bounds[position]..self.bounds[position + 1])
    }

    pub fn scan_shape(&self, position: usize) -> Result<Shape3> {
        let range = self.range(position)?;
        let (_, height, width) = self.data.dim();
        Ok([range.len(), height, width])
    }

    pub fn scan(&self, position: usize) -> Result<ArrayView3<'_, f32>> {
        let range = self.range(position)?;
        Ok(self.data.slice(s![range, .., ..]))
    }

    /// Read-only views of every scan, in position order.
    pub fn scans(&self) -> Vec<ArrayView3<'_, f32>> {
        self.bounds
            .windows(2)
            .map(|w| self.data.slice(s![w[0]..w[1], .., ..]))
            .collect()
    }

    /// Disjoint mutable views of every scan, in position order.
    pub fn scans_mut(&mut self) -> Vec<ArrayViewMut3<'_, f32>> {
        split_scans_mut(&mut self.data, &self.bounds)
    }

    /// A zero-filled stack with the same shape and bounds.
    pub fn zeros_like(&self) -> Self {
        Self {
            data: Array3::zeros(self.data.raw_dim()),
            bounds: self.bounds.clone(),
        }
    }

    fn check_position(&self, position: usize) -> Result<()> {
        if position < self.len() {
            Ok(())
        } else {
            Err(BatchError::OutOfRange(position.to_string()))
        }
    }
}

/// Carves `data` into one mutable view per scan. The views never overlap, so
/// they can be handed to separate workers without locking.
fn split_scans_mut<'a>(
    data: &'a mut Array3<f32>,
    bounds: &[usize],
) -> Vec<ArrayViewMut3<'a, f32>> {
    let mut views = Vec::with_capacity(bounds.len().saturating_sub(1));
    let mut rest = data.view_mut();
    for w in bounds.windows(2) {
        let (head, tail) = rest.split_at(Axis(0), w[1] - w[0]);
        views.push(head);
        rest = tail;
    }
    views
}

fn validate_bounds(bounds: &[usize], depth: usize) -> Result<()> {
    match (bounds.first(), bounds.last()) {
        (Some(0), Some(&last)) if last == depth => {}
        _ => {
            return Err(BatchError::invalid(format!(
                "bounds must start at 0 and end at depth {depth}, got {bounds:?}"
            )));
        }
    }
    if bounds.windows(2).any(|w| w[0] > w[1]) {
        return Err(BatchError::invalid(format!(
            "bounds must be non-decreasing, got {bounds:?}"
        )));
    }
    Ok(())
}
