//! Batches of masked CT scans.

use std::path::PathBuf;

use ndarray::{Array3, ArrayView2, ArrayView3, s};
use rand::Rng;
use web_time::Instant;

use crate::blob::{BlobStore, encode_volume};
use crate::dispatch::Dispatcher;
use crate::enums::{BlobPrecision, DumpTarget, LoadFormat};
use crate::error::{BatchError, Result};
use crate::geometry::{Shape3, Vec3, rescale_spacing};
use crate::index::ScanIndex;
use crate::interpolator;
use crate::mask;
use crate::nodules::{Annotation, NoduleTable};
use crate::sampler::{self, SamplePlan};
use crate::skyscraper::Skyscraper;
use crate::volume::ScanVolume;
use crate::volume_loader::VolumeSource;

/// Addresses one scan of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanRef<'a> {
    Position(i64),
    Id(&'a str),
}

impl From<usize> for ScanRef<'_> {
    fn from(position: usize) -> Self {
        ScanRef::Position(position as i64)
    }
}

impl From<i64> for ScanRef<'_> {
    fn from(position: i64) -> Self {
        ScanRef::Position(position)
    }
}

impl<'a> From<&'a str> for ScanRef<'a> {
    fn from(id: &'a str) -> Self {
        ScanRef::Id(id)
    }
}

/// Everything needed to build a batch from arrays that already exist.
#[derive(Clone, Debug, Default)]
pub struct ArrayParts {
    pub data: Array3<f32>,
    pub bounds: Vec<usize>,
    /// Zeros when absent.
    pub mask: Option<Array3<f32>>,
    pub origin: Option<Vec<Vec3>>,
    pub spacing: Option<Vec<Vec3>>,
    pub nodules: Option<NoduleTable>,
}

pub enum LoadSource<'a> {
    Raw(&'a dyn VolumeSource),
    Array(ArrayParts),
}

impl LoadSource<'_> {
    pub fn format(&self) -> LoadFormat {
        match self {
            LoadSource::Raw(_) => LoadFormat::Raw,
            LoadSource::Array(_) => LoadFormat::Array,
        }
    }
}

/// Scans stacked into one skyscraper, a mask with the same bounds, per-scan
/// geometry and, once fetched, the nodules that fall in these scans.
pub struct CtMaskedBatch {
    index: ScanIndex,
    images: Skyscraper,
    mask: Skyscraper,
    origin: Option<Vec<Vec3>>,
    spacing: Option<Vec<Vec3>>,
    nodules: Option<NoduleTable>,
    dispatcher: Dispatcher,
}

impl CtMaskedBatch {
    /// Builds a batch in the named load mode (`"raw"` or `"ndarray"`).
    pub fn load(
        index: ScanIndex,
        mode: &str,
        source: LoadSource<'_>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let format: LoadFormat = mode.parse()?;
        if format != source.format() {
            return Err(BatchError::invalid(format!(
                "load mode {format:?} does not match a {:?} source",
                source.format()
            )));
        }
        match source {
            LoadSource::Raw(volumes) => Self::from_raw(index, volumes, dispatcher),
            LoadSource::Array(parts) => Self::from_array(index, parts, dispatcher),
        }
    }

    /// Reads every scan through `source`, one task per scan, and allocates an
    /// empty mask.
    pub fn from_raw(
        index: ScanIndex,
        source: &dyn VolumeSource,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let started = Instant::now();
        let items: Vec<(usize, &str)> = index
            .ids()
            .iter()
            .enumerate()
            .map(|(position, id)| (position, id.as_str()))
            .collect();
        let volumes: Vec<ScanVolume> = dispatcher.run_all("load", &index, items, |_, id| {
            let volume = source.read_volume(id, index.path(id)?)?;
            log::debug!("Loaded {id} with shape {:?}", volume.dim());
            Ok(volume)
        })?;

        let views: Vec<ArrayView3<'_, f32>> = volumes.iter().map(|v| v.data.view()).collect();
        let images = Skyscraper::from_scans(&views)?;
        let origin = volumes.iter().map(|v| v.origin).collect();
        let spacing = volumes.iter().map(|v| v.spacing).collect();
        let mask = images.zeros_like();
        log::info!(
            "Loaded {} scans into a {:?} skyscraper in {:?}",
            index.len(),
            images.dim(),
            started.elapsed()
        );
        Ok(Self {
            index,
            images,
            mask,
            origin: Some(origin),
            spacing: Some(spacing),
            nodules: None,
            dispatcher,
        })
    }

    /// Wraps prebuilt arrays. Every part must agree with `bounds`.
    pub fn from_array(index: ScanIndex, parts: ArrayParts, dispatcher: Dispatcher) -> Result<Self> {
        let images = Skyscraper::new(parts.data, parts.bounds)?;
        if images.len() != index.len() {
            return Err(BatchError::invalid(format!(
                "bounds describe {} scans but the index holds {}",
                images.len(),
                index.len()
            )));
        }
        let mask = match parts.mask {
            Some(mask) if mask.dim() != images.dim() => {
                return Err(BatchError::invalid(format!(
                    "mask shape {:?} differs from data shape {:?}",
                    mask.dim(),
                    images.dim()
                )));
            }
            Some(mask) => Skyscraper::new(mask, images.bounds().to_vec())?,
            None => images.zeros_like(),
        };
        for (name, rows) in [("origin", &parts.origin), ("spacing", &parts.spacing)] {
            if let Some(rows) = rows {
                if rows.len() != index.len() {
                    return Err(BatchError::invalid(format!(
                        "{name} has {} rows for {} scans",
                        rows.len(),
                        index.len()
                    )));
                }
            }
        }
        if let Some(nodules) = &parts.nodules {
            nodules.check_consistent(&images)?;
        }
        Ok(Self {
            index,
            images,
            mask,
            origin: parts.origin,
            spacing: parts.spacing,
            nodules: parts.nodules,
            dispatcher,
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &ScanIndex {
        &self.index
    }

    pub fn images(&self) -> &Skyscraper {
        &self.images
    }

    pub fn masks(&self) -> &Skyscraper {
        &self.mask
    }

    pub fn bounds(&self) -> &[usize] {
        self.images.bounds()
    }

    pub fn origin(&self) -> Option<&[Vec3]> {
        self.origin.as_deref()
    }

    pub fn spacing(&self) -> Option<&[Vec3]> {
        self.spacing.as_deref()
    }

    pub fn nodules(&self) -> Option<&NoduleTable> {
        self.nodules.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn resolve(&self, scan: ScanRef<'_>) -> Result<usize> {
        match scan {
            ScanRef::Position(position) => usize::try_from(position)
                .ok()
                .filter(|&p| p < self.len())
                .ok_or_else(|| BatchError::OutOfRange(position.to_string())),
            ScanRef::Id(id) => self.index.position(id),
        }
    }

    /// View on one scan's voxels.
    pub fn get_scan<'a>(&self, scan: impl Into<ScanRef<'a>>) -> Result<ArrayView3<'_, f32>> {
        let position = self.resolve(scan.into())?;
        self.images.scan(position)
    }

    /// View on one scan's mask.
    pub fn get_mask<'a>(&self, scan: impl Into<ScanRef<'a>>) -> Result<ArrayView3<'_, f32>> {
        let position = self.resolve(scan.into())?;
        self.mask.scan(position)
    }

    /// Data and mask slices at `height` (a fraction of the scan's depth).
    pub fn axial_slice(
        &self,
        position: usize,
        height: f64,
    ) -> Result<(ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        if !(0.0..1.0).contains(&height) {
            return Err(BatchError::invalid(format!(
                "slice height must be within [0, 1), got {height}"
            )));
        }
        let scan = self.images.scan(position)?;
        let depth = scan.dim().0;
        if depth == 0 {
            return Err(BatchError::invalid(format!("scan {position} is empty")));
        }
        let z = (height * depth as f64) as usize;
        let mask = self.mask.scan(position)?;
        Ok((scan.slice_move(s![z, .., ..]), mask.slice_move(s![z, .., ..])))
    }

    /// Joins `annotations` against this batch. Keeps an existing table unless
    /// `update` is set.
    pub fn fetch_nodules(&mut self, annotations: &[Annotation], update: bool) -> Result<()> {
        if self.nodules.is_some() && !update {
            return Ok(());
        }
        let (Some(origin), Some(spacing)) = (&self.origin, &self.spacing) else {
            return Err(BatchError::invalid(
                "batch carries no origin/spacing to place nodules with",
            ));
        };
        let table = NoduleTable::build(annotations, &self.index, &self.images, origin, spacing)?;
        log::info!("Fetched {} nodules for {} scans", table.len(), self.len());
        self.nodules = Some(table);
        Ok(())
    }

    /// Marks every nodule's voxel box in the mask.
    pub fn create_mask(&mut self) -> Result<()> {
        let nodules = self.nodules.as_ref().ok_or(BatchError::MissingNodules)?;
        mask::build_mask(&mut self.mask, nodules)
    }

    /// [`create_mask`](Self::create_mask) with one worker task per scan.
    pub fn create_mask_parallel(&mut self) -> Result<()> {
        let nodules = self.nodules.as_ref().ok_or(BatchError::MissingNodules)?;
        mask::build_mask_parallel(&mut self.mask, nodules, &self.index, &self.dispatcher)
    }

    /// Resamples every scan to `shape` (z, y, x) with a spline of `order`.
    ///
    /// Spacing follows the new grid, the nodule table is rescaled and the mask is
    /// rebuilt from it. If any scan fails the batch is left as it was.
    pub fn resize(&mut self, shape: Option<Shape3>, order: usize) -> Result<()> {
        let shape = shape.ok_or(BatchError::MissingShape)?;
        interpolator::validate(shape, order)?;
        if self.nodules.is_some() && self.spacing.is_none() {
            return Err(BatchError::invalid(
                "nodule table present on a batch without spacing",
            ));
        }
        let started = Instant::now();

        let items: Vec<(usize, ArrayView3<'_, f32>)> =
            self.images.scans().into_iter().enumerate().collect();
        let resized = self.dispatcher.run_all("resize", &self.index, items, |_, scan| {
            interpolator::zoom(scan, shape, order)
        })?;
        let views: Vec<ArrayView3<'_, f32>> = resized.iter().map(|scan| scan.view()).collect();
        let images = Skyscraper::from_scans(&views)?;

        let spacing = self
            .spacing
            .as_ref()
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(position, row)| {
                        Ok(rescale_spacing(*row, self.images.scan_shape(position)?, shape))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let nodules = self
            .nodules
            .clone()
            .zip(spacing.as_deref())
            .map(|(mut table, spacing)| {
                table.rescale(spacing, shape);
                table
            });

        self.mask = images.zeros_like();
        self.images = images;
        self.spacing = spacing;
        self.nodules = nodules;
        log::info!(
            "Resized {} scans to {shape:?} (order {order}) in {:?}",
            self.len(),
            started.elapsed()
        );

        if self.nodules.is_some() {
            self.create_mask_parallel()?;
        }
        Ok(())
    }

    /// Picks where the patches of a training batch start.
    pub fn sample_plan<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        patch: Shape3,
        share: f64,
        rng: &mut R,
    ) -> Result<SamplePlan> {
        let nodules = self.nodules.as_ref().ok_or(BatchError::MissingNodules)?;
        sampler::plan_sample(&self.images, nodules, batch_size, patch, share, rng)
    }

    /// Cuts the planned patches out of data and mask into a new batch with fresh
    /// identifiers and no geometry.
    pub fn extract<R: Rng + ?Sized>(
        &self,
        plan: &SamplePlan,
        patch: Shape3,
        rng: &mut R,
    ) -> Result<CtMaskedBatch> {
        let (data, mask) = self.dispatcher.install(|| {
            Ok::<_, BatchError>((
                sampler::extract_patches(&self.images, &plan.scans, &plan.starts, patch)?,
                sampler::extract_patches(&self.mask, &plan.scans, &plan.starts, patch)?,
            ))
        })?;
        let images = Skyscraper::uniform(data, patch[0])?;
        let mask = Skyscraper::uniform(mask, patch[0])?;
        Ok(CtMaskedBatch {
            index: ScanIndex::random(plan.starts.len(), rng),
            images,
            mask,
            origin: None,
            spacing: None,
            nodules: None,
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// Samples `batch_size` patches, `share` of them centred on nodules where
    /// there are enough nodules, the rest at random.
    pub fn sample_nodules<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        patch: Shape3,
        share: f64,
        rng: &mut R,
    ) -> Result<CtMaskedBatch> {
        let plan = self.sample_plan(batch_size, patch, share, rng)?;
        let patches = self.extract(&plan, patch, rng)?;
        log::info!(
            "Sampled {} patches of {patch:?} ({} on nodules)",
            plan.starts.len(),
            plan.positives
        );
        Ok(patches)
    }

    /// Writes every scan's data and/or mask as one blob per scan. `which[i]` goes
    /// to `dst[i]`.
    pub fn dump(
        &self,
        which: &[DumpTarget],
        dst: &[PathBuf],
        store: &dyn BlobStore,
        precision: BlobPrecision,
    ) -> Result<()> {
        if which.len() != dst.len() {
            return Err(BatchError::invalid(format!(
                "{} dump targets for {} destinations",
                which.len(),
                dst.len()
            )));
        }
        if which.is_empty() {
            return Err(BatchError::invalid("nothing to dump"));
        }
        let started = Instant::now();
        let items: Vec<(usize, &str)> = self
            .index
            .ids()
            .iter()
            .enumerate()
            .map(|(position, id)| (position, id.as_str()))
            .collect();
        self.dispatcher.run_all("dump", &self.index, items, |position, id| {
            for (target, dir) in which.iter().zip(dst) {
                let volume = match target {
                    DumpTarget::Data => self.images.scan(position)?,
                    DumpTarget::Mask => self.mask.scan(position)?,
                };
                let bytes = encode_volume(volume, precision)?;
                store.store(&bytes, id, dir)?;
            }
            Ok(())
        })?;
        log::info!("Dumped {} scans in {:?}", self.len(), started.elapsed());
        Ok(())
    }
}
