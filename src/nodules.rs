//! Annotated nodules joined against the scans of a batch.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};
use crate::geometry::{self, Shape3, Vec3, Voxel3};
use crate::index::ScanIndex;
use crate::skyscraper::Skyscraper;

/// One row of a LUNA16-style annotation table (world mm, x-y-z columns).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub seriesuid: String,
    #[serde(rename = "coordX")]
    pub coord_x: f64,
    #[serde(rename = "coordY")]
    pub coord_y: f64,
    #[serde(rename = "coordZ")]
    pub coord_z: f64,
    pub diameter_mm: f64,
}

impl Annotation {
    /// World centre in z-y-x order.
    pub fn center(&self) -> Vec3 {
        [self.coord_z, self.coord_y, self.coord_x]
    }
}

pub fn read_annotations(path: impl AsRef<Path>) -> Result<Vec<Annotation>> {
    let file = std::fs::File::open(path.as_ref())?;
    read_annotations_from(file)
}

pub fn read_annotations_from<R: Read>(reader: R) -> Result<Vec<Annotation>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for result in csv_reader.deserialize() {
        let row: Annotation = result?;
        rows.push(row);
    }
    Ok(rows)
}

/// A nodule plus the geometry of its scan at the time the table was built.
#[derive(Clone, Debug, PartialEq)]
pub struct NoduleRecord {
    /// Position of the owning scan in the batch.
    pub scan: usize,
    pub center: Vec3,
    pub diameter: f64,
    pub origin: Vec3,
    pub spacing: Vec3,
    pub img_size: Shape3,
    /// z-offset of the owning scan in the skyscraper.
    pub bias: usize,
}

impl NoduleRecord {
    pub fn voxel_center(&self) -> Voxel3 {
        geometry::world_to_voxel(self.center, self.origin, self.spacing)
    }

    pub fn voxel_size(&self) -> Voxel3 {
        geometry::voxel_extent(self.diameter, self.spacing)
    }

    /// Scan-local first voxel of a `size` patch centred on the nodule, shifted
    /// inside the scan.
    pub fn clamped_start(&self, size: Voxel3) -> Voxel3 {
        let start = geometry::patch_start(self.voxel_center(), size);
        geometry::clamp_to_bounds(start, size, self.img_size)
    }

    fn check_geometry(&self) -> Result<()> {
        if !geometry::is_valid_geometry(self.spacing)
            || !self.diameter.is_finite()
            || self.center.iter().chain(&self.origin).any(|v| !v.is_finite())
        {
            return Err(BatchError::invalid(format!(
                "nodule in scan {} has degenerate geometry (center {:?}, origin {:?}, spacing {:?}, diameter {})",
                self.scan, self.center, self.origin, self.spacing, self.diameter
            )));
        }
        Ok(())
    }

    /// Scan-local voxel box `(start, size)` the nodule covers in a mask.
    pub fn mask_box(&self) -> Result<(Voxel3, Voxel3)> {
        self.check_geometry()?;
        let size = self.voxel_size();
        Ok((self.clamped_start(size), size))
    }
}

/// Nodules of a batch, ordered by owning scan position and then annotation order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoduleTable {
    records: Vec<NoduleRecord>,
}

impl NoduleTable {
    pub fn new(records: Vec<NoduleRecord>) -> Self {
        Self { records }
    }

    /// Joins annotation rows against the batch's scans. Rows for scans the batch
    /// does not hold are dropped.
    pub fn build(
        annotations: &[Annotation],
        index: &ScanIndex,
        scans: &Skyscraper,
        origin: &[Vec3],
        spacing: &[Vec3],
    ) -> Result<Self> {
        let mut records = Vec::new();
        let mut ignored = 0usize;
        for row in annotations {
            if !index.contains(&row.seriesuid) {
                ignored += 1;
                continue;
            }
            let scan = index.position(&row.seriesuid)?;
            records.push(NoduleRecord {
                scan,
                center: row.center(),
                diameter: row.diameter_mm,
                origin: origin[scan],
                spacing: spacing[scan],
                img_size: scans.scan_shape(scan)?,
                bias: scans.bias(scan),
            });
        }
        records.sort_by_key(|record| record.scan);
        if ignored > 0 {
            log::debug!("Ignored {ignored} annotations for scans outside the batch");
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[NoduleRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &NoduleRecord> {
        self.records.iter()
    }

    /// Nodules grouped by owning scan, groups in scan order. Scans without
    /// nodules are absent.
    pub fn groups(&self) -> Vec<(usize, Vec<&NoduleRecord>)> {
        let mut groups: Vec<(usize, Vec<&NoduleRecord>)> = Vec::new();
        for record in &self.records {
            match groups.last_mut() {
                Some((scan, members)) if *scan == record.scan => members.push(record),
                _ => groups.push((record.scan, vec![record])),
            }
        }
        groups
    }

    /// Rewrites the cached geometry of every record after the buffer was
    /// resampled to `new_shape` per scan.
    pub fn rescale(&mut self, spacing: &[Vec3], new_shape: Shape3) {
        for record in &mut self.records {
            record.spacing = spacing[record.scan];
            record.img_size = new_shape;
            record.bias = record.scan * new_shape[0];
        }
    }

    /// Errors unless every record agrees with the current scan boundaries.
    pub fn check_consistent(&self, scans: &Skyscraper) -> Result<()> {
        for record in &self.records {
            let shape = scans.scan_shape(record.scan).map_err(|_| {
                BatchError::StaleNodules(format!("scan {} no longer exists", record.scan))
            })?;
            if record.bias != scans.bias(record.scan) || record.img_size != shape {
                return Err(BatchError::StaleNodules(format!(
                    "scan {} cached bias {} and size {:?}, buffer has {} and {:?}",
                    record.scan,
                    record.bias,
                    record.img_size,
                    scans.bias(record.scan),
                    shape
                )));
            }
        }
        Ok(())
    }
}
