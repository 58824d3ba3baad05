//! # CT-batch library
//!
//! This crate prepares batches of CT scans for training nodule detectors.
//! A batch keeps all of its scans in one contiguous `(ΣZ, Y, X)` array, the
//! *skyscraper*, together with the z-boundaries of every scan, a mask buffer
//! with the same layout and the world geometry (origin, spacing) of each scan.
//!
//! Scans are loaded from MetaImage (`.mhd` + `.raw`) files or from folders of
//! DICOM slices. Per-scan work (loading, resampling, mask rasterisation and
//! dumping) runs on a rayon pool, one task per scan, and failures are reported
//! per scan without disturbing the others. The batch supports:
//!  - Joining LUNA16-style nodule annotations against its scans
//!  - Rasterising nodules into a binary mask
//!  - Resampling every scan to a common shape with B-splines of order 0 to 5
//!  - Sampling fixed-size patches, a share of them centred on nodules
//!  - Dumping scans and masks as compressed per-scan blobs
//!
//!  Scans are expected to share their in-plane (y, x) extent; only the number of
//!  slices may differ between scans of one batch.
//!
//! # Examples
//!
//! ## Loading scans, masking nodules and sampling patches
//!
//! ```no_run
//! # use ct_batch::{CtMaskedBatch, Dispatcher, LoadSource, MetaImageSource, ScanIndex};
//! # use ct_batch::nodules::read_annotations;
//! # use rand::SeedableRng;
//! let index = ScanIndex::from_directory("luna/subset0", Some("mhd"))
//!     .expect("should have listed the scans");
//! let mut batch = CtMaskedBatch::load(
//!     index,
//!     "raw",
//!     LoadSource::Raw(&MetaImageSource),
//!     Dispatcher::default(),
//! )
//! .expect("should have loaded every scan");
//! let rows = read_annotations("luna/annotations.csv").expect("should have read annotations");
//! batch.fetch_nodules(&rows, false).expect("should have joined annotations");
//! batch.create_mask().expect("should have built the mask");
//! batch.resize(Some([128, 256, 256]), 3).expect("should have resized every scan");
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let patches = batch
//!     .sample_nodules(20, [32, 64, 64], 0.8, &mut rng)
//!     .expect("should have sampled patches");
//! assert_eq!(patches.len(), 20);
//! ```

pub mod batch;
pub mod blob;
pub mod config;
pub mod dispatch;
pub mod enums;
pub mod error;
pub mod geometry;
pub mod index;
pub mod interpolator;
pub mod mask;
pub mod nodules;
pub mod pipeline;
pub mod sampler;
pub mod skyscraper;
pub mod volume;
pub mod volume_loader;

pub use batch::{ArrayParts, CtMaskedBatch, LoadSource, ScanRef};
pub use dispatch::Dispatcher;
pub use error::{BatchError, Result};
pub use index::ScanIndex;
pub use skyscraper::Skyscraper;
pub use volume::ScanVolume;
pub use volume_loader::{DicomSeriesSource, InMemorySource, MetaImageSource, VolumeSource};
