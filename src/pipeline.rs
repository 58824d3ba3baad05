//! One preprocessing run driven by a [`PipelineConfig`].

use rand::SeedableRng;
use rand::rngs::StdRng;
use web_time::Instant;

use crate::batch::{CtMaskedBatch, LoadSource};
use crate::blob::FsBlobStore;
use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::enums::{DumpTarget, SortBy, SourceKind};
use crate::error::Result;
use crate::index::ScanIndex;
use crate::nodules::read_annotations;
use crate::volume_loader::{DicomSeriesSource, MetaImageSource, VolumeSource};

/// What a run leaves behind in memory.
pub struct PipelineOutput {
    pub batch: CtMaskedBatch,
    pub patches: Option<CtMaskedBatch>,
}

/// Index, load, fetch nodules and mask, then optionally resize, dump and sample.
pub fn run(config: &PipelineConfig) -> Result<PipelineOutput> {
    let started = Instant::now();
    let dispatcher = Dispatcher::new(config.pool_kind())?;
    let index = ScanIndex::from_directory(&config.scans, config.scan_extension())?;
    log::info!(
        "Found {} scans in {} ({} workers)",
        index.len(),
        config.scans.display(),
        dispatcher.threads()
    );

    let source: Box<dyn VolumeSource> = match config.source {
        SourceKind::MetaImage => Box::new(MetaImageSource),
        SourceKind::Dicom => Box::new(DicomSeriesSource::new(SortBy::ImagePositionPatient)),
    };
    let mut batch =
        CtMaskedBatch::load(index, &config.format, LoadSource::Raw(source.as_ref()), dispatcher)?;

    if let Some(path) = &config.annotations {
        let rows = read_annotations(path)?;
        batch.fetch_nodules(&rows, false)?;
        batch.create_mask_parallel()?;
    }

    if let Some(resize) = &config.resize {
        batch.resize(Some(resize.shape), resize.order)?;
    }

    if !config.dump.is_empty() {
        let (targets, paths): (Vec<DumpTarget>, Vec<_>) = config
            .dump
            .iter()
            .map(|entry| (entry.target, entry.path.clone()))
            .unzip();
        batch.dump(&targets, &paths, &FsBlobStore, config.precision)?;
    }

    let patches = match &config.sample {
        Some(sample) => {
            let mut rng = match sample.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let patches =
                batch.sample_nodules(sample.batch_size, sample.patch_size, sample.share, &mut rng)?;
            if let Some(dir) = &config.patches {
                patches.dump(
                    &[DumpTarget::Data, DumpTarget::Mask],
                    &[dir.join("data"), dir.join("mask")],
                    &FsBlobStore,
                    config.precision,
                )?;
            }
            Some(patches)
        }
        None => None,
    };

    log::info!("Pipeline finished in {:?}", started.elapsed());
    Ok(PipelineOutput { batch, patches })
}
