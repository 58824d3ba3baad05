//! Per-scan blobs on disk.
//!
//! A blob is `CTBLOB01`, one precision byte, the z, y, x extent as little-endian
//! u64s, then a zlib stream of the voxels in native byte order.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use half::f16;
use ndarray::{Array3, ArrayView3};

use crate::enums::BlobPrecision;
use crate::error::{BatchError, Result};

const MAGIC: &[u8; 8] = b"CTBLOB01";
const HEADER_LEN: usize = MAGIC.len() + 1 + 3 * 8;
const BLOB_FILE: &str = "data.blk";

pub fn encode_volume(volume: ArrayView3<'_, f32>, precision: BlobPrecision) -> Result<Vec<u8>> {
    let (depth, height, width) = volume.dim();
    let mut out = Vec::with_capacity(HEADER_LEN + volume.len());
    out.extend_from_slice(MAGIC);
    out.push(match precision {
        BlobPrecision::F32 => 0,
        BlobPrecision::F16 => 1,
    });
    for extent in [depth, height, width] {
        out.extend_from_slice(&(extent as u64).to_le_bytes());
    }

    let values: Vec<f32> = volume.iter().copied().collect();
    let mut encoder = ZlibEncoder::new(out, Compression::fast());
    match precision {
        BlobPrecision::F32 => encoder.write_all(bytemuck::cast_slice(&values))?,
        BlobPrecision::F16 => {
            let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
            encoder.write_all(bytemuck::cast_slice(&halves))?;
        }
    }
    Ok(encoder.finish()?)
}

pub fn decode_volume(bytes: &[u8]) -> Result<Array3<f32>> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(BatchError::Blob("missing blob header".to_string()));
    }
    let precision = match bytes[MAGIC.len()] {
        0 => BlobPrecision::F32,
        1 => BlobPrecision::F16,
        other => return Err(BatchError::Blob(format!("unknown precision tag {other}"))),
    };
    let mut dims = [0usize; 3];
    for (axis, chunk) in bytes[MAGIC.len() + 1..HEADER_LEN].chunks_exact(8).enumerate() {
        let raw: [u8; 8] = bytemuck::pod_read_unaligned(chunk);
        dims[axis] = u64::from_le_bytes(raw) as usize;
    }

    let mut payload = Vec::new();
    ZlibDecoder::new(&bytes[HEADER_LEN..]).read_to_end(&mut payload)?;
    let count = dims.iter().product::<usize>();
    let values: Vec<f32> = match precision {
        BlobPrecision::F32 => payload
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect(),
        BlobPrecision::F16 => payload
            .chunks_exact(2)
            .map(|chunk| bytemuck::pod_read_unaligned::<f16>(chunk).to_f32())
            .collect(),
    };
    if values.len() != count {
        return Err(BatchError::Blob(format!(
            "payload holds {} values, header says {dims:?}",
            values.len()
        )));
    }
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), values)
        .map_err(|err| BatchError::Blob(err.to_string()))
}

/// Where encoded scans are persisted. One call per scan.
pub trait BlobStore: Sync {
    fn store(&self, bytes: &[u8], id: &str, dir: &Path) -> Result<PathBuf>;
    fn fetch(&self, id: &str, dir: &Path) -> Result<Vec<u8>>;
}

/// Writes `dir/<id>/data.blk`.
///
/// The blob is written to a temporary file in the scan's own folder and renamed
/// into place, so a destination never holds half a blob and never holds another
/// scan's data.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsBlobStore;

impl BlobStore for FsBlobStore {
    fn store(&self, bytes: &[u8], id: &str, dir: &Path) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(BatchError::invalid(format!("{id:?} cannot name a blob folder")));
        }
        let folder = dir.join(id);
        fs::create_dir_all(&folder)?;
        let target = folder.join(BLOB_FILE);
        let staging = folder.join(format!("{BLOB_FILE}.tmp"));
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &target)?;
        Ok(target)
    }

    fn fetch(&self, id: &str, dir: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(dir.join(id).join(BLOB_FILE))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn sample() -> Array3<f32> {
        Array::from_shape_fn((3, 4, 5), |(z, y, x)| z as f32 * 1.5 - y as f32 + x as f32 * 0.25)
    }

    #[test]
    fn f32_blob_is_lossless() {
        let volume = sample();
        let bytes = encode_volume(volume.view(), BlobPrecision::F32).unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(decode_volume(&bytes).unwrap(), volume);
    }

    #[test]
    fn f16_blob_keeps_small_integers_and_quarters() {
        let volume = sample();
        let bytes = encode_volume(volume.view(), BlobPrecision::F16).unwrap();
        assert_eq!(decode_volume(&bytes).unwrap(), volume);
    }

    #[test]
    fn non_contiguous_views_encode_in_logical_order() {
        let volume = sample();
        let view = volume.slice(ndarray::s![.., 1..3, ..;2]);
        let bytes = encode_volume(view, BlobPrecision::F32).unwrap();
        assert_eq!(decode_volume(&bytes).unwrap(), view.to_owned());
    }

    #[test]
    fn corrupt_blobs_are_rejected() {
        assert!(decode_volume(b"nope").is_err());
        let mut bytes = encode_volume(sample().view(), BlobPrecision::F32).unwrap();
        bytes[8] = 9;
        assert!(matches!(decode_volume(&bytes), Err(BatchError::Blob(_))));
    }

    #[test]
    fn store_replaces_only_its_own_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore;
        store.store(b"first", "a", dir.path()).unwrap();
        store.store(b"other", "b", dir.path()).unwrap();
        let path = store.store(b"second", "a", dir.path()).unwrap();

        assert_eq!(path, dir.path().join("a").join("data.blk"));
        assert_eq!(store.fetch("a", dir.path()).unwrap(), b"second");
        assert_eq!(store.fetch("b", dir.path()).unwrap(), b"other");
        assert!(!dir.path().join("a").join("data.blk.tmp").exists());
    }

    #[test]
    fn store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsBlobStore.store(b"x", "../a", dir.path()).is_err());
    }
}
