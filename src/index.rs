//! Scan identifiers and their positions in a batch.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{BatchError, Result};

/// Ordered scan identifiers. Position `p` is the `p`-th identifier and never changes
/// for the life of the index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanIndex {
    ids: Vec<String>,
    paths: Vec<Option<PathBuf>>,
    positions: HashMap<String, usize>,
}

impl ScanIndex {
    /// Index over bare identifiers with no backing files.
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(ids.into_iter().map(|id| (id.into(), None)))
    }

    /// Index over identifiers resolved to files or directories.
    pub fn with_paths<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, PathBuf)>,
        S: Into<String>,
    {
        Self::build(
            entries
                .into_iter()
                .map(|(id, path)| (id.into(), Some(path))),
        )
    }

    /// Lists `dir` and keys every entry by its file stem.
    ///
    /// With an extension only matching files are taken (e.g. `"mhd"`); without one
    /// every subdirectory becomes a scan, which suits one-folder-per-series DICOM.
    pub fn from_directory(dir: impl AsRef<Path>, extension: Option<&str>) -> Result<Self> {
        let mut entries: Vec<(String, PathBuf)> = fs::read_dir(dir.as_ref())?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| match extension {
                Some(wanted) => path
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted)),
                None => path.is_dir(),
            })
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?.to_string();
                Some((stem, path))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        log::debug!(
            "Indexed {} scans in {}",
            entries.len(),
            dir.as_ref().display()
        );
        Self::with_paths(entries)
    }

    /// `size` random 8-character hex identifiers, for batches that have no files
    /// behind them (sampled patches).
    pub fn random<R: Rng + ?Sized>(size: usize, rng: &mut R) -> Self {
        let mut ids = Vec::with_capacity(size);
        let mut positions = HashMap::with_capacity(size);
        while ids.len() < size {
            let id = format!("{:08x}", rng.random::<u32>());
            if !positions.contains_key(&id) {
                positions.insert(id.clone(), ids.len());
                ids.push(id);
            }
        }
        Self {
            paths: vec![None; ids.len()],
            ids,
            positions,
        }
    }

    fn build(entries: impl Iterator<Item = (String, Option<PathBuf>)>) -> Result<Self> {
        let mut index = Self::default();
        for (id, path) in entries {
            if index.positions.contains_key(&id) {
                return Err(BatchError::invalid(format!("duplicate scan identifier {id}")));
            }
            index.positions.insert(id.clone(), index.ids.len());
            index.ids.push(id);
            index.paths.push(path);
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn position(&self, id: &str) -> Result<usize> {
        self.positions
            .get(id)
            .copied()
            .ok_or_else(|| BatchError::OutOfRange(id.to_string()))
    }

    pub fn identifier(&self, position: usize) -> Result<&str> {
        self.ids
            .get(position)
            .map(String::as_str)
            .ok_or_else(|| BatchError::OutOfRange(position.to_string()))
    }

    /// Path a scan was resolved to, if the index was built from files.
    pub fn path(&self, id: &str) -> Result<Option<&Path>> {
        let position = self.position(id)?;
        Ok(self.paths[position].as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn positions_follow_insertion_order() {
        let index = ScanIndex::new(["b", "a", "c"]).unwrap();
        assert_eq!(index.position("a").unwrap(), 1);
        assert_eq!(index.identifier(2).unwrap(), "c");
        assert!(matches!(index.position("z"), Err(BatchError::OutOfRange(_))));
        assert!(matches!(index.identifier(3), Err(BatchError::OutOfRange(_))));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(ScanIndex::new(["a", "a"]).is_err());
    }

    #[test]
    fn random_ids_are_unique_hex() {
        let mut rng = StdRng::seed_from_u64(7);
        let index = ScanIndex::random(50, &mut rng);
        assert_eq!(index.len(), 50);
        for id in index.ids() {
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn directory_listing_keys_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["scan_b.mhd", "scan_a.mhd", "scan_a.raw", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let index = ScanIndex::from_directory(dir.path(), Some("mhd")).unwrap();
        assert_eq!(index.ids(), &["scan_a".to_string(), "scan_b".to_string()]);
        assert_eq!(
            index.path("scan_b").unwrap(),
            Some(dir.path().join("scan_b.mhd").as_path())
        );
    }
}
