use crate::{
    enums::SortBy,
    error::{BatchError, Result},
    geometry::Vec3,
    volume::ScanVolume,
};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// Anything that can turn a scan identifier into voxels and geometry.
///
/// Implementations are called from worker threads, one scan per call.
pub trait VolumeSource: Sync {
    fn read_volume(&self, id: &str, path: Option<&Path>) -> Result<ScanVolume>;
}

fn require_path<'a>(id: &str, path: Option<&'a Path>) -> Result<&'a Path> {
    path.ok_or_else(|| BatchError::invalid(format!("scan {id} has no path to read from")))
}

/// Volumes already in memory, keyed by identifier.
#[derive(Default)]
pub struct InMemorySource {
    volumes: HashMap<String, ScanVolume>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, volume: ScanVolume) {
        self.volumes.insert(id.into(), volume);
    }
}

impl VolumeSource for InMemorySource {
    fn read_volume(&self, id: &str, _path: Option<&Path>) -> Result<ScanVolume> {
        self.volumes
            .get(id)
            .cloned()
            .ok_or_else(|| BatchError::OutOfRange(id.to_string()))
    }
}

/// MetaImage scans: a `.mhd` text header next to an uncompressed `.raw` payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetaImageSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ElementType {
    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "MET_CHAR" => ElementType::I8,
            "MET_UCHAR" => ElementType::U8,
            "MET_SHORT" => ElementType::I16,
            "MET_USHORT" => ElementType::U16,
            "MET_INT" | "MET_LONG" => ElementType::I32,
            "MET_UINT" | "MET_ULONG" => ElementType::U32,
            "MET_FLOAT" => ElementType::F32,
            "MET_DOUBLE" => ElementType::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

macro_rules! decode_as {
    ($bytes:expr, $ty:ty, $msb:expr) => {{
        const N: usize = std::mem::size_of::<$ty>();
        $bytes
            .chunks_exact(N)
            .map(|chunk| {
                let mut raw = [0u8; N];
                raw.copy_from_slice(chunk);
                let value = if $msb {
                    <$ty>::from_be_bytes(raw)
                } else {
                    <$ty>::from_le_bytes(raw)
                };
                value as f32
            })
            .collect::<Vec<f32>>()
    }};
}

struct MetaHeader {
    dim: [usize; 3],
    spacing: Vec3,
    origin: Vec3,
    element: ElementType,
    msb: bool,
    header_size: usize,
    data_file: PathBuf,
}

impl MetaImageSource {
    pub fn load(path: &Path) -> Result<ScanVolume> {
        let header = Self::read_header(path)?;
        let bytes = fs::read(&header.data_file)?;
        let count = header.dim.iter().product::<usize>();
        let needed = header.header_size + count * header.element.size();
        if bytes.len() < needed {
            return Err(meta_error(
                path,
                format!("payload holds {} bytes, expected {needed}", bytes.len()),
            ));
        }
        let payload = &bytes[header.header_size..needed];
        let msb = header.msb;
        let values = match header.element {
            ElementType::I8 => decode_as!(payload, i8, msb),
            ElementType::U8 => decode_as!(payload, u8, msb),
            ElementType::I16 => decode_as!(payload, i16, msb),
            ElementType::U16 => decode_as!(payload, u16, msb),
            ElementType::I32 => decode_as!(payload, i32, msb),
            ElementType::U32 => decode_as!(payload, u32, msb),
            ElementType::F32 => decode_as!(payload, f32, msb),
            ElementType::F64 => decode_as!(payload, f64, msb),
        };
        let [z, y, x] = header.dim;
        let data = Array3::from_shape_vec((z, y, x), values)
            .map_err(|err| meta_error(path, err.to_string()))?;
        ScanVolume::new(data, header.origin, header.spacing)
    }

    fn read_header(path: &Path) -> Result<MetaHeader> {
        let text = fs::read_to_string(path)?;
        let fields: HashMap<&str, &str> = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();

        if let Some(ndims) = fields.get("NDims") {
            if *ndims != "3" {
                return Err(meta_error(path, format!("expected 3 dimensions, got {ndims}")));
            }
        }
        if fields
            .get("CompressedData")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Err(meta_error(path, "compressed payloads are not supported"));
        }

        // Header vectors are x, y, z; everything downstream is z, y, x.
        let dim_xyz = parse_triplet::<usize>(path, &fields, "DimSize")?
            .ok_or_else(|| meta_error(path, "missing DimSize"))?;
        let spacing_xyz = match parse_triplet::<f64>(path, &fields, "ElementSpacing")? {
            Some(spacing) => spacing,
            None => parse_triplet::<f64>(path, &fields, "ElementSize")?.unwrap_or([1.0; 3]),
        };
        let origin_xyz = ["Offset", "Origin", "Position"]
            .iter()
            .map(|key| parse_triplet::<f64>(path, &fields, key))
            .find_map(|parsed| parsed.transpose())
            .transpose()?
            .unwrap_or([0.0; 3]);

        let element_name = fields
            .get("ElementType")
            .ok_or_else(|| meta_error(path, "missing ElementType"))?;
        let element = ElementType::parse(element_name)
            .ok_or_else(|| meta_error(path, format!("unsupported ElementType {element_name}")))?;
        let msb = ["BinaryDataByteOrderMSB", "ElementByteOrderMSB"]
            .iter()
            .any(|key| fields.get(key).is_some_and(|v| v.eq_ignore_ascii_case("true")));
        let header_size = match fields.get("HeaderSize") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| meta_error(path, format!("unsupported HeaderSize {value}")))?,
            None => 0,
        };

        let data_name = fields
            .get("ElementDataFile")
            .ok_or_else(|| meta_error(path, "missing ElementDataFile"))?;
        if data_name.eq_ignore_ascii_case("LOCAL") || data_name.starts_with("LIST") {
            return Err(meta_error(
                path,
                format!("ElementDataFile {data_name} is not supported"),
            ));
        }
        let data_file = path
            .parent()
            .map_or_else(|| PathBuf::from(data_name), |dir| dir.join(data_name));

        Ok(MetaHeader {
            dim: reverse(dim_xyz),
            spacing: reverse(spacing_xyz),
            origin: reverse(origin_xyz),
            element,
            msb,
            header_size,
            data_file,
        })
    }
}

impl VolumeSource for MetaImageSource {
    fn read_volume(&self, id: &str, path: Option<&Path>) -> Result<ScanVolume> {
        Self::load(require_path(id, path)?)
    }
}

fn parse_triplet<T: std::str::FromStr>(
    path: &Path,
    fields: &HashMap<&str, &str>,
    key: &str,
) -> Result<Option<[T; 3]>> {
    let Some(value) = fields.get(key) else {
        return Ok(None);
    };
    let parsed: Vec<T> = value
        .split_whitespace()
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| meta_error(path, format!("cannot parse {key} = {value}")))?;
    let triplet: [T; 3] = parsed
        .try_into()
        .map_err(|_| meta_error(path, format!("{key} must have 3 values, got {value}")))?;
    Ok(Some(triplet))
}

fn reverse<T: Copy>(values: [T; 3]) -> [T; 3] {
    [values[2], values[1], values[0]]
}

fn meta_error(path: &Path, message: impl Into<String>) -> BatchError {
    BatchError::MetaImage {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// A directory of single-frame `.dcm` slices per scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomSeriesSource {
    pub sort_by: SortBy,
}

struct Slice {
    order: Option<f32>,
    position: Option<Vec3>,
    image: Array2<f32>,
}

impl DicomSeriesSource {
    pub fn new(sort_by: SortBy) -> Self {
        Self { sort_by }
    }

    /// Load a scan from a directory containing .dcm files
    pub fn load_from_directory(&self, path: impl AsRef<Path>) -> Result<ScanVolume> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(BatchError::NoValidImages(path.as_ref().to_path_buf()));
        }

        let objects = paths
            .iter()
            .map(|path| open_file(path).map_err(BatchError::from))
            .collect::<Result<Vec<_>>>()?;
        self.load_from_dicom_objects(path.as_ref(), &objects)
    }

    /// Stack decoded slices into one scan.
    ///
    /// Slices without decodable pixel data are skipped; all remaining slices must
    /// share their dimensions.
    pub fn load_from_dicom_objects(
        &self,
        source: &Path,
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<ScanVolume> {
        let mut slices: Vec<Slice> = dicom_objects
            .iter()
            .filter_map(|object| self.extract_slice(object))
            .collect();

        if slices.is_empty() {
            return Err(BatchError::NoValidImages(source.to_path_buf()));
        }

        if !matches!(self.sort_by, SortBy::None) {
            slices.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));
        }

        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(BatchError::PixelData {
                path: source.to_path_buf(),
                message: "inconsistent slice dimensions".to_string(),
            });
        }

        let (height, width) = first_dim;
        let mut data = Array3::<f32>::zeros((slices.len(), height, width));
        for (i, slice) in slices.iter().enumerate() {
            data.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        let origin = slices[0].position.unwrap_or([0.0; 3]);
        let spacing = Self::get_spacing(dicom_objects, &slices).ok_or_else(|| {
            BatchError::PixelData {
                path: source.to_path_buf(),
                message: "missing spacing information".to_string(),
            }
        })?;

        ScanVolume::new(data, origin, spacing)
    }

    fn extract_slice(&self, dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Slice> {
        let position = Self::image_position(dicom_object);
        let order = match self.sort_by {
            SortBy::ImagePositionPatient => position.map(|p| p[0] as f32),
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(|n| n as f32),
            SortBy::None => Some(0.0),
        };
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position,
            image,
        })
    }

    /// ImagePositionPatient as z, y, x.
    fn image_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Vec3> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match pos.as_slice() {
            [x, y, z, ..] => Some([*z, *y, *x]),
            _ => None,
        }
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    /// z spacing from the first two slice positions, falling back to SliceThickness.
    fn get_spacing(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        slices: &[Slice],
    ) -> Option<Vec3> {
        let pixel_spacing = dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float64()
                .ok()
        })?;
        let (row, column) = match pixel_spacing.as_slice() {
            [row, column, ..] => (*row, *column),
            _ => return None,
        };

        let from_positions = match slices {
            [a, b, ..] => a
                .position
                .zip(b.position)
                .map(|(a, b)| (b[0] - a[0]).abs())
                .filter(|dz| *dz > 0.0),
            _ => None,
        };
        let z = from_positions.or_else(|| {
            dicom_objects.iter().find_map(|dicom_object| {
                dicom_object
                    .element(tags::SLICE_THICKNESS)
                    .ok()?
                    .to_float64()
                    .ok()
            })
        })?;

        Some([z, row, column])
    }
}

impl VolumeSource for DicomSeriesSource {
    fn read_volume(&self, id: &str, path: Option<&Path>) -> Result<ScanVolume> {
        self.load_from_directory(require_path(id, path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_scan(dir: &Path, header: &str, payload: &[u8]) -> PathBuf {
        fs::write(dir.join("scan.raw"), payload).unwrap();
        let path = dir.join("scan.mhd");
        fs::write(&path, header).unwrap();
        path
    }

    #[test]
    fn empty_dicom_directory_has_no_valid_images() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "not a slice").unwrap();
        let err = DicomSeriesSource::new(SortBy::default())
            .load_from_directory(dir.path())
            .unwrap_err();
        assert!(matches!(err, BatchError::NoValidImages(path) if path == dir.path()));
    }

    #[test]
    fn reads_short_metaimage_in_zyx_order() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<i16> = (0..24).map(|v| v as i16 - 12).collect();
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let header = "ObjectType = Image\nNDims = 3\nBinaryData = True\n\
                      BinaryDataByteOrderMSB = False\nOffset = -10 20.5 -300\n\
                      ElementSpacing = 0.5 0.75 2.5\nDimSize = 4 3 2\n\
                      ElementType = MET_SHORT\nElementDataFile = scan.raw\n";
        let path = write_scan(dir.path(), header, &payload);

        let volume = MetaImageSource::load(&path).unwrap();
        assert_eq!(volume.dim(), (2, 3, 4));
        assert_eq!(volume.origin, [-300.0, 20.5, -10.0]);
        assert_eq!(volume.spacing, [2.5, 0.75, 0.5]);
        assert_eq!(volume.data[[0, 0, 0]], -12.0);
        assert_eq!(volume.data[[0, 0, 1]], -11.0);
        assert_eq!(volume.data[[1, 2, 3]], 11.0);
    }

    #[test]
    fn reads_big_endian_floats() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..8).flat_map(|v| (v as f32 * 0.5).to_be_bytes()).collect();
        let header = "NDims = 3\nDimSize = 2 2 2\nElementType = MET_FLOAT\n\
                      ElementByteOrderMSB = True\nElementDataFile = scan.raw\n";
        let path = write_scan(dir.path(), header, &payload);

        let volume = MetaImageSource::load(&path).unwrap();
        assert_eq!(volume.spacing, [1.0; 3]);
        assert_eq!(volume.data[[1, 1, 1]], 3.5);
    }

    #[test]
    fn short_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let header = "NDims = 3\nDimSize = 2 2 2\nElementType = MET_SHORT\nElementDataFile = scan.raw\n";
        let path = write_scan(dir.path(), header, &[0u8; 6]);
        assert!(matches!(
            MetaImageSource::load(&path),
            Err(BatchError::MetaImage { .. })
        ));
    }

    #[test]
    fn compressed_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let header = "NDims = 3\nCompressedData = True\nDimSize = 1 1 1\n\
                      ElementType = MET_SHORT\nElementDataFile = scan.raw\n";
        let path = write_scan(dir.path(), header, &[0u8; 2]);
        assert!(MetaImageSource::load(&path).is_err());
    }

    #[test]
    fn missing_path_is_invalid() {
        let err = MetaImageSource.read_volume("a", None).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[test]
    fn in_memory_source_resolves_ids() {
        let mut source = InMemorySource::new();
        source.insert("a", ScanVolume::new(Array3::zeros((1, 1, 1)), [0.0; 3], [1.0; 3]).unwrap());
        assert!(source.read_volume("a", None).is_ok());
        assert!(matches!(
            source.read_volume("b", None),
            Err(BatchError::OutOfRange(_))
        ));
    }
}
