#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array3;

/// Writes `<id>.mhd` and `<id>.raw` into `dir`. Origin and spacing are z-y-x.
pub fn write_metaimage(
    dir: &Path,
    id: &str,
    data: &Array3<i16>,
    origin: [f64; 3],
    spacing: [f64; 3],
) -> PathBuf {
    fs::create_dir_all(dir).expect("create scan dir");
    let (depth, height, width) = data.dim();
    let payload: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(dir.join(format!("{id}.raw")), payload).expect("write raw payload");

    let header = format!(
        "ObjectType = Image\n\
         NDims = 3\n\
         BinaryData = True\n\
         BinaryDataByteOrderMSB = False\n\
         CompressedData = False\n\
         Offset = {} {} {}\n\
         ElementSpacing = {} {} {}\n\
         DimSize = {width} {height} {depth}\n\
         ElementType = MET_SHORT\n\
         ElementDataFile = {id}.raw\n",
        origin[2], origin[1], origin[0], spacing[2], spacing[1], spacing[0],
    );
    let path = dir.join(format!("{id}.mhd"));
    fs::write(&path, header).expect("write mhd header");
    path
}

/// Scan of `depth` slices whose voxels count up from `base` along z.
pub fn ramp_scan(depth: usize, height: usize, width: usize, base: i16) -> Array3<i16> {
    Array3::from_shape_fn((depth, height, width), |(z, _, _)| base + z as i16)
}

pub const ANNOTATIONS: &str = "seriesuid,coordX,coordY,coordZ,diameter_mm\n\
                               scan_a,8,8,-70,4\n\
                               scan_c,8,8,-80,4\n\
                               1.3.6.1.4.1.14519.5.2.1.6279,10,10,10,6\n";

/// Three 16x16 scans of 30, 20 and 25 slices, spacing (2, 1, 1), origin z = -100.
pub fn write_luna_like(dir: &Path) -> PathBuf {
    let scans = dir.join("scans");
    for (id, depth, base) in [("scan_a", 30, 0), ("scan_b", 20, 100), ("scan_c", 25, 200)] {
        write_metaimage(
            &scans,
            id,
            &ramp_scan(depth, 16, 16, base),
            [-100.0, 0.0, 0.0],
            [2.0, 1.0, 1.0],
        );
    }
    fs::write(dir.join("annotations.csv"), ANNOTATIONS).expect("write annotations");
    scans
}
