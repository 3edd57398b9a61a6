//! Single-file volume formats: MetaImage (`.mha`) and NIfTI-1 (`.nii`, `.nii.gz`).
//!
//! Geometry is kept in patient (LPS) coordinates in memory. NIfTI stores its
//! affine in RAS, so the first two rows are negated on the way in and out.

use std::{
    fs,
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Ix3};
use nifti::{
    IntoNdArray, NiftiHeader, NiftiObject, NiftiType, ReaderOptions, writer::WriterOptions,
};
use thiserror::Error;
use tracing::debug;

use crate::{enums::PixelKind, volume::Volume};

#[derive(Debug, Error)]
pub enum VolumeIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("{0:?} samples cannot be stored in this format")]
    UnsupportedPixelKind(PixelKind),

    #[error("malformed file: {0}")]
    Malformed(String),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("DICOM write error: {0}")]
    Dicom(#[from] dicom::object::WriteError),

    #[error("DICOM meta group error: {0}")]
    DicomMeta(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VolumeFormat {
    MetaImage,
    Nifti,
}

impl VolumeFormat {
    fn from_path(path: &Path) -> Result<Self, VolumeIoError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if name.ends_with(".mha") {
            Ok(Self::MetaImage)
        } else if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Ok(Self::Nifti)
        } else {
            Err(VolumeIoError::UnsupportedFormat(path.to_path_buf()))
        }
    }
}

/// Writes `volume` to `path`; the format follows from the extension.
pub fn write_volume(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeIoError> {
    let path = path.as_ref();
    let format = VolumeFormat::from_path(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    debug!(path = %path.display(), ?format, size = ?volume.size(), "writing volume");
    match format {
        VolumeFormat::MetaImage => write_meta_image(volume, path),
        VolumeFormat::Nifti => write_nifti(volume, path),
    }
}

/// Reads a volume previously written by [`write_volume`] (or any MetaImage /
/// NIfTI-1 file holding 16-bit integer or 32-bit float samples).
pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume, VolumeIoError> {
    let path = path.as_ref();
    match VolumeFormat::from_path(path)? {
        VolumeFormat::MetaImage => read_meta_image(path),
        VolumeFormat::Nifti => read_nifti(path),
    }
}

fn element_type(kind: PixelKind) -> &'static str {
    match kind {
        PixelKind::U16 => "MET_USHORT",
        PixelKind::I16 => "MET_SHORT",
        PixelKind::F32 => "MET_FLOAT",
    }
}

fn join(values: impl IntoIterator<Item = f64>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_meta_image(volume: &Volume, path: &Path) -> Result<(), VolumeIoError> {
    let [nx, ny, nz] = volume.size();
    let header = format!(
        "ObjectType = Image\n\
         NDims = 3\n\
         BinaryData = True\n\
         BinaryDataByteOrderMSB = {msb}\n\
         CompressedData = False\n\
         TransformMatrix = {matrix}\n\
         Offset = {offset}\n\
         CenterOfRotation = 0 0 0\n\
         ElementSpacing = {spacing}\n\
         DimSize = {nx} {ny} {nz}\n\
         ElementType = {element}\n\
         ElementDataFile = LOCAL\n",
        msb = if cfg!(target_endian = "big") { "True" } else { "False" },
        matrix = join(volume.direction().as_slice().iter().copied()),
        offset = join(volume.origin()),
        spacing = join(volume.spacing()),
        element = element_type(volume.pixel_kind()),
    );

    // samples are stored x fastest, which is the standard layout of [z, y, x]
    let samples = volume.data().iter();
    let bytes: Vec<u8> = match volume.pixel_kind() {
        PixelKind::U16 => {
            let values: Vec<u16> = samples.map(|&v| v as u16).collect();
            bytemuck::cast_slice(&values).to_vec()
        }
        PixelKind::I16 => {
            let values: Vec<i16> = samples.map(|&v| v as i16).collect();
            bytemuck::cast_slice(&values).to_vec()
        }
        PixelKind::F32 => {
            let values: Vec<f32> = samples.copied().collect();
            bytemuck::cast_slice(&values).to_vec()
        }
    };

    let mut file = fs::File::create(path)?;
    file.write_all(header.as_bytes())?;
    file.write_all(&bytes)?;
    Ok(())
}

#[derive(Default)]
struct MetaHeader {
    dims: Option<[usize; 3]>,
    spacing: Option<[f64; 3]>,
    origin: Option<[f64; 3]>,
    direction: Option<[f64; 9]>,
    kind: Option<PixelKind>,
    big_endian: bool,
}

fn parse_values<const N: usize, T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> Result<[T; N], VolumeIoError> {
    let parsed: Vec<T> = value
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| VolumeIoError::Malformed(format!("{key} = {value}")))?;
    parsed
        .try_into()
        .map_err(|_| VolumeIoError::Malformed(format!("{key} expects {N} values: {value}")))
}

fn read_meta_image(path: &Path) -> Result<Volume, VolumeIoError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut header = MetaHeader::default();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(VolumeIoError::Malformed("missing ElementDataFile".into()));
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "NDims" if value != "3" => {
                return Err(VolumeIoError::Malformed(format!("NDims = {value}")));
            }
            "CompressedData" if value.eq_ignore_ascii_case("true") => {
                return Err(VolumeIoError::UnsupportedFormat(path.to_path_buf()));
            }
            "BinaryDataByteOrderMSB" | "ElementByteOrderMSB" => {
                header.big_endian = value.eq_ignore_ascii_case("true");
            }
            "DimSize" => header.dims = Some(parse_values(key, value)?),
            "ElementSpacing" => header.spacing = Some(parse_values(key, value)?),
            "Offset" | "Origin" | "Position" => header.origin = Some(parse_values(key, value)?),
            "TransformMatrix" | "Rotation" | "Orientation" => {
                header.direction = Some(parse_values(key, value)?)
            }
            "ElementType" => {
                header.kind = Some(match value {
                    "MET_USHORT" => PixelKind::U16,
                    "MET_SHORT" => PixelKind::I16,
                    "MET_FLOAT" => PixelKind::F32,
                    other => {
                        return Err(VolumeIoError::Malformed(format!(
                            "unsupported ElementType {other}"
                        )));
                    }
                })
            }
            "ElementDataFile" => {
                if value != "LOCAL" {
                    return Err(VolumeIoError::UnsupportedFormat(path.to_path_buf()));
                }
                break;
            }
            _ => {}
        }
    }

    let dims = header
        .dims
        .ok_or_else(|| VolumeIoError::Malformed("missing DimSize".into()))?;
    let kind = header
        .kind
        .ok_or_else(|| VolumeIoError::Malformed("missing ElementType".into()))?;
    let byte_len = dims
        .iter()
        .try_fold(kind.bytes_per_sample(), |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| VolumeIoError::Malformed(format!("DimSize {dims:?} overflows")))?;
    let file_len = fs::metadata(path)?.len();
    if !u64::try_from(byte_len).is_ok_and(|len| len <= file_len) {
        return Err(VolumeIoError::Malformed(format!(
            "DimSize {dims:?} needs {byte_len} bytes but the file holds {file_len}"
        )));
    }

    let mut bytes = Vec::with_capacity(byte_len);
    reader.read_to_end(&mut bytes)?;
    if bytes.len() < byte_len {
        return Err(VolumeIoError::Malformed(format!(
            "expected {byte_len} bytes of samples, found {}",
            bytes.len()
        )));
    }
    bytes.truncate(byte_len);
    let swap = header.big_endian != cfg!(target_endian = "big");

    let samples: Vec<f32> = match kind {
        PixelKind::U16 => bytemuck::pod_collect_to_vec::<u8, u16>(&bytes)
            .into_iter()
            .map(|v| f32::from(if swap { v.swap_bytes() } else { v }))
            .collect(),
        PixelKind::I16 => bytemuck::pod_collect_to_vec::<u8, i16>(&bytes)
            .into_iter()
            .map(|v| f32::from(if swap { v.swap_bytes() } else { v }))
            .collect(),
        PixelKind::F32 => bytemuck::pod_collect_to_vec::<u8, u32>(&bytes)
            .into_iter()
            .map(|v| f32::from_bits(if swap { v.swap_bytes() } else { v }))
            .collect(),
    };

    let data = Array3::from_shape_vec((dims[2], dims[1], dims[0]), samples)
        .map_err(|e| VolumeIoError::Malformed(e.to_string()))?;
    let direction = header
        .direction
        .map(|values| Matrix3::from_column_slice(&values))
        .unwrap_or_else(Matrix3::identity);

    Volume::new(
        data,
        header.spacing.unwrap_or([1.0; 3]),
        header.origin.unwrap_or([0.0; 3]),
        direction,
        kind,
    )
    .map_err(|e| VolumeIoError::Malformed(e.to_string()))
}

/// RAS <-> LPS: negate the first two physical axes.
fn flip_xy(matrix: &mut Matrix3<f64>, offset: &mut Vector3<f64>) {
    for row in 0..2 {
        matrix.row_mut(row).neg_mut();
        offset[row] = -offset[row];
    }
}

fn write_nifti(volume: &Volume, path: &Path) -> Result<(), VolumeIoError> {
    let mut affine = volume.index_to_physical_matrix();
    let mut offset = Vector3::from(volume.origin());
    flip_xy(&mut affine, &mut offset);

    let row = |r: usize| {
        [
            affine[(r, 0)] as f32,
            affine[(r, 1)] as f32,
            affine[(r, 2)] as f32,
            offset[r] as f32,
        ]
    };
    let spacing = volume.spacing();
    let header = NiftiHeader {
        pixdim: [
            1.0,
            spacing[0] as f32,
            spacing[1] as f32,
            spacing[2] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ],
        xyzt_units: 2,
        sform_code: 1,
        qform_code: 0,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        ..NiftiHeader::default()
    };

    // NIfTI arrays are indexed [x, y, z]
    let data = volume.data().view().permuted_axes([2, 1, 0]);
    let writer = WriterOptions::new(path).reference_header(&header);
    match volume.pixel_kind() {
        PixelKind::U16 => writer.write_nifti(&data.mapv(|v| v as u16))?,
        PixelKind::I16 => writer.write_nifti(&data.mapv(|v| v as i16))?,
        PixelKind::F32 => writer.write_nifti(&data)?,
    }
    Ok(())
}

/// Index-to-physical affine (RAS) from the sform, the qform, or pixdim alone.
fn nifti_affine(header: &NiftiHeader) -> (Matrix3<f64>, Vector3<f64>) {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let matrix = Matrix3::from_fn(|r, c| f64::from(rows[r][c]));
        let offset = Vector3::from_fn(|r, _| f64::from(rows[r][3]));
        return (matrix, offset);
    }

    let pixdim = Vector3::new(
        f64::from(header.pixdim[1]),
        f64::from(header.pixdim[2]),
        f64::from(header.pixdim[3]),
    );
    if header.qform_code > 0 {
        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let rotation = Matrix3::new(
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - b * b - c * c,
        );
        let scale = Matrix3::from_diagonal(&Vector3::new(pixdim.x, pixdim.y, pixdim.z * qfac));
        let offset = Vector3::new(
            f64::from(header.quatern_x),
            f64::from(header.quatern_y),
            f64::from(header.quatern_z),
        );
        return (rotation * scale, offset);
    }

    (Matrix3::from_diagonal(&pixdim), Vector3::zeros())
}

fn read_nifti(path: &Path) -> Result<Volume, VolumeIoError> {
    let object = ReaderOptions::new().read_file(path)?;
    let header = object.header().clone();
    let kind = match header.data_type()? {
        NiftiType::Uint16 => PixelKind::U16,
        NiftiType::Int16 => PixelKind::I16,
        _ => PixelKind::F32,
    };

    let data = object
        .into_volume()
        .into_ndarray::<f32>()?
        .into_dimensionality::<Ix3>()
        .map_err(|e| VolumeIoError::Malformed(format!("expected a 3D volume: {e}")))?
        .permuted_axes([2, 1, 0])
        .as_standard_layout()
        .into_owned();

    let (mut affine, mut offset) = nifti_affine(&header);
    flip_xy(&mut affine, &mut offset);

    let spacing = [
        affine.column(0).norm(),
        affine.column(1).norm(),
        affine.column(2).norm(),
    ];
    let mut direction = affine;
    for (column, s) in spacing.iter().enumerate() {
        if *s > 0.0 {
            direction.column_mut(column).unscale_mut(*s);
        }
    }

    Volume::new(data, spacing, [offset.x, offset.y, offset.z], direction, kind)
        .map_err(|e| VolumeIoError::Malformed(e.to_string()))
}
