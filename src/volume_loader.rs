use crate::{
    enums::{PixelKind, SortBy},
    metadata::{COPIED_TAGS, SourceTags},
    volume::Volume,
};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3, s};
use rayon::prelude::*;
use std::{collections::BTreeSet, fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

/// Relative spread of slice gaps tolerated before a series counts as non-uniform.
const SPACING_TOLERANCE: f64 = 0.01;
const ORIENTATION_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Missing or malformed Image Orientation (Patient)")]
    MissingOrientation,

    #[error("Inconsistent Image Orientation (Patient) across slices")]
    InconsistentOrientation,

    #[error("Non-uniform slice spacing: min {min}, max {max}")]
    NonUniformSpacing { min: f64, max: f64 },

    #[error("Found {0} series where one was expected")]
    MultipleSeries(usize),

    #[error("Invalid geometry: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

struct DecodedSlice {
    order: Option<f64>,
    position: Option<Vector3<f64>>,
    image: Array2<f32>,
    object_index: usize,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume and its descriptive tags from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects belonging to one series
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images are found, if the objects span more
    /// than one series, or if their dimensions, orientation or slice spacing
    /// are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<(Volume, SourceTags), VolumeLoaderError> {
        Self::check_single_series(dicom_objects)?;
        let (row_direction, column_direction) = Self::get_orientation(dicom_objects)?;
        let normal = row_direction.cross(&column_direction).normalize();

        let mut slices: Vec<_> = dicom_objects
            .par_iter()
            .enumerate()
            .filter_map(|(object_index, dicom_object)| {
                let image = Self::decode_image(dicom_object)?;
                let position = get_position(dicom_object);
                let order = Self::get_sort_order(dicom_object, position, &normal, &sort_by);
                Some(DecodedSlice {
                    order,
                    position,
                    image,
                    object_index,
                })
            })
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_images(&mut slices);
        Self::validate_dimensions(&slices)?;

        let first = &dicom_objects[slices[0].object_index];
        let (row_spacing, column_spacing) =
            Self::get_pixel_spacing(first).ok_or(VolumeLoaderError::MissingSpacing)?;
        let (slice_spacing, normal) = Self::get_slice_spacing(&slices, first, normal)?;

        let origin = slices[0].position.unwrap_or_else(|| {
            warn!("series has no Image Position (Patient); using a zero origin");
            Vector3::zeros()
        });
        let direction = Matrix3::from_columns(&[row_direction, column_direction, normal]);
        let volume_array = Self::build_volume_array(&slices);
        let pixel_kind = Self::get_pixel_kind(first, &volume_array);

        debug!(
            slices = slices.len(),
            ?pixel_kind,
            spacing = ?[column_spacing, row_spacing, slice_spacing],
            "loaded DICOM series"
        );

        let volume = Volume::new(
            volume_array,
            [column_spacing, row_spacing, slice_spacing],
            [origin.x, origin.y, origin.z],
            direction,
            pixel_kind,
        )
        .map_err(|e| VolumeLoaderError::Geometry(e.to_string()))?;

        Ok((volume, Self::get_source_tags(first)))
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<(Volume, SourceTags), VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory of slice files.
    ///
    /// Files with a ".dcm" extension are read when there are any; otherwise
    /// every regular file that parses as DICOM is used.
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<(Volume, SourceTags), VolumeLoaderError> {
        let mut files: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let dcm_paths: Vec<_> = files
            .iter()
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .cloned()
            .collect();

        if !dcm_paths.is_empty() {
            return Self::load_from_file_paths(&dcm_paths, sort_by);
        }

        let objects: Vec<_> = files
            .par_iter()
            .filter_map(|path| open_file(path).ok())
            .collect();
        if objects.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        Self::load_from_dicom_objects(&objects, sort_by)
    }

    fn check_single_series(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<(), VolumeLoaderError> {
        let series: BTreeSet<String> = dicom_objects
            .iter()
            .filter_map(|dicom_object| get_string(dicom_object, tags::SERIES_INSTANCE_UID))
            .collect();
        if series.len() > 1 {
            return Err(VolumeLoaderError::MultipleSeries(series.len()));
        }
        Ok(())
    }

    fn get_orientation(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<(Vector3<f64>, Vector3<f64>), VolumeLoaderError> {
        let orientations: Vec<_> = dicom_objects
            .iter()
            .filter_map(|dicom_object| get_f64_vec(dicom_object, tags::IMAGE_ORIENTATION_PATIENT))
            .collect();
        let parse = |values: &[f64]| -> Option<(Vector3<f64>, Vector3<f64>)> {
            if values.len() != 6 {
                return None;
            }
            let row = Vector3::new(values[0], values[1], values[2]).try_normalize(1e-12)?;
            let column = Vector3::new(values[3], values[4], values[5]).try_normalize(1e-12)?;
            Some((row, column))
        };

        let first = orientations
            .first()
            .and_then(|values| parse(values))
            .ok_or(VolumeLoaderError::MissingOrientation)?;

        for values in &orientations[1..] {
            let (row, column) = parse(values).ok_or(VolumeLoaderError::MissingOrientation)?;
            if (row - first.0).norm() > ORIENTATION_TOLERANCE
                || (column - first.1).norm() > ORIENTATION_TOLERANCE
            {
                return Err(VolumeLoaderError::InconsistentOrientation);
            }
        }
        Ok(first)
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        position: Option<Vector3<f64>>,
        normal: &Vector3<f64>,
        sort_by: &SortBy,
    ) -> Option<f64> {
        match sort_by {
            SortBy::ImagePositionPatient => position.map(|p| p.dot(normal)),
            SortBy::InstanceNumber => dicom_object
                .element(tags::INSTANCE_NUMBER)
                .ok()?
                .to_int::<i32>()
                .ok()
                .map(f64::from),
        }
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn sort_images(slices: &mut [DecodedSlice]) {
        slices.sort_by(|a, b| {
            a.order
                .partial_cmp(&b.order)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    fn validate_dimensions(slices: &[DecodedSlice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    /// (row spacing, column spacing): the distance between rows, then columns.
    fn get_pixel_spacing(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<(f64, f64)> {
        let pixel_spacing = get_f64_vec(dicom_object, tags::PIXEL_SPACING)?;
        match pixel_spacing.as_slice() {
            [row, column, ..] => Some((*row, *column)),
            _ => None,
        }
    }

    /// Gap between consecutive slices along `normal`, and the normal flipped
    /// if the sorted slices run against it.
    fn get_slice_spacing(
        slices: &[DecodedSlice],
        first: &FileDicomObject<InMemDicomObject>,
        normal: Vector3<f64>,
    ) -> Result<(f64, Vector3<f64>), VolumeLoaderError> {
        let positions: Option<Vec<_>> = slices.iter().map(|slice| slice.position).collect();
        match positions {
            Some(positions) if positions.len() > 1 => {
                let steps: Vec<f64> = positions
                    .windows(2)
                    .map(|pair| (pair[1] - pair[0]).dot(&normal))
                    .collect();
                let gaps: Vec<f64> = steps.iter().map(|step| step.abs()).collect();
                let min = gaps.iter().copied().fold(f64::INFINITY, f64::min);
                let max = gaps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
                let reverses = steps.iter().any(|s| s.signum() != steps[0].signum());
                if max - min > SPACING_TOLERANCE * mean || reverses {
                    return Err(VolumeLoaderError::NonUniformSpacing { min, max });
                }
                let normal = if steps[0] < 0.0 { -normal } else { normal };
                Ok((mean, normal))
            }
            _ => {
                let thickness = get_f64(first, tags::SPACING_BETWEEN_SLICES)
                    .or_else(|| get_f64(first, tags::SLICE_THICKNESS))
                    .ok_or(VolumeLoaderError::MissingSpacing)?;
                Ok((thickness, normal))
            }
        }
    }

    fn build_volume_array(slices: &[DecodedSlice]) -> Array3<f32> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// Integer kind from Pixel Representation, unless rescaling produced
    /// values that kind cannot hold.
    fn get_pixel_kind(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        volume: &Array3<f32>,
    ) -> PixelKind {
        let signed = dicom_object
            .element(tags::PIXEL_REPRESENTATION)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            == Some(1);
        let (kind, min, max) = if signed {
            (PixelKind::I16, f32::from(i16::MIN), f32::from(i16::MAX))
        } else {
            (PixelKind::U16, f32::from(u16::MIN), f32::from(u16::MAX))
        };
        let fits = volume
            .iter()
            .all(|&v| v.fract() == 0.0 && (min..=max).contains(&v));
        if fits { kind } else { PixelKind::F32 }
    }

    fn get_source_tags(dicom_object: &FileDicomObject<InMemDicomObject>) -> SourceTags {
        COPIED_TAGS
            .iter()
            .chain([&tags::SERIES_DESCRIPTION])
            .filter_map(|tag| get_string(dicom_object, *tag).map(|value| (*tag, value)))
            .collect()
    }
}

/// Reads one DICOM series directory into a volume plus its descriptive tags.
pub fn load_series(path: impl AsRef<Path>) -> Result<(Volume, SourceTags), VolumeLoaderError> {
    VolumeLoader::load_from_directory(path, SortBy::ImagePositionPatient)
}

fn get_string(obj: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
    let value = obj.element(tag).ok()?.to_str().ok()?;
    let value = value.trim_end_matches(['\0', ' ']).trim_start();
    (!value.is_empty()).then(|| value.to_owned())
}

fn get_f64(obj: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<f64> {
    obj.element(tag).ok()?.to_float64().ok()
}

fn get_f64_vec(obj: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<Vec<f64>> {
    obj.element(tag).ok()?.to_multi_float64().ok()
}

fn get_position(obj: &FileDicomObject<InMemDicomObject>) -> Option<Vector3<f64>> {
    match get_f64_vec(obj, tags::IMAGE_POSITION_PATIENT)?.as_slice() {
        [x, y, z] => Some(Vector3::new(*x, *y, *z)),
        _ => None,
    }
}
