use std::{
    fs,
    path::{Path, PathBuf},
};

use dicom::{
    core::{DataElement, PrimitiveValue, VR},
    object::{FileMetaTableBuilder, InMemDicomObject},
};
use dicom_dictionary_std::{tags, uids};
use tracing::{debug, info};

use crate::{
    enums::PixelKind,
    error::{Error, Result},
    metadata::{OutputSeries, SliceRecord, value_representation},
    volume_io::VolumeIoError,
};

/// Writes one `{index:04}.dcm` file per slice of `series` into `dir`.
///
/// Files are explicit VR little endian MR images with 16-bit samples, so the
/// series must already be cast to an integer kind.
pub fn write_series(series: &OutputSeries, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let write_error = |path: &Path, source: VolumeIoError| Error::Write {
        path: path.to_path_buf(),
        source,
    };
    if !series.pixel_kind.is_integer() {
        return Err(write_error(
            dir,
            VolumeIoError::UnsupportedPixelKind(series.pixel_kind),
        ));
    }
    fs::create_dir_all(dir).map_err(|e| write_error(dir, e.into()))?;

    let paths = series
        .slices
        .iter()
        .map(|slice| {
            let path = dir.join(format!("{:04}.dcm", slice.index));
            write_slice(slice, series.pixel_kind, &path).map_err(|e| write_error(&path, e))?;
            Ok(path)
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        dir = %dir.display(),
        slices = paths.len(),
        series_uid = series.series_instance_uid().unwrap_or_default(),
        "wrote DICOM series"
    );
    Ok(paths)
}

fn write_slice(
    slice: &SliceRecord,
    pixel_kind: PixelKind,
    path: &Path,
) -> std::result::Result<(), VolumeIoError> {
    let mut object = InMemDicomObject::new_empty();
    for entry in &slice.tags {
        let vr = value_representation(entry.tag).unwrap_or(VR::LO);
        object.put(DataElement::new(
            entry.tag,
            vr,
            PrimitiveValue::from(entry.value.as_str()),
        ));
    }

    let sop_instance_uid = slice
        .value(tags::SOP_INSTANCE_UID)
        .ok_or_else(|| VolumeIoError::DicomMeta("slice has no SOP Instance UID".into()))?
        .to_owned();
    if slice.value(tags::MODALITY).is_none() {
        object.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("MR"),
        ));
    }
    object.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::MR_IMAGE_STORAGE),
    ));

    let (rows, columns) = slice.pixels.dim();
    let dimension = |n: usize| {
        u16::try_from(n).map_err(|_| VolumeIoError::Malformed(format!("{n} exceeds 65535 pixels")))
    };
    let signed = pixel_kind == PixelKind::I16;
    for (tag, value) in [
        (tags::SAMPLES_PER_PIXEL, 1),
        (tags::ROWS, dimension(rows)?),
        (tags::COLUMNS, dimension(columns)?),
        (tags::BITS_ALLOCATED, 16),
        (tags::BITS_STORED, 16),
        (tags::HIGH_BIT, 15),
        (tags::PIXEL_REPRESENTATION, u16::from(signed)),
    ] {
        object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }
    object.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));

    let bytes: Vec<u8> = slice
        .pixels
        .iter()
        .flat_map(|&v| {
            if signed {
                (v as i16).to_le_bytes()
            } else {
                (v as u16).to_le_bytes()
            }
        })
        .collect();
    object.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(bytes),
    ));

    let file = object
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::MR_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_instance_uid),
        )
        .map_err(|e| VolumeIoError::DicomMeta(e.to_string()))?;
    file.write_to_file(path)?;

    debug!(path = %path.display(), rows, columns, "wrote slice");
    Ok(())
}
