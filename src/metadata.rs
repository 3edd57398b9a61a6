//! Series-level and per-slice identifying tags for the fused output.
//!
//! Nothing here touches the filesystem: [`SeriesSynthesizer::synthesize`]
//! turns a volume plus optional source tags into an [`OutputSeries`], and the
//! series writer encodes that record as files.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use dicom::core::{Tag, VR};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Axis};
use tracing::debug;

use crate::enums::PixelKind;
use crate::error::{Error, Result};
use crate::volume::Volume;

/// Tags read from a source series, keyed by DICOM tag.
pub type SourceTags = BTreeMap<Tag, String>;

/// Root of every UID generated by this crate.
pub const UID_ROOT: &str = "1.2.826.0.1.3680043.2.1125";

pub const DEFAULT_DESCRIPTION: &str = "Created-dicom-superres";

/// Descriptive tags carried over verbatim from the source series when present.
pub const COPIED_TAGS: [Tag; 10] = [
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_ID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::ACCESSION_NUMBER,
    tags::MODALITY,
    tags::FRAME_OF_REFERENCE_UID,
];

const VALUE_REPRESENTATIONS: [(Tag, VR); 23] = [
    (tags::PATIENT_NAME, VR::PN),
    (tags::PATIENT_ID, VR::LO),
    (tags::PATIENT_BIRTH_DATE, VR::DA),
    (tags::STUDY_INSTANCE_UID, VR::UI),
    (tags::STUDY_ID, VR::SH),
    (tags::STUDY_DATE, VR::DA),
    (tags::STUDY_TIME, VR::TM),
    (tags::ACCESSION_NUMBER, VR::SH),
    (tags::MODALITY, VR::CS),
    (tags::FRAME_OF_REFERENCE_UID, VR::UI),
    (tags::SERIES_DATE, VR::DA),
    (tags::SERIES_TIME, VR::TM),
    (tags::IMAGE_TYPE, VR::CS),
    (tags::SERIES_INSTANCE_UID, VR::UI),
    (tags::IMAGE_ORIENTATION_PATIENT, VR::DS),
    (tags::SERIES_DESCRIPTION, VR::LO),
    (tags::PIXEL_SPACING, VR::DS),
    (tags::SLICE_THICKNESS, VR::DS),
    (tags::INSTANCE_CREATION_DATE, VR::DA),
    (tags::INSTANCE_CREATION_TIME, VR::TM),
    (tags::IMAGE_POSITION_PATIENT, VR::DS),
    (tags::INSTANCE_NUMBER, VR::IS),
    (tags::SOP_INSTANCE_UID, VR::UI),
];

/// Value representation of a tag this crate reads or emits.
pub fn value_representation(tag: Tag) -> Option<VR> {
    VALUE_REPRESENTATIONS
        .iter()
        .find(|(known, _)| *known == tag)
        .map(|(_, vr)| *vr)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeriesTag {
    pub tag: Tag,
    pub value: String,
}

impl SeriesTag {
    pub fn new(tag: Tag, value: impl Into<String>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

/// One output slice: its own copy of every tag plus its pixels (`[row, column]`).
#[derive(Clone, Debug)]
pub struct SliceRecord {
    pub index: usize,
    pub tags: Vec<SeriesTag>,
    pub pixels: Array2<f32>,
}

impl SliceRecord {
    pub fn value(&self, tag: Tag) -> Option<&str> {
        find_value(&self.tags, tag)
    }
}

/// Ordered slices of a reconstructed series, ready for the series writer.
#[derive(Clone, Debug)]
pub struct OutputSeries {
    pub series_tags: Vec<SeriesTag>,
    pub slices: Vec<SliceRecord>,
    pub pixel_kind: PixelKind,
}

impl OutputSeries {
    pub fn value(&self, tag: Tag) -> Option<&str> {
        find_value(&self.series_tags, tag)
    }

    pub fn series_instance_uid(&self) -> Option<&str> {
        self.value(tags::SERIES_INSTANCE_UID)
    }
}

fn find_value(tags: &[SeriesTag], tag: Tag) -> Option<&str> {
    tags.iter()
        .find(|entry| entry.tag == tag)
        .map(|entry| entry.value.as_str())
}

/// Builds the tag sets of an output series from a fused volume.
#[derive(Clone, Debug)]
pub struct SeriesSynthesizer {
    description: String,
}

impl Default for SeriesSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_DESCRIPTION)
    }
}

impl SeriesSynthesizer {
    /// `description` marks the series as derived; it is appended to the
    /// source's Series Description, or used alone when there is none.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Produces one record per depth index of `fused`, in increasing order.
    ///
    /// Tags in [`COPIED_TAGS`] are taken from `source_tags` when present and
    /// left out otherwise. `generation_time` drives every generated date, time
    /// and UID; without it no Series Instance UID can be derived.
    pub fn synthesize(
        &self,
        fused: &Volume,
        source_tags: Option<&SourceTags>,
        generation_time: Option<NaiveDateTime>,
    ) -> Result<OutputSeries> {
        let generation_time = generation_time.ok_or(Error::MissingMetadata(
            "generation time for Series Instance UID",
        ))?;
        let date = generation_time.format("%Y%m%d").to_string();
        let time = generation_time.format("%H%M%S").to_string();
        let series_uid = series_instance_uid(generation_time);

        let mut series_tags: Vec<SeriesTag> = source_tags
            .map(|source| {
                COPIED_TAGS
                    .iter()
                    .filter_map(|tag| source.get(tag).map(|value| SeriesTag::new(*tag, value)))
                    .collect()
            })
            .unwrap_or_default();

        let description = match source_tags.and_then(|s| s.get(&tags::SERIES_DESCRIPTION)) {
            Some(source) if !source.trim().is_empty() => {
                format!("{} - {}", source.trim(), self.description)
            }
            _ => self.description.clone(),
        };
        let spacing = fused.spacing();

        series_tags.extend([
            SeriesTag::new(tags::SERIES_DATE, date.clone()),
            SeriesTag::new(tags::SERIES_TIME, time.clone()),
            SeriesTag::new(tags::IMAGE_TYPE, "DERIVED\\SECONDARY"),
            SeriesTag::new(tags::SERIES_INSTANCE_UID, series_uid.clone()),
            SeriesTag::new(tags::IMAGE_ORIENTATION_PATIENT, image_orientation(fused)),
            SeriesTag::new(tags::SERIES_DESCRIPTION, truncate_chars(&description, 64)),
            SeriesTag::new(
                tags::PIXEL_SPACING,
                join_decimals(&[spacing[1], spacing[0]]),
            ),
            SeriesTag::new(tags::SLICE_THICKNESS, format_decimal(spacing[2])),
        ]);

        let (depth, _, _) = fused.dim();
        let slices = (0..depth)
            .map(|index| {
                let mut slice_tags = series_tags.clone();
                let position = fused.index_to_physical([0.0, 0.0, index as f64]);
                slice_tags.extend([
                    SeriesTag::new(tags::INSTANCE_CREATION_DATE, date.clone()),
                    SeriesTag::new(tags::INSTANCE_CREATION_TIME, time.clone()),
                    SeriesTag::new(tags::IMAGE_POSITION_PATIENT, join_decimals(&position)),
                    SeriesTag::new(tags::INSTANCE_NUMBER, index.to_string()),
                    SeriesTag::new(tags::SOP_INSTANCE_UID, format!("{series_uid}.{}", index + 1)),
                ]);
                SliceRecord {
                    index,
                    tags: slice_tags,
                    pixels: fused.data().index_axis(Axis(0), index).to_owned(),
                }
            })
            .collect();

        debug!(%series_uid, slices = depth, "synthesized series metadata");

        Ok(OutputSeries {
            series_tags,
            slices,
            pixel_kind: fused.pixel_kind(),
        })
    }
}

/// `{UID_ROOT}.{YYYYMMDD}.1{HHMMSS}`, unique at one-second granularity.
pub fn series_instance_uid(generation_time: NaiveDateTime) -> String {
    format!(
        "{UID_ROOT}.{}.1{}",
        generation_time.format("%Y%m%d"),
        generation_time.format("%H%M%S")
    )
}

/// First two direction columns (row then column direction cosines).
fn image_orientation(volume: &Volume) -> String {
    let direction = volume.direction();
    let values: Vec<f64> = (0..2)
        .flat_map(|column| (0..3).map(move |row| direction[(row, column)]))
        .collect();
    join_decimals(&values)
}

fn join_decimals(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format_decimal(*v))
        .collect::<Vec<_>>()
        .join("\\")
}

/// Formats a decimal string (DS) value in at most 16 characters.
pub(crate) fn format_decimal(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    let plain = value.to_string();
    if plain.len() <= 16 {
        return plain;
    }
    for precision in (0..=15).rev() {
        let fixed = format!("{value:.precision$}");
        let trimmed = if fixed.contains('.') {
            fixed.trim_end_matches('0').trim_end_matches('.')
        } else {
            fixed.as_str()
        };
        if trimmed.len() <= 16 {
            return if trimmed == "-0" {
                "0".to_owned()
            } else {
                trimmed.to_owned()
            };
        }
    }
    format!("{value:.6e}")
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Hands out generation timestamps at one-second resolution, each strictly
/// later than the previous one, so UIDs generated in one run never collide.
#[derive(Debug, Default)]
pub struct GenerationClock {
    last: Option<NaiveDateTime>,
}

impl GenerationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> NaiveDateTime {
        self.issue(Local::now().naive_local())
    }

    fn issue(&mut self, now: NaiveDateTime) -> NaiveDateTime {
        let now = now.with_nanosecond(0).unwrap_or(now);
        let stamp = match self.last {
            Some(last) if now <= last => last + TimeDelta::seconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use nalgebra::Matrix3;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn fused(direction: Matrix3<f64>, spacing: [f64; 3]) -> Volume {
        Volume::filled(
            [3, 2, 6],
            5.0,
            spacing,
            [-12.5, 30.0, 101.25],
            direction,
            PixelKind::I16,
        )
        .unwrap()
    }

    fn source() -> SourceTags {
        SourceTags::from([
            (tags::PATIENT_NAME, "Doe^Jane".to_owned()),
            (tags::PATIENT_ID, "P-0042".to_owned()),
            (tags::STUDY_INSTANCE_UID, "1.2.3.4".to_owned()),
            (tags::MODALITY, "MR".to_owned()),
            (tags::SERIES_DESCRIPTION, "T2 SAG".to_owned()),
            (tags::REPETITION_TIME, "4000".to_owned()),
        ])
    }

    #[test]
    fn series_uid_is_built_from_generation_time() {
        assert_eq!(
            series_instance_uid(at(7, 8, 9)),
            "1.2.826.0.1.3680043.2.1125.20240305.1070809"
        );
    }

    #[test]
    fn missing_generation_time_is_fatal() {
        let result = SeriesSynthesizer::default().synthesize(
            &fused(Matrix3::identity(), [1.0; 3]),
            Some(&source()),
            None,
        );
        assert!(matches!(result, Err(Error::MissingMetadata(_))));
    }

    #[test]
    fn copied_tags_are_verbatim_and_never_fabricated() {
        let source = source();
        let series = SeriesSynthesizer::default()
            .synthesize(
                &fused(Matrix3::identity(), [1.0; 3]),
                Some(&source),
                Some(at(10, 0, 0)),
            )
            .unwrap();

        for tag in COPIED_TAGS {
            assert_eq!(
                series.value(tag),
                source.get(&tag).map(String::as_str),
                "tag {tag}"
            );
        }
        assert_eq!(series.value(tags::REPETITION_TIME), None);
        assert_eq!(series.value(tags::PATIENT_BIRTH_DATE), None);
    }

    #[test]
    fn no_source_tags_still_yields_generated_tags() {
        let series = SeriesSynthesizer::default()
            .synthesize(
                &fused(Matrix3::identity(), [1.0; 3]),
                None,
                Some(at(10, 0, 0)),
            )
            .unwrap();
        assert!(COPIED_TAGS.iter().all(|tag| series.value(*tag).is_none()));
        assert_eq!(series.value(tags::SERIES_DESCRIPTION), Some(DEFAULT_DESCRIPTION));
        assert_eq!(series.value(tags::IMAGE_TYPE), Some("DERIVED\\SECONDARY"));
        assert_eq!(series.value(tags::SERIES_DATE), Some("20240305"));
        assert_eq!(series.value(tags::SERIES_TIME), Some("100000"));
    }

    #[test]
    fn description_is_appended_to_source_description() {
        let series = SeriesSynthesizer::new("fused mean")
            .synthesize(
                &fused(Matrix3::identity(), [1.0; 3]),
                Some(&source()),
                Some(at(10, 0, 0)),
            )
            .unwrap();
        assert_eq!(
            series.value(tags::SERIES_DESCRIPTION),
            Some("T2 SAG - fused mean")
        );
    }

    #[test]
    fn orientation_lists_first_two_direction_columns() {
        let sagittal = Matrix3::new(0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, -1.0, 0.0);
        let series = SeriesSynthesizer::default()
            .synthesize(&fused(sagittal, [1.0; 3]), None, Some(at(10, 0, 0)))
            .unwrap();
        assert_eq!(
            series.value(tags::IMAGE_ORIENTATION_PATIENT),
            Some("0\\1\\0\\0\\0\\-1")
        );
    }

    #[test]
    fn slices_carry_positions_instance_numbers_and_series_tags() {
        let volume = fused(Matrix3::identity(), [0.5, 0.25, 1.5]);
        let series = SeriesSynthesizer::default()
            .synthesize(&volume, Some(&source()), Some(at(10, 0, 0)))
            .unwrap();

        assert_eq!(series.slices.len(), 6);
        assert_eq!(series.value(tags::PIXEL_SPACING), Some("0.25\\0.5"));
        assert_eq!(series.value(tags::SLICE_THICKNESS), Some("1.5"));
        for (i, slice) in series.slices.iter().enumerate() {
            assert_eq!(slice.index, i);
            assert_eq!(slice.value(tags::INSTANCE_NUMBER), Some(i.to_string().as_str()));
            assert_eq!(slice.pixels.dim(), (2, 3));
            for tag in &series.series_tags {
                assert_eq!(slice.value(tag.tag), Some(tag.value.as_str()));
            }
        }
        assert_eq!(
            series.slices[2].value(tags::IMAGE_POSITION_PATIENT),
            Some("-12.5\\30\\104.25")
        );
        assert_eq!(
            series.slices[0].value(tags::SOP_INSTANCE_UID),
            Some("1.2.826.0.1.3680043.2.1125.20240305.1100000.1")
        );
    }

    fn parse_position(value: &str) -> [f64; 3] {
        let parts: Vec<f64> = value.split('\\').map(|v| v.parse().unwrap()).collect();
        [parts[0], parts[1], parts[2]]
    }

    #[test]
    fn slice_positions_are_strictly_monotonic_through_plane() {
        let (s, c) = (0.3_f64.sin(), 0.3_f64.cos());
        let directions = [
            Matrix3::identity(),
            Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0),
            Matrix3::new(0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, -1.0, 0.0),
            Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c),
        ];
        for direction in directions {
            for spacing in [[1.0; 3], [0.4, 0.4, 0.4], [0.7, 0.9, 3.3]] {
                let volume = fused(direction, spacing);
                let series = SeriesSynthesizer::default()
                    .synthesize(&volume, None, Some(at(9, 30, 0)))
                    .unwrap();
                let normal = direction.column(2);
                let along: Vec<f64> = series
                    .slices
                    .iter()
                    .map(|slice| {
                        let p = parse_position(slice.value(tags::IMAGE_POSITION_PATIENT).unwrap());
                        p[0] * normal[0] + p[1] * normal[1] + p[2] * normal[2]
                    })
                    .collect();
                assert!(
                    along.windows(2).all(|pair| pair[1] > pair[0]),
                    "positions not monotonic: {along:?}"
                );
            }
        }
    }

    #[test]
    fn decimals_fit_sixteen_characters() {
        assert_eq!(format_decimal(1.0), "1");
        assert_eq!(format_decimal(-0.0), "0");
        assert_eq!(format_decimal(0.1 + 0.2), "0.3");
        assert!(format_decimal(-123.456_789_012_345_67).len() <= 16);
        assert!(format_decimal(1e20).len() <= 16);
        assert!(format_decimal(-1.0e-12).len() <= 16);
    }

    #[test]
    fn clock_never_repeats_a_second() {
        let mut clock = GenerationClock::new();
        let first = clock.issue(at(11, 59, 59));
        let second = clock.issue(at(11, 59, 59));
        let third = clock.issue(at(11, 59, 58));
        let later = clock.issue(at(12, 5, 0));
        assert_eq!(first, at(11, 59, 59));
        assert_eq!(second, at(12, 0, 0));
        assert_eq!(third, at(12, 0, 1));
        assert_eq!(later, at(12, 5, 0));
        assert_ne!(series_instance_uid(first), series_instance_uid(second));
    }
}
